//! The rule-generator contract.

use async_trait::async_trait;

use edgelink_activity::Transaction;
use edgelink_store::DeviceConfig;

use crate::error::Result;

/// Options accepted by `update_config_with_tx`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Bypass the generator chain; only persist the sections.
    pub skip_generators: bool,
}

impl UpdateOptions {
    /// Options that bypass the generator chain.
    #[must_use]
    pub const fn skip_generators() -> Self {
        Self {
            skip_generators: true,
        }
    }
}

/// A pluggable effector translating a config diff into activities.
///
/// Generators never perform I/O outside the activity discipline: every
/// observable effect goes through the transaction so it is undone on
/// rollback. The core treats each generator opaquely; the list is fixed at
/// startup and its order encodes dependency priority.
#[async_trait]
pub trait RuleGenerator: Send + Sync {
    /// Generator name for logs and error context.
    fn name(&self) -> &'static str;

    /// React to the configuration moving from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returning an error fails the surrounding transaction.
    async fn apply(&self, old: &DeviceConfig, new: &DeviceConfig, tx: &Transaction) -> Result<()>;
}
