//! The `boot` state: initial, pre-recovery, no behavior of its own.

use std::sync::Arc;

use async_trait::async_trait;

use edgelink_activity::Transaction;
use edgelink_core::{AppState, Transition};

use crate::error::Result;
use crate::handlers::StateHandler;

/// Handler of the initial `boot` state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootStateHandler;

impl BootStateHandler {
    /// Create the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateHandler for BootStateHandler {
    fn state_id(&self) -> AppState {
        AppState::Boot
    }

    fn validate_transition(&self, _from: AppState) -> Result<()> {
        Ok(())
    }

    async fn handle(
        &self,
        _tx: &Arc<Transaction>,
        _transition: &Transition,
    ) -> Result<Option<Transition>> {
        Ok(None)
    }

    async fn on_exit(&self, _tx: &Arc<Transaction>, _transition: &Transition) -> Result<()> {
        Ok(())
    }
}
