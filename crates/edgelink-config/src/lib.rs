//! Device configuration service.
//!
//! The config service is the sole authority for persisted device
//! configuration. [`ConfigService::update_config_with_tx`] diffs the partial
//! config against the stored one, drives the registered rule generators, and
//! persists the touched sections through an `update_store_section` activity
//! so the write itself becomes a rollback step.
//!
//! ```text
//! partial ──diff──▶ generators (in declared order) ──▶ store write activity
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod generator;
pub mod section_activity;
pub mod service_merge;

pub use error::{ConfigError, Result};
pub use generator::{RuleGenerator, UpdateOptions};
pub use section_activity::UpdateStoreSectionHandler;
pub use service_merge::{CliServiceHandler, ServiceHandler, ServiceMergeGenerator};

use std::sync::Arc;

use serde_json::{Map, Value};

use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Transaction};
use edgelink_store::{DeviceConfig, SectionKind, Store};

/// The process-wide configuration service.
///
/// The generator list is fixed at startup; ordering encodes dependency
/// priority. Updates are serialized by an async lock so concurrent callers
/// observe a total order of writes.
pub struct ConfigService {
    store: Arc<dyn Store>,
    activity: Arc<ActivityService>,
    generators: Vec<Arc<dyn RuleGenerator>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigService {
    /// Build the service with its generator chain.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        activity: Arc<ActivityService>,
        generators: Vec<Arc<dyn RuleGenerator>>,
    ) -> Self {
        Self {
            store,
            activity,
            generators,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read the full device configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the store read fails.
    pub fn get_config(&self) -> Result<DeviceConfig> {
        Ok(self.store.read_config()?)
    }

    /// Apply a partial configuration inside a transaction.
    ///
    /// Non-empty sections of `partial` replace their stored counterparts.
    /// Unless [`UpdateOptions::skip_generators`] is set, every registered
    /// generator sees `(old, new)` before the write lands; the write itself
    /// is journaled with the previous section values as its undo payload.
    ///
    /// # Errors
    ///
    /// Returns an error when a generator fails or the store write fails; the
    /// transaction is left for rollback.
    pub async fn update_config_with_tx(
        &self,
        tx: &Transaction,
        partial: &DeviceConfig,
        options: UpdateOptions,
    ) -> Result<()> {
        let touched = partial.touched_sections();
        if touched.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;

        let old = self.store.read_config()?;
        let mut new = old.clone();
        new.merge_from(partial)?;

        if !options.skip_generators {
            for generator in &self.generators {
                generator
                    .apply(&old, &new, tx)
                    .await
                    .map_err(|e| match e {
                        ConfigError::Generator { .. } => e,
                        other => ConfigError::Generator {
                            name: generator.name(),
                            message: other.to_string(),
                        },
                    })?;
            }
        }

        let (forward, undo) = section_payloads(&old, partial, &touched);
        self.activity
            .execute_activity(
                tx,
                tags::UPDATE_STORE_SECTION,
                "persist config sections",
                forward,
                undo,
            )
            .await?;

        tracing::debug!(sections = ?touched, "config sections updated");
        Ok(())
    }

    /// Write sections directly, outside any transaction and without
    /// generators.
    ///
    /// Reserved for observations (the publisher recording the orchestrator
    /// it bound to), not for commanded changes.
    ///
    /// # Errors
    ///
    /// Returns an error when the store write fails.
    pub async fn update_config(&self, partial: &DeviceConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let sections: Vec<(SectionKind, Option<Value>)> = partial
            .touched_sections()
            .into_iter()
            .map(|kind| (kind, partial.section_value(kind)))
            .collect();
        self.store.write_sections(&sections)?;
        Ok(())
    }
}

/// Build the forward/undo payloads of the `update_store_section` activity.
fn section_payloads(
    old: &DeviceConfig,
    partial: &DeviceConfig,
    touched: &[SectionKind],
) -> (Value, Value) {
    let mut forward = Map::new();
    let mut undo = Map::new();
    for kind in touched {
        forward.insert(
            kind.as_str().to_string(),
            partial.section_value(*kind).unwrap_or(Value::Null),
        );
        undo.insert(
            kind.as_str().to_string(),
            old.section_value(*kind).unwrap_or(Value::Null),
        );
    }

    (
        Value::Object(Map::from_iter([(
            "sections".to_string(),
            Value::Object(forward),
        )])),
        Value::Object(Map::from_iter([(
            "sections".to_string(),
            Value::Object(undo),
        )])),
    )
}
