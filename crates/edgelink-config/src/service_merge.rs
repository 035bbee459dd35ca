//! Composite service-merge generator.
//!
//! Service sections (trunk, p2p, bridge, l3, isb, fw, dhcp) hold opaque
//! object lists. When a section changes, its objects are rebuilt: delete
//! handlers run in descending priority so dependent objects disappear before
//! their providers, add handlers in ascending priority so providers exist
//! before their dependents.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use edgelink_activity::handlers::cmd::command_pair;
use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Transaction};
use edgelink_store::{DeviceConfig, SectionKind};

use crate::error::Result;
use crate::generator::RuleGenerator;

/// One service kind's effector inside the merge driver.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// The section this handler owns.
    fn kind(&self) -> SectionKind;

    /// Dependency priority; providers sort lower than their dependents.
    fn priority(&self) -> u32;

    /// Create the section's objects.
    ///
    /// # Errors
    ///
    /// Returning an error fails the surrounding transaction.
    async fn add(&self, objects: &[Value], tx: &Transaction) -> Result<()>;

    /// Remove the section's objects.
    ///
    /// # Errors
    ///
    /// Returning an error fails the surrounding transaction.
    async fn delete(&self, objects: &[Value], tx: &Transaction) -> Result<()>;
}

/// The composite merge driver over the registered service handlers.
pub struct ServiceMergeGenerator {
    handlers: Vec<Arc<dyn ServiceHandler>>,
}

impl ServiceMergeGenerator {
    /// Build the driver; handler order does not matter, priority does.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn ServiceHandler>>) -> Self {
        Self { handlers }
    }
}

fn objects_of(config: &DeviceConfig, kind: SectionKind) -> Vec<Value> {
    config
        .section_value(kind)
        .and_then(|v| v.get("objects").cloned())
        .and_then(|v| match v {
            Value::Array(objects) => Some(objects),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl RuleGenerator for ServiceMergeGenerator {
    fn name(&self) -> &'static str {
        "service_merge"
    }

    async fn apply(&self, old: &DeviceConfig, new: &DeviceConfig, tx: &Transaction) -> Result<()> {
        let mut ordered = self.handlers.clone();
        ordered.sort_by_key(|handler| handler.priority());

        let changed = |kind: SectionKind| old.section_value(kind) != new.section_value(kind);

        // dependents first
        for handler in ordered.iter().rev() {
            let kind = handler.kind();
            if !changed(kind) {
                continue;
            }
            let old_objects = objects_of(old, kind);
            if !old_objects.is_empty() {
                handler.delete(&old_objects, tx).await?;
            }
        }

        // providers first
        for handler in &ordered {
            let kind = handler.kind();
            if !changed(kind) {
                continue;
            }
            let new_objects = objects_of(new, kind);
            if !new_objects.is_empty() {
                handler.add(&new_objects, tx).await?;
            }
        }

        Ok(())
    }
}

/// A service handler that drives the external service CLI.
///
/// Each object becomes an exec-command activity whose undo is the opposite
/// CLI verb, so a rolled-back update removes exactly what it created.
pub struct CliServiceHandler {
    kind: SectionKind,
    priority: u32,
    cli: String,
    activity: Arc<ActivityService>,
}

impl CliServiceHandler {
    /// Create a handler driving `cli` for one service section.
    #[must_use]
    pub fn new(
        kind: SectionKind,
        priority: u32,
        cli: impl Into<String>,
        activity: Arc<ActivityService>,
    ) -> Self {
        Self {
            kind,
            priority,
            cli: cli.into(),
            activity,
        }
    }

    fn object_id(object: &Value) -> String {
        object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn add_command(&self, object: &Value) -> String {
        format!("{} {} add '{}'", self.cli, self.kind, object)
    }

    fn delete_command(&self, object: &Value) -> String {
        format!("{} {} del {}", self.cli, self.kind, Self::object_id(object))
    }
}

#[async_trait]
impl ServiceHandler for CliServiceHandler {
    fn kind(&self) -> SectionKind {
        self.kind
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn add(&self, objects: &[Value], tx: &Transaction) -> Result<()> {
        for object in objects {
            let (forward, undo) =
                command_pair(&self.add_command(object), &self.delete_command(object));
            self.activity
                .execute_activity(
                    tx,
                    tags::EXEC_COMMAND,
                    &format!("add {} object", self.kind),
                    forward,
                    undo,
                )
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, objects: &[Value], tx: &Transaction) -> Result<()> {
        for object in objects {
            let (forward, undo) =
                command_pair(&self.delete_command(object), &self.add_command(object));
            self.activity
                .execute_activity(
                    tx,
                    tags::EXEC_COMMAND,
                    &format!("delete {} object", self.kind),
                    forward,
                    undo,
                )
                .await?;
        }
        Ok(())
    }
}
