//! The `update_store_section` activity handler.
//!
//! Persisting a config update is itself a rollback step: the forward payload
//! carries the new section values, the undo payload the previous ones (with
//! `null` standing for an absent section). Both halves are plain JSON so the
//! write can be undone from the journal after a restart.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use edgelink_activity::handlers::{tags, ActivityHandler};
use edgelink_activity::{ActivityError, Result};
use edgelink_store::{SectionKind, Store};

/// Writes config sections to the embedded store.
pub struct UpdateStoreSectionHandler {
    store: Arc<dyn Store>,
}

impl UpdateStoreSectionHandler {
    /// Create the handler over the store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn apply(&self, payload: &Value) -> Result<()> {
        let sections = payload
            .get("sections")
            .and_then(Value::as_object)
            .ok_or_else(|| ActivityError::Payload {
                activity: tags::UPDATE_STORE_SECTION.to_string(),
                message: "missing sections object".to_string(),
            })?;

        let mut batch: Vec<(SectionKind, Option<Value>)> = Vec::with_capacity(sections.len());
        for (key, value) in sections {
            let kind = SectionKind::parse(key).ok_or_else(|| ActivityError::Payload {
                activity: tags::UPDATE_STORE_SECTION.to_string(),
                message: format!("unknown section: {key}"),
            })?;

            let value = if value.is_null() {
                None
            } else {
                Some(value.clone())
            };
            batch.push((kind, value));
        }

        self.store.write_sections(&batch)?;
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for UpdateStoreSectionHandler {
    fn activity_type(&self) -> &'static str {
        tags::UPDATE_STORE_SECTION
    }

    async fn forward(&self, payload: &Value) -> Result<()> {
        self.apply(payload)
    }

    async fn undo(&self, payload: &Value) -> Result<()> {
        self.apply(payload)
    }
}
