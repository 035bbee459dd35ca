//! The activity service: transaction lifecycle, journal writes, rollback and
//! dangling-transaction recovery.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use edgelink_store::Store;

use crate::error::{ActivityError, Result};
use crate::handlers::ActivityHandler;
use crate::transaction::{
    Checkpoint, JournalRecord, RollbackStrategy, Step, StepRecord, Transaction,
    TransactionOptions,
};

/// Service-level options.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Delete the journal record when a transaction finishes cleanly.
    pub delete_finished: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            delete_finished: true,
        }
    }
}

/// The process-wide activity service.
///
/// Constructed once at startup with the full handler set; unknown activity
/// types fail transactions.
pub struct ActivityService {
    store: Arc<dyn Store>,
    handlers: HashMap<&'static str, Arc<dyn ActivityHandler>>,
    options: ServiceOptions,
}

impl ActivityService {
    /// Build the service with its handler registry.
    ///
    /// # Errors
    ///
    /// Returns an error when two handlers claim the same activity type.
    pub fn new(
        store: Arc<dyn Store>,
        handlers: Vec<Arc<dyn ActivityHandler>>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let mut registry: HashMap<&'static str, Arc<dyn ActivityHandler>> = HashMap::new();
        for handler in handlers {
            let tag = handler.activity_type();
            if registry.insert(tag, handler).is_some() {
                return Err(ActivityError::DuplicateHandler(tag.to_string()));
            }
        }

        Ok(Self {
            store,
            handlers: registry,
            options,
        })
    }

    /// Create a transaction and its journal entry.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal write fails.
    pub fn start_transaction(
        &self,
        name: &str,
        options: TransactionOptions,
    ) -> Result<Arc<Transaction>> {
        let tx = Arc::new(Transaction::new(name, options));
        self.persist(&tx)?;

        tracing::debug!(tx_id = %tx.id(), tx_name = %tx.name(), "started transaction");
        Ok(tx)
    }

    /// Run an activity's forward action and journal the completed step.
    ///
    /// On failure nothing is appended; the transaction is left for rollback.
    ///
    /// # Errors
    ///
    /// Returns an error when the activity type is unknown, the forward action
    /// fails, or the journal write fails.
    pub async fn execute_activity(
        &self,
        tx: &Transaction,
        activity_type: &str,
        name: &str,
        forward: Value,
        undo: Value,
    ) -> Result<()> {
        self.ensure_open(tx)?;
        let handler = self
            .handlers
            .get(activity_type)
            .ok_or_else(|| ActivityError::UnknownActivity(activity_type.to_string()))?;

        handler.forward(&forward).await.map_err(|e| match e {
            ActivityError::Payload { .. } => e,
            other => ActivityError::Exec {
                activity: activity_type.to_string(),
                name: name.to_string(),
                message: other.to_string(),
            },
        })?;

        tx.inner.lock().steps.push(Step::Durable(StepRecord {
            activity: activity_type.to_string(),
            name: name.to_string(),
            forward,
            undo,
        }));

        // the step must be durable before the effect counts as committed
        self.persist(tx)?;

        tracing::debug!(tx_id = %tx.id(), step = name, activity = activity_type, "activity committed");
        Ok(())
    }

    /// Run an inline step for an in-process mutation.
    ///
    /// The undo closure runs during rollback but is not crash-recoverable.
    ///
    /// # Errors
    ///
    /// Returns an error when the forward closure fails.
    pub fn execute_fn<F, U>(&self, tx: &Transaction, name: &str, forward: F, undo: U) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), String>,
        U: FnMut() -> std::result::Result<(), String> + Send + 'static,
    {
        self.ensure_open(tx)?;
        forward().map_err(ActivityError::Inline)?;

        tx.inner.lock().steps.push(Step::Inline {
            name: name.to_string(),
            undo: Some(Box::new(undo)),
        });

        Ok(())
    }

    /// Mark a commit point: all preceding steps survive a later rollback.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal write fails.
    pub fn add_checkpoint(&self, tx: &Transaction) -> Result<String> {
        self.ensure_open(tx)?;
        let id = Uuid::new_v4().to_string();
        {
            let mut inner = tx.inner.lock();
            let step_index = inner.steps.len();
            let durable_index = inner
                .steps
                .iter()
                .filter(|step| matches!(step, Step::Durable(_)))
                .count();
            inner.checkpoints.push(Checkpoint {
                id: id.clone(),
                step_index,
                durable_index,
            });
        }
        self.persist(tx)?;

        tracing::debug!(tx_id = %tx.id(), checkpoint = %id, "checkpoint added");
        Ok(id)
    }

    /// Remove a checkpoint, re-enabling rollback of the steps it sealed.
    ///
    /// # Errors
    ///
    /// Returns an error when the checkpoint does not exist or the journal
    /// write fails.
    pub fn delete_checkpoint(&self, tx: &Transaction, checkpoint_id: &str) -> Result<()> {
        {
            let mut inner = tx.inner.lock();
            let before = inner.checkpoints.len();
            inner.checkpoints.retain(|cp| cp.id != checkpoint_id);
            if inner.checkpoints.len() == before {
                return Err(ActivityError::CheckpointNotFound(checkpoint_id.to_string()));
            }
        }
        self.persist(tx)
    }

    /// Finalize the transaction.
    ///
    /// With `exec_err == None` the finalization policy applies (journal
    /// deleted). Otherwise every completed step past the last checkpoint is
    /// rolled back in reverse order under the recorded strategy.
    ///
    /// # Errors
    ///
    /// Returns an error when rollback aborts or a journal write fails. The
    /// caller keeps its own execution error; this result only reports the
    /// engine's side.
    pub async fn finish_transaction(
        &self,
        tx: &Transaction,
        exec_err: Option<&str>,
    ) -> Result<()> {
        let (steps, checkpoints) = {
            let mut inner = tx.inner.lock();
            if inner.finished {
                return Err(ActivityError::Finished(tx.id().to_string()));
            }
            inner.finished = true;
            (
                std::mem::take(&mut inner.steps),
                std::mem::take(&mut inner.checkpoints),
            )
        };

        match exec_err {
            None => {
                if self.options.delete_finished {
                    self.store.delete_journal(tx.id())?;
                }
                tracing::debug!(tx_id = %tx.id(), tx_name = %tx.name(), "transaction committed");
                Ok(())
            }
            Some(cause) => {
                tracing::warn!(
                    tx_id = %tx.id(),
                    tx_name = %tx.name(),
                    error = cause,
                    "transaction failed, rolling back"
                );
                self.rollback(tx.id(), tx.strategy(), steps, &checkpoints)
                    .await
            }
        }
    }

    /// Roll back every journal entry left in durable storage.
    ///
    /// Called exactly once at startup, before the app-state controller
    /// begins dispatch. Idempotent across repeated crashes: each successful
    /// rollback deletes its journal entry.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; individual rollback failures are
    /// governed by each transaction's recorded strategy and logged.
    pub async fn recover_dangling(&self) -> Result<()> {
        let journals = self.store.list_journals()?;
        if journals.is_empty() {
            return Ok(());
        }

        tracing::info!(count = journals.len(), "rolling back dangling transactions");
        for (id, bytes) in journals {
            let record: JournalRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(tx_id = %id, error = %e, "undecodable journal record, skipping");
                    continue;
                }
            };

            let tx = Transaction::from_journal(record);
            let (steps, checkpoints) = {
                let mut inner = tx.inner.lock();
                (
                    std::mem::take(&mut inner.steps),
                    std::mem::take(&mut inner.checkpoints),
                )
            };

            if let Err(e) = self
                .rollback(tx.id(), tx.strategy(), steps, &checkpoints)
                .await
            {
                tracing::error!(tx_id = %tx.id(), error = %e, "dangling rollback failed");
            }
        }

        Ok(())
    }

    /// Undo completed steps in reverse order, honoring checkpoints and the
    /// rollback strategy, then drop the journal entry.
    async fn rollback(
        &self,
        tx_id: &str,
        strategy: RollbackStrategy,
        mut steps: Vec<Step>,
        checkpoints: &[Checkpoint],
    ) -> Result<()> {
        let cutoff = checkpoints
            .iter()
            .map(|cp| cp.step_index)
            .max()
            .unwrap_or(0);

        for (index, step) in steps.iter_mut().enumerate().rev() {
            if index < cutoff {
                break;
            }

            let outcome = match step {
                Step::Durable(record) => match self.handlers.get(record.activity.as_str()) {
                    Some(handler) => handler.undo(&record.undo).await,
                    None => Err(ActivityError::UnknownActivity(record.activity.clone())),
                },
                Step::Inline { undo, .. } => match undo.take() {
                    Some(mut f) => f().map_err(ActivityError::Inline),
                    None => Ok(()),
                },
            };

            if let Err(e) = outcome {
                match strategy {
                    RollbackStrategy::AbortOnFail => {
                        tracing::error!(
                            tx_id,
                            step = step.name(),
                            error = %e,
                            "undo failed, aborting rollback"
                        );
                        return Err(ActivityError::RollbackAborted {
                            step: step.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                    RollbackStrategy::SkipOnFail => {
                        tracing::error!(
                            tx_id,
                            step = step.name(),
                            error = %e,
                            "undo failed, continuing rollback"
                        );
                    }
                }
            }
        }

        self.store.delete_journal(tx_id)?;
        tracing::info!(tx_id, "transaction rolled back");
        Ok(())
    }

    fn ensure_open(&self, tx: &Transaction) -> Result<()> {
        if tx.inner.lock().finished {
            return Err(ActivityError::Finished(tx.id().to_string()));
        }
        Ok(())
    }

    fn persist(&self, tx: &Transaction) -> Result<()> {
        let record = tx.snapshot();
        let bytes =
            serde_json::to_vec(&record).map_err(|e| ActivityError::Journal(e.to_string()))?;
        self.store.put_journal(tx.id(), &bytes)?;
        Ok(())
    }
}
