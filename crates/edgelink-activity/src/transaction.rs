//! Transactions, step records and checkpoints.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What rollback does when an individual undo step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Stop rolling back, leaving the remaining steps journaled.
    #[default]
    AbortOnFail,
    /// Log the failure and keep rolling back the remaining steps.
    SkipOnFail,
}

/// Options accepted by `StartTransaction`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Rollback strategy for this transaction.
    pub strategy: RollbackStrategy,
}

impl TransactionOptions {
    /// Options with the skip-on-fail rollback strategy.
    #[must_use]
    pub const fn skip_on_fail() -> Self {
        Self {
            strategy: RollbackStrategy::SkipOnFail,
        }
    }
}

/// A completed, journaled step: both halves are serializable so rollback can
/// run after a restart against the journal alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Activity type tag, resolved against the handler registry.
    pub activity: String,
    /// Human-readable step name for logs.
    pub name: String,
    /// Payload of the forward action.
    pub forward: Value,
    /// Payload of the undo action.
    pub undo: Value,
}

/// Undo half of an inline step; runs during in-process rollback only.
pub(crate) type InlineUndo = Box<dyn FnMut() -> std::result::Result<(), String> + Send>;

/// A step kept in the in-memory transaction.
pub(crate) enum Step {
    /// Journaled step with serializable payloads.
    Durable(StepRecord),
    /// In-process mutation; the closure is its undo.
    Inline {
        /// Step name for logs.
        name: String,
        /// Undo closure, taken when rollback runs it.
        undo: Option<InlineUndo>,
    },
}

impl Step {
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Durable(record) => &record.name,
            Self::Inline { name, .. } => name,
        }
    }
}

/// A checkpoint seals all preceding steps against rollback.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    pub id: String,
    /// Index into the full in-memory step list.
    pub step_index: usize,
    /// Index into the durable subset, used in the journal.
    pub durable_index: usize,
}

/// Checkpoint as persisted in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalCheckpoint {
    /// Checkpoint id.
    pub id: String,
    /// Index into the journaled step list.
    pub step_index: usize,
}

/// The persisted form of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Transaction id, also the journal key.
    pub id: String,
    /// Transaction name for logs.
    pub name: String,
    /// Recorded rollback strategy.
    pub strategy: RollbackStrategy,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completed durable steps, in execution order.
    pub steps: Vec<StepRecord>,
    /// Active checkpoints.
    pub checkpoints: Vec<JournalCheckpoint>,
}

pub(crate) struct TxInner {
    pub steps: Vec<Step>,
    pub checkpoints: Vec<Checkpoint>,
    pub finished: bool,
}

/// A named, journaled unit of atomicity.
///
/// Handlers receive a shared `&Transaction`; step appends are serialized by
/// the interior lock. The transaction itself performs no I/O — the
/// [`crate::ActivityService`] owns the journal writes.
pub struct Transaction {
    id: String,
    name: String,
    strategy: RollbackStrategy,
    created_at: DateTime<Utc>,
    pub(crate) inner: Mutex<TxInner>,
}

impl Transaction {
    pub(crate) fn new(name: &str, options: TransactionOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            strategy: options.strategy,
            created_at: Utc::now(),
            inner: Mutex::new(TxInner {
                steps: Vec::new(),
                checkpoints: Vec::new(),
                finished: false,
            }),
        }
    }

    /// Rebuild a transaction from its journal record for recovery rollback.
    pub(crate) fn from_journal(record: JournalRecord) -> Self {
        let steps: Vec<Step> = record.steps.into_iter().map(Step::Durable).collect();
        let checkpoints = record
            .checkpoints
            .into_iter()
            .map(|cp| Checkpoint {
                id: cp.id,
                step_index: cp.step_index,
                durable_index: cp.step_index,
            })
            .collect();

        Self {
            id: record.id,
            name: record.name,
            strategy: record.strategy,
            created_at: record.created_at,
            inner: Mutex::new(TxInner {
                steps,
                checkpoints,
                finished: false,
            }),
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transaction name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rollback strategy recorded at start.
    #[must_use]
    pub const fn strategy(&self) -> RollbackStrategy {
        self.strategy
    }

    /// Number of completed steps, durable and inline.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.inner.lock().steps.len()
    }

    /// Snapshot the durable state for the journal.
    pub(crate) fn snapshot(&self) -> JournalRecord {
        let inner = self.inner.lock();
        let steps = inner
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::Durable(record) => Some(record.clone()),
                Step::Inline { .. } => None,
            })
            .collect();
        let checkpoints = inner
            .checkpoints
            .iter()
            .map(|cp| JournalCheckpoint {
                id: cp.id.clone(),
                step_index: cp.durable_index,
            })
            .collect();

        JournalRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            strategy: self.strategy,
            created_at: self.created_at,
            steps,
            checkpoints,
        }
    }
}
