//! The activity engine: an undo-logged operation executor.
//!
//! Every side effect the agent performs during a state transition is wrapped
//! as an **activity**: a typed, serializable payload pair carrying the
//! forward action and its inverse, executed through a registered
//! [`ActivityHandler`]. Completed steps are journaled to the embedded store
//! before they count as committed, so an interrupted transition can be
//! undone on the next start.
//!
//! # Flow
//!
//! ```text
//! StartTransaction ──▶ ExecuteActivity* ──▶ FinishTransaction(ok)   ─▶ journal deleted
//!                          │                FinishTransaction(err)  ─▶ rollback (reverse order)
//!                          └─ AddCheckPoint seals the steps before it
//! ```
//!
//! In-process mutations that cannot be durably encoded go through
//! [`ActivityService::execute_fn`]; their undo runs during rollback but does
//! not survive a crash.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod handlers;
pub mod service;
pub mod shell;
pub mod transaction;

pub use error::{ActivityError, Result};
pub use handlers::ActivityHandler;
pub use service::{ActivityService, ServiceOptions};
pub use shell::{Shell, SystemShell};
pub use transaction::{
    JournalRecord, RollbackStrategy, StepRecord, Transaction, TransactionOptions,
};
