//! The edgelink control-plane agent.
//!
//! The agent mediates between a remote orchestrator and the local network
//! stack. Its top-level work units are typed state transitions dispatched by
//! the [`controller::StateService`]; every transition runs inside an
//! activity-engine transaction, so an externally-initiated change is either
//! fully applied or fully undone — including across a crash, via
//! dangling-transaction recovery at startup.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod controller;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod services;
pub mod startup;

pub use controller::StateService;
pub use error::{ControlError, Result};
