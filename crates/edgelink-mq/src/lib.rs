//! Message-bus adapter for the agent.
//!
//! Inbound subjects are served by registered handlers, but a handler only
//! receives messages between `activate_handler` and `deactivate_handler` —
//! each app state enumerates the subjects that must be live while the agent
//! is in it, and the state handlers toggle them through the activity engine
//! so the toggles participate in rollback.
//!
//! The transport is the [`MessageBus`] trait; [`LocalBus`] is the in-process
//! implementation used on the device (the agent, the update manager and the
//! CLI share one broker process locally).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod error;
pub mod response;
pub mod service;

pub use bus::{BusMessage, LocalBus, MessageBus};
pub use error::{MqError, Result};
pub use response::{MqResponse, MqStatus};
pub use service::{MqHandler, MqService};
