//! Orchestrator connection supervision.
//!
//! Three pieces cooperate to keep the agent attached to the primary
//! orchestrator:
//!
//! - [`DiscoveryService`] probes every candidate URL in parallel and picks
//!   the single `primary`, flagging split-brain when two claim the role
//! - [`Publisher`] owns the websocket: dialing, the ping keepalive,
//!   request/response correlation and inbound dispatch
//! - [`DiscoveryMonitor`] re-probes on an interval and tears the connection
//!   down when the primary moved or split-brain is detected
//!
//! The publisher is an activity-controlled resource: the state handlers
//! start and stop it through `execute_fn` pairs so the toggle participates
//! in transaction rollback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod discovery;
pub mod envelope;
pub mod error;
pub mod monitor;
pub mod publisher;

pub use discovery::{DiscoveryService, HttpProbeClient, ProbeClient};
pub use envelope::{ConnectionState, ResponseParams, WsEnvelope};
pub use error::{ConnError, Result};
pub use monitor::{DiscoveryMonitor, ReconnectSignal};
pub use publisher::{Publisher, RequestOptions, WsRouteHandler};
