//! Core types for the edgelink edge-device agent.
//!
//! This crate provides the foundational types used throughout the agent:
//!
//! - **App states**: the seven operational phases of the device
//! - **Transitions**: typed commands that drive the app-state controller
//! - **Device roles**: CPE and hub behavior branching
//! - **Environment**: process environment parsed at startup
//! - **Constants**: message-bus subjects, websocket methods, filesystem paths
//!
//! # Example
//!
//! ```
//! use edgelink_core::{AppState, Transition};
//!
//! let t = Transition::OnReset;
//! assert_eq!(t.target(), AppState::Reset);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod consts;
pub mod env;
pub mod error;
pub mod state;

pub use env::AgentEnv;
pub use error::{CoreError, Result};
pub use state::{AppState, DeviceRole, Transition};
