//! Embedded storage layer for the edgelink agent.
//!
//! This crate provides persistent storage for the section-addressed device
//! configuration and the transaction journal, backed by `RocksDB` with column
//! families:
//!
//! - `sections`: one record per configuration section, keyed by section name
//! - `transactions`: the activity-engine journal, keyed by transaction id
//!
//! All persisted schemas are JSON. A multi-section write is atomic: the
//! batch either lands completely or not at all.
//!
//! # Example
//!
//! ```no_run
//! use edgelink_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/etc/sdwan/agent-config").unwrap();
//! let config = store.read_config().unwrap();
//! assert!(config.app.is_none() || !config.app.unwrap().serial_number.is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AppSection, AppStateSection, DeviceConfig, ObjectsSection, PonySection, PortConfig,
    PortSection, SectionKind, TunnelCluster, Uplink, WanConfig, WanMode,
};

use serde_json::Value;

/// The storage trait behind the config service and the activity engine.
///
/// Implementations must make `write_sections` atomic across the whole batch.
pub trait Store: Send + Sync {
    /// Read the full device configuration; absent sections come back `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read or a section decode fails.
    fn read_config(&self) -> Result<DeviceConfig>;

    /// Write a batch of sections atomically.
    ///
    /// A `None` value deletes the section record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    fn write_sections(&self, sections: &[(SectionKind, Option<Value>)]) -> Result<()>;

    /// Persist a journal record under the given transaction id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    fn put_journal(&self, id: &str, record: &[u8]) -> Result<()>;

    /// Read a journal record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    fn get_journal(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// List every journal record, oldest key first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database iteration fails.
    fn list_journals(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove a journal record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    fn delete_journal(&self, id: &str) -> Result<()>;
}
