//! `RocksDB` storage implementation.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::schema::{all_column_families, cf};
use crate::types::{DeviceConfig, SectionKind};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }
}

impl Store for RocksStore {
    fn read_config(&self) -> Result<DeviceConfig> {
        let cf_sections = self.cf(cf::SECTIONS)?;

        let mut config = DeviceConfig::default();
        for kind in SectionKind::ALL {
            let data = self
                .db
                .get_cf(&cf_sections, kind.as_str())
                .map_err(|e| StoreError::Database(e.to_string()))?;

            if let Some(bytes) = data {
                let value: Value = serde_json::from_slice(&bytes)?;
                config.set_section_value(kind, Some(value))?;
            }
        }

        Ok(config)
    }

    fn write_sections(&self, sections: &[(SectionKind, Option<Value>)]) -> Result<()> {
        let cf_sections = self.cf(cf::SECTIONS)?;

        let mut batch = WriteBatch::default();
        for (kind, value) in sections {
            match value {
                Some(v) => {
                    let bytes = serde_json::to_vec(v)?;
                    batch.put_cf(&cf_sections, kind.as_str(), bytes);
                }
                None => batch.delete_cf(&cf_sections, kind.as_str()),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn put_journal(&self, id: &str, record: &[u8]) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        self.db
            .put_cf(&cf_tx, id, record)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_journal(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        self.db
            .get_cf(&cf_tx, id)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_journals(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;

        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf_tx, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let id = String::from_utf8_lossy(&key).into_owned();
            records.push((id, value.into_vec()));
        }

        Ok(records)
    }

    fn delete_journal(&self, id: &str) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        self.db
            .delete_cf(&cf_tx, id)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppSection, PortConfig, PortSection};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn fresh_store_has_no_sections() {
        let (store, _dir) = create_test_store();
        let config = store.read_config().unwrap();
        assert!(config.app.is_none());
        assert!(config.touched_sections().is_empty());
    }

    #[test]
    fn section_write_and_read() {
        let (store, _dir) = create_test_store();

        let app = AppSection {
            serial_number: "SN1".into(),
            orchestrator_addrs: vec!["https://orch.local".into()],
            ..AppSection::default()
        };
        store
            .write_sections(&[(SectionKind::App, Some(serde_json::to_value(&app).unwrap()))])
            .unwrap();

        let config = store.read_config().unwrap();
        assert_eq!(config.app.unwrap(), app);
    }

    #[test]
    fn multi_section_write_is_one_batch() {
        let (store, _dir) = create_test_store();

        let port = PortSection {
            port_configs: vec![PortConfig {
                name: "port1".into(),
                port_type: "wan".into(),
                wan: None,
            }],
        };
        store
            .write_sections(&[
                (SectionKind::Port, Some(serde_json::to_value(&port).unwrap())),
                (SectionKind::Trunk, Some(json!({"objects": [{"id": "t1"}]}))),
            ])
            .unwrap();

        let config = store.read_config().unwrap();
        assert_eq!(config.port.unwrap(), port);
        assert_eq!(config.trunk.unwrap().objects.len(), 1);
    }

    #[test]
    fn none_deletes_a_section() {
        let (store, _dir) = create_test_store();

        store
            .write_sections(&[(SectionKind::Fw, Some(json!({"objects": []})))])
            .unwrap();
        assert!(store.read_config().unwrap().fw.is_some());

        store.write_sections(&[(SectionKind::Fw, None)]).unwrap();
        assert!(store.read_config().unwrap().fw.is_none());
    }

    #[test]
    fn journal_crud() {
        let (store, _dir) = create_test_store();

        store.put_journal("tx-1", b"{\"steps\":[]}").unwrap();
        store.put_journal("tx-2", b"{\"steps\":[1]}").unwrap();

        assert_eq!(
            store.get_journal("tx-1").unwrap().unwrap(),
            b"{\"steps\":[]}"
        );

        let all = store.list_journals().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "tx-1");

        store.delete_journal("tx-1").unwrap();
        assert!(store.get_journal("tx-1").unwrap().is_none());
        assert_eq!(store.list_journals().unwrap().len(), 1);
    }
}
