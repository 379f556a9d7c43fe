//! Producer tables for SONiC APPL_DB
//!
//! A producer table publishes key/field-value changes for a downstream
//! consumer. [`RedisProducerTable`] writes to Redis and announces each write
//! on the table channel; [`MemoryProducerTable`] keeps everything in process
//! for tests and dry runs.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-8: Transmission Confidentiality - Database communication
//! - AU-3: Content of Audit Records - Database operations logged
//! - SI-7: Software, Firmware, and Information Integrity - Atomic per-key updates

use crate::error::Result;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, instrument};

/// APPL_DB table of routes
pub const APP_ROUTE_TABLE_NAME: &str = "ROUTE_TABLE";

/// APPL_DB table of neighbors
pub const APP_NEIGH_TABLE_NAME: &str = "NEIGH_TABLE";

/// Field/value pairs of one table entry.
pub type FieldValues = Vec<(String, String)>;

/// Downstream table boundary.
///
/// One call per logical change; callers preserve dispatch order.
pub trait ProducerTable {
    fn name(&self) -> &str;

    /// Replace the entry at `key` with `fvs`.
    fn set(&mut self, key: &str, fvs: &[(String, String)]) -> Result<()>;

    fn del(&mut self, key: &str) -> Result<()>;
}

impl<T: ProducerTable + ?Sized> ProducerTable for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn set(&mut self, key: &str, fvs: &[(String, String)]) -> Result<()> {
        (**self).set(key, fvs)
    }

    fn del(&mut self, key: &str) -> Result<()> {
        (**self).del(key)
    }
}

/// Redis-backed producer table
///
/// # NIST Controls
/// - SC-23: Session Authenticity - One established session per table
pub struct RedisProducerTable {
    table: String,
    channel: String,
    connection: redis::Connection,
}

impl RedisProducerTable {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`) for `table`.
    #[instrument(skip_all, fields(table = %table))]
    pub fn connect(url: &str, table: &str) -> Result<Self> {
        debug!(url, "Connecting producer table");
        let client = redis::Client::open(url)?;
        let connection = client.get_connection()?;
        Ok(Self::with_connection(connection, table))
    }

    pub fn with_connection(connection: redis::Connection, table: &str) -> Self {
        Self {
            table: table.to_string(),
            channel: format!("{}_CHANNEL", table),
            connection,
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.table, key)
    }
}

impl ProducerTable for RedisProducerTable {
    fn name(&self) -> &str {
        &self.table
    }

    fn set(&mut self, key: &str, fvs: &[(String, String)]) -> Result<()> {
        let redis_key = self.redis_key(key);
        debug!(key = %redis_key, fields = fvs.len(), "Setting entry");

        let mut pipe = redis::pipe();
        pipe.atomic().del(&redis_key).ignore();
        if !fvs.is_empty() {
            pipe.hset_multiple(&redis_key, fvs).ignore();
        }
        pipe.publish(&self.channel, key).ignore();
        let _: () = pipe.query(&mut self.connection)?;
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<()> {
        let redis_key = self.redis_key(key);
        debug!(key = %redis_key, "Deleting entry");

        let _: () = redis::pipe()
            .atomic()
            .del(&redis_key)
            .ignore()
            .publish(&self.channel, key)
            .ignore()
            .query(&mut self.connection)?;
        Ok(())
    }
}

/// One recorded producer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    Set { key: String, fvs: FieldValues },
    Del { key: String },
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, FieldValues>,
    ops: Vec<TableOp>,
}

/// In-memory producer table.
///
/// Clones share state, so a test can keep one handle while a handler owns
/// another.
#[derive(Debug, Clone)]
pub struct MemoryProducerTable {
    name: String,
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryProducerTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Rc::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<FieldValues> {
        self.state.borrow().entries.get(key).cloned()
    }

    /// Value of `field` in the entry at `key`.
    pub fn field(&self, key: &str, field: &str) -> Option<String> {
        self.state
            .borrow()
            .entries
            .get(key)?
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.borrow().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every operation in call order.
    pub fn ops(&self) -> Vec<TableOp> {
        self.state.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }
}

impl ProducerTable for MemoryProducerTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&mut self, key: &str, fvs: &[(String, String)]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.entries.insert(key.to_string(), fvs.to_vec());
        state.ops.push(TableOp::Set {
            key: key.to_string(),
            fvs: fvs.to_vec(),
        });
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.entries.remove(key);
        state.ops.push(TableOp::Del {
            key: key.to_string(),
        });
        Ok(())
    }
}

/// Build a field-value list from string pairs.
pub fn fvs<const N: usize>(pairs: [(&str, &str); N]) -> FieldValues {
    pairs
        .into_iter()
        .map(|(f, v)| (f.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_table_set_and_del() {
        let mut table = MemoryProducerTable::new(APP_ROUTE_TABLE_NAME);
        table
            .set("10.0.0.0/24", &fvs([("nexthop", "10.0.0.1"), ("ifname", "Ethernet0")]))
            .unwrap();
        assert_eq!(table.field("10.0.0.0/24", "ifname").as_deref(), Some("Ethernet0"));

        table.del("10.0.0.0/24").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.ops().len(), 2);
        assert!(matches!(&table.ops()[1], TableOp::Del { key } if key == "10.0.0.0/24"));
    }

    #[test]
    fn test_set_replaces_entry() {
        let mut table = MemoryProducerTable::new(APP_NEIGH_TABLE_NAME);
        table.set("k", &fvs([("a", "1"), ("b", "2")])).unwrap();
        table.set("k", &fvs([("a", "3")])).unwrap();
        assert_eq!(table.get("k"), Some(fvs([("a", "3")])));
        assert_eq!(table.field("k", "b"), None);
    }

    #[test]
    fn test_clones_share_state() {
        let observer = MemoryProducerTable::new("T");
        let mut writer: Box<dyn ProducerTable> = Box::new(observer.clone());
        writer.set("x", &[]).unwrap();
        assert_eq!(observer.keys(), vec!["x".to_string()]);
        assert_eq!(writer.name(), "T");
        observer.clear_ops();
        assert!(observer.ops().is_empty());
    }

    #[test]
    fn test_redis_connect_rejects_bad_url() {
        assert!(RedisProducerTable::connect("not a url", APP_ROUTE_TABLE_NAME).is_err());
    }
}
