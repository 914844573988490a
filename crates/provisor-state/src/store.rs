//! StateStore: redb-backed persistence for the provisioning control plane.
//!
//! Provides typed CRUD operations over nodes, instances and bindings.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping entries whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete(&self, table_def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    /// List all nodes, ordered by ID.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.scan(NODES, "")
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.delete(NODES, node_id)?;
        debug!(%node_id, existed, "node record deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or overwrite an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &record.id, record)
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, instance_id)
    }

    /// List all instances, ordered by ID.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.scan(INSTANCES, "")
    }

    /// Delete an instance by ID. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        self.delete(INSTANCES, instance_id)
    }

    /// Read, transform and write back one instance inside a single write
    /// transaction.
    ///
    /// `f` receives the current record (if any) and returns the record to
    /// store, or `None` to delete the entry. An error from `f`, or a result
    /// equal to the current record, aborts the transaction without writing
    /// anything.
    pub fn update_instance<F, E>(&self, instance_id: &str, f: F) -> Result<Option<InstanceRecord>, E>
    where
        F: FnOnce(Option<InstanceRecord>) -> Result<Option<InstanceRecord>, E>,
        E: From<StateError>,
    {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StateError::Transaction(e.to_string()))?;
        let next = {
            let mut table = txn
                .open_table(INSTANCES)
                .map_err(|e| StateError::Table(e.to_string()))?;
            let current: Option<InstanceRecord> = match table
                .get(instance_id)
                .map_err(|e| StateError::Read(e.to_string()))?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .map_err(|e| StateError::Deserialize(e.to_string()))?,
                ),
                None => None,
            };

            let next = f(current.clone())?;
            if next == current {
                drop(table);
                txn.abort()
                    .map_err(|e| StateError::Transaction(e.to_string()))?;
                return Ok(next);
            }
            match &next {
                Some(record) => {
                    let bytes = serde_json::to_vec(record)
                        .map_err(|e| StateError::Serialize(e.to_string()))?;
                    table
                        .insert(instance_id, bytes.as_slice())
                        .map_err(|e| StateError::Write(e.to_string()))?;
                }
                None => {
                    table
                        .remove(instance_id)
                        .map_err(|e| StateError::Write(e.to_string()))?;
                }
            }
            next
        };
        txn.commit()
            .map_err(|e| StateError::Transaction(e.to_string()))?;
        Ok(next)
    }

    // ── Bindings ───────────────────────────────────────────────────

    /// Insert or update a binding.
    pub fn put_binding(&self, binding: &BindingRecord) -> StateResult<()> {
        self.put(BINDINGS, &binding.table_key(), binding)
    }

    /// Get a binding by instance and binding ID.
    pub fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> StateResult<Option<BindingRecord>> {
        self.get(BINDINGS, &binding_key(instance_id, binding_id))
    }

    /// List all bindings of an instance.
    pub fn list_bindings_for_instance(&self, instance_id: &str) -> StateResult<Vec<BindingRecord>> {
        self.scan(BINDINGS, &format!("{instance_id}:"))
    }

    /// Delete one binding. Returns true if it existed.
    pub fn delete_binding(&self, instance_id: &str, binding_id: &str) -> StateResult<bool> {
        self.delete(BINDINGS, &binding_key(instance_id, binding_id))
    }

    /// Delete all bindings of an instance. Returns number deleted.
    pub fn delete_bindings_for_instance(&self, instance_id: &str) -> StateResult<u32> {
        let prefix = format!("{instance_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            address: "10.0.0.1:9400".to_string(),
            capacity: Attributes::from([(MEMORY, 1024), (DISK, 10_000)]),
            health: NodeHealth::Healthy,
            last_heartbeat: 1000,
        }
    }

    fn test_instance(id: &str, node_id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            node_id: node_id.to_string(),
            requester: "app-1".to_string(),
            profile: Attributes::from([(MEMORY, 64)]),
            state: InstanceState::Pending,
            migration_target: None,
            orphan_reason: None,
            residue: false,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_binding(instance_id: &str, id: &str) -> BindingRecord {
        BindingRecord {
            id: id.to_string(),
            instance_id: instance_id.to_string(),
            options: serde_json::json!({ "app": "web" }),
            credentials: serde_json::json!({ "user": "u1", "password": "p1" }),
            created_at: 1000,
        }
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("node-1");

        store.put_node(&node).unwrap();
        assert_eq!(store.get_node("node-1").unwrap(), Some(node));
    }

    #[test]
    fn node_list_is_ordered_by_id() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-b")).unwrap();
        store.put_node(&test_node("node-a")).unwrap();

        let ids: Vec<_> = store.list_nodes().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);
    }

    #[test]
    fn node_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();

        assert!(store.delete_node("node-1").unwrap());
        assert!(!store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Instance CRUD ──────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("redis-1", "node-1");

        store.put_instance(&inst).unwrap();
        assert_eq!(store.get_instance("redis-1").unwrap(), Some(inst));
    }

    #[test]
    fn update_instance_writes_result() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("redis-1", "node-1")).unwrap();

        let updated = store
            .update_instance::<_, StateError>("redis-1", |current| {
                let mut record = current.unwrap();
                record.state = InstanceState::Provisioned;
                Ok(Some(record))
            })
            .unwrap();

        assert_eq!(updated.unwrap().state, InstanceState::Provisioned);
        let stored = store.get_instance("redis-1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Provisioned);
    }

    #[test]
    fn update_instance_none_deletes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("redis-1", "node-1")).unwrap();

        store
            .update_instance::<_, StateError>("redis-1", |_| Ok(None))
            .unwrap();
        assert!(store.get_instance("redis-1").unwrap().is_none());
    }

    #[test]
    fn update_instance_error_leaves_store_untouched() {
        #[derive(Debug)]
        enum Rejected {
            No,
            State(StateError),
        }
        impl From<StateError> for Rejected {
            fn from(e: StateError) -> Self {
                Rejected::State(e)
            }
        }

        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("redis-1", "node-1")).unwrap();

        let result = store.update_instance("redis-1", |_| Err(Rejected::No));
        assert!(matches!(result, Err(Rejected::No)));

        let stored = store.get_instance("redis-1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Pending);
    }

    #[test]
    fn update_instance_unchanged_result_is_not_a_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let original = test_instance("redis-1", "node-1");
        store.put_instance(&original).unwrap();

        let returned = store
            .update_instance::<_, StateError>("redis-1", |current| Ok(current))
            .unwrap();

        assert_eq!(returned.as_ref(), Some(&original));
        assert_eq!(store.get_instance("redis-1").unwrap(), Some(original));

        // Absent stays absent.
        let missing = store
            .update_instance::<_, StateError>("ghost", |current| Ok(current))
            .unwrap();
        assert!(missing.is_none());
        assert!(store.get_instance("ghost").unwrap().is_none());
    }

    #[test]
    fn update_instance_sees_absent_entry() {
        let store = StateStore::open_in_memory().unwrap();

        let created = store
            .update_instance::<_, StateError>("fresh", |current| {
                assert!(current.is_none());
                Ok(Some(test_instance("fresh", "node-2")))
            })
            .unwrap();

        assert_eq!(created.unwrap().node_id, "node-2");
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    // ── Binding CRUD ───────────────────────────────────────────────

    #[test]
    fn bindings_scoped_to_instance() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_binding(&test_binding("redis-1", "b1")).unwrap();
        store.put_binding(&test_binding("redis-1", "b2")).unwrap();
        store.put_binding(&test_binding("redis-10", "b3")).unwrap();

        assert_eq!(store.list_bindings_for_instance("redis-1").unwrap().len(), 2);
        assert_eq!(store.list_bindings_for_instance("redis-10").unwrap().len(), 1);
        assert!(store.get_binding("redis-1", "b2").unwrap().is_some());
    }

    #[test]
    fn delete_bindings_for_instance() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_binding(&test_binding("redis-1", "b1")).unwrap();
        store.put_binding(&test_binding("redis-1", "b2")).unwrap();
        store.put_binding(&test_binding("mysql-1", "b3")).unwrap();

        assert_eq!(store.delete_bindings_for_instance("redis-1").unwrap(), 2);
        assert!(store.list_bindings_for_instance("redis-1").unwrap().is_empty());
        assert!(store.delete_binding("mysql-1", "b3").unwrap());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("provisor.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_node(&test_node("node-1")).unwrap();
            store.put_instance(&test_instance("redis-1", "node-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_node("node-1").unwrap().is_some());
        assert_eq!(store.get_instance("redis-1").unwrap().unwrap().node_id, "node-1");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_bindings_for_instance("any").unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
        assert!(!store.delete_binding("nope", "nope").unwrap());
    }
}
