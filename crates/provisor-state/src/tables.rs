//! redb table definitions for the provisor state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Every table maps a string key to a JSON document.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node records keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Instance ledger entries keyed by `{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Bindings keyed by `{instance_id}:{binding_id}`.
pub const BINDINGS: JsonTable = TableDefinition::new("bindings");
