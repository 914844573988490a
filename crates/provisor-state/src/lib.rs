//! provisor-state: durable state for the provisioning control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the advertised node
//! records, the instance ledger entries and the bindings issued against
//! provisioned instances.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutation commits in its own write transaction, so each key is
//! updated atomically. [`StateStore::update_instance`] runs a
//! read-validate-write cycle inside a single transaction; redb admits one
//! writer at a time, which serializes concurrent transitions of an instance.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
