//! provisor instance ledger.
//!
//! The durable record of every service instance, its hosting node and its
//! lifecycle state. Each transition is validated and written inside one
//! redb write transaction, so concurrent transitions of an instance are
//! serialized and a state never moves backwards along
//! `pending → provisioned → unprovisioning → gone`.
//!
//! The ledger also owns the link between instance lifecycle and node
//! capacity: when an instance leaves the live set its reservation is handed
//! back to the [`NodeRegistry`](provisor_registry::NodeRegistry).

pub mod error;
pub mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use ledger::InstanceLedger;
