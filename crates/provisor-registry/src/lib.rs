//! provisor-registry: the live set of backend nodes.
//!
//! Tracks every node's advertised capacity, the aggregate capacity
//! reserved on it by live instances, and its health. The registry never
//! stores instance lists: reservations are aggregates, rebuilt from the
//! instance ledger after a restart.
//!
//! # Architecture
//!
//! ```text
//! NodeRegistry
//!   ├── StateStore (persist NodeRecord on register/heartbeat/health change)
//!   ├── node_id → Mutex<NodeEntry>   (per-node mutual exclusion)
//!   │     └── reserve / release      (compare-and-commit)
//!   └── subscribers                  (HealthEvent fan-out)
//! ```
//!
//! Health transitions (`healthy → suspected → dead`, and back to healthy
//! on heartbeat) are published as [`HealthEvent`]s. Delivery is
//! at-least-once; consumers must apply them idempotently.

pub mod error;
pub mod events;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use events::HealthEvent;
pub use registry::{NodeAnnouncement, NodeRegistry, NodeView, RegistryConfig, ReserveRejected};
