//! Resource Accounting & Admission Control
//!
//! Computes per-tenant usage from live cluster state, derives headroom from
//! the tenant's quota record, and approves or denies proposed deltas.
//!
//! # Resource kinds
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬──────────────────────────────┐
//! │ kind     │ usage                        │ headroom                     │
//! ├──────────┼──────────────────────────────┼──────────────────────────────┤
//! │ numeric  │ sum of config values         │ max - used                   │
//! │ storage  │ sum of claimed volume sizes  │ max - used                   │
//! │ list     │ names of attached devices    │ allow-list minus matches     │
//! └──────────┴──────────────────────────────┴──────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod model;
pub mod usage;
pub mod engine;
pub mod admission;

pub use model::{Quantity, QuantityMap, QuotaRecord, ResourceCatalog, ResourceDelta, ResourceKind, VmidRange};
pub use usage::UsageSnapshot;
pub use engine::{evaluate, AccountingEngine, ResourceLine, ResourceReport};
pub use admission::{AdmissionGuard, AdmissionLocks};
