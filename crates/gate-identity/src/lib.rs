//! Identity backends and aggregation
//!
//! Backends declare a capability set and hand out the matching contract.
//! The aggregator walks a realm's backends in configured order.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      IdentityAggregator                        │
//! │   realm "corp" ──► [ldap, local]       sessions ──► [fabric]   │
//! └──────────┬──────────────────┬──────────────────────┬───────────┘
//!            │                  │                      │
//!   ┌────────▼────────┐ ┌───────▼────────┐ ┌───────────▼──────────┐
//!   │ RemoteDirectory │ │ LocalDirectory │ │ FabricSession        │
//!   │ session + users │ │ users + groups │ │ session              │
//!   └────────┬────────┘ └───────┬────────┘ └───────────┬──────────┘
//!            ▼                  ▼                      ▼
//!     directory service   DocumentStore         compute fabric
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod store;
pub mod local;
pub mod remote;
pub mod fabric;
pub mod aggregator;

pub use backend::{
    Attributes, Backend, Capabilities, DirectoryBackend, OpResult, PendingChange, SessionBackend, SessionResult,
};
pub use store::{DocumentStore, GroupRecord, IdentityDocument, JsonFileStore, MemoryStore, StoreError, StoreResult};
pub use local::LocalDirectoryBackend;
pub use remote::RemoteDirectoryBackend;
pub use fabric::FabricSessionBackend;
pub use aggregator::{merge_first_wins, IdentityAggregator, QUOTA_ATTRIBUTE};
