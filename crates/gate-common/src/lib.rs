//! fabricgate Common - Shared types for the governance gateway
//!
//! This crate provides the primitives every other gateway crate agrees on:
//! - Tenant identities (`user@realm`)
//! - Credentials presented to the compute fabric
//! - Credential token sets returned by session backends
//! - The request-scoped error taxonomy
//! - Canonical content hashing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         FABRICGATE                               │
//! │                                                                  │
//! │   request ──► Identity ──► Accounting ──► Fabric ──► Completion  │
//! │               Aggregator    Engine        Client     Watcher     │
//! │                                              │                   │
//! │                                              ▼                   │
//! │                                       Sync Scheduler ──► sockets │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod credentials;
pub mod hash;

pub use error::*;
pub use identity::UserId;
pub use credentials::{AuthToken, Credentials, TokenSet};
pub use hash::{canonical_hash, canonicalize};
