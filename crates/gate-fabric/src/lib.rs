//! Compute Fabric Client
//!
//! Authenticated access to the virtualization cluster control plane, plus the
//! completion watcher that follows asynchronous jobs to a terminal state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       gate-fabric                            │
//! │                                                              │
//! │  ┌──────────────────┐        ┌───────────────────────────┐  │
//! │  │   FabricClient   │◄───────│        JobWatcher         │  │
//! │  │ cookies | token  │  poll  │ sync | UPID ──► stopped   │  │
//! │  │ root (on demand) │        │          OK ─► 200        │  │
//! │  └────────┬─────────┘        │        else ─► 500        │  │
//! │           │                  └───────────────────────────┘  │
//! └───────────┼──────────────────────────────────────────────────┘
//!             ▼
//!     cluster control plane (/api2/json)
//! ```

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

pub mod client;
pub mod job;

// Re-exports
pub use client::{FabricClient, FabricResponse, Ticket};
pub use job::{Completion, JobHandle, JobWatcher};
pub use reqwest::Method;

// =============================================================================
// Configuration
// =============================================================================

/// Fabric connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Base URL of the control plane, e.g. `https://pve1:8006`
    pub url: String,
    /// Root account used for elevated calls
    pub root: Option<RootLogin>,
    /// Service token used for elevated calls; preferred over `root`
    pub token: Option<ServiceToken>,
    /// Request timeout
    pub timeout_secs: u64,
    /// Accept self-signed control plane certificates
    pub accept_invalid_certs: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006".to_string(),
            root: None,
            token: None,
            timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

/// Root account credentials
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootLogin {
    /// User name including realm
    pub username: String,
    /// Password
    pub password: String,
}

/// Long-lived API token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceToken {
    /// Token id (`user@realm!name`)
    pub id: String,
    /// Token secret
    pub secret: String,
}

/// Fabric client construction error
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}
