//! Client Synchronization Scheduler
//!
//! Pushes a payload-free `sync` marker to WebSocket clients whenever the part
//! of the cluster they care about changes. Clients negotiate how often they
//! are willing to be woken; the hub ticks at the lowest negotiated rate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           SyncHub                               │
//! │                                                                 │
//! │   tenant ─► {socket}      pool ─► {tenant}      socket ─► rate  │
//! │                                                                 │
//! │   timer (phase, period) ──► tick ──► listing ──► diff(previous) │
//! │                                                   │             │
//! │                     node changed ─► every tenant  │             │
//! │                     vm changed   ─► pool tenants ◄┘             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All three indices and the timer are owned by one task; nothing else
//! touches them.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

pub mod state;
pub mod scheduler;
pub mod hub;

pub use state::{filter_listing, state_hash, ClusterEntry, Snapshot};
pub use scheduler::{RateOutcome, SchedulerCore, SocketId, Timer};
pub use hub::{parse_command, ClientCommand, ClusterSource, Subscription, SyncHandle, SyncHub};

/// Sync result type
pub type SyncResult<T> = Result<T, SyncError>;

/// Negotiable rate bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fastest rate a client may request
    pub min_rate_secs: u64,
    /// Slowest rate a client may request
    pub max_rate_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_rate_secs: 1,
            max_rate_secs: 600,
        }
    }
}

impl SyncConfig {
    /// Bounds must satisfy `1 <= min <= max`
    pub fn validate(&self) -> SyncResult<()> {
        if self.min_rate_secs == 0 || self.min_rate_secs > self.max_rate_secs {
            return Err(SyncError::InvalidBounds {
                min: self.min_rate_secs,
                max: self.max_rate_secs,
            });
        }
        Ok(())
    }
}

/// Sync errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Requested rate outside the configured bounds
    #[error("rate {requested}s outside [{min}s, {max}s]")]
    RateOutOfRange {
        /// Requested seconds
        requested: u64,
        /// Minimum seconds
        min: u64,
        /// Maximum seconds
        max: u64,
    },

    /// Configured rate bounds are unusable
    #[error("invalid rate bounds [{min}s, {max}s]: need 1 <= min <= max")]
    InvalidBounds {
        /// Minimum seconds
        min: u64,
        /// Maximum seconds
        max: u64,
    },

    /// Unrecognized client command
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Socket not registered
    #[error("unknown socket {0}")]
    UnknownSocket(u64),

    /// Hub task is gone
    #[error("sync hub closed")]
    HubClosed,

    /// Cluster listing failed
    #[error("cluster listing failed: {0}")]
    Source(String),
}
