//! Sync scheduler state machine
//!
//! Owns the socket indices, the single shared timer and the retained cluster
//! snapshot. Every method takes the current instant explicitly; the hub
//! decides when to call them.

use crate::state::{ClusterEntry, Snapshot};
use crate::{SyncConfig, SyncError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Socket identifier allocated by the hub
pub type SocketId = u64;

/// Per-socket registration
#[derive(Debug, Clone)]
struct Registration {
    tenant: String,
    pool: Option<String>,
    rate: Option<Duration>,
}

/// The shared single-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// Next fire time
    pub deadline: Instant,
    /// Phase reference the fire times are aligned to
    pub phase: Instant,
    /// Nominal interval
    pub period: Duration,
}

/// What a rate request did to the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    /// No timer was running; one was started
    Started,
    /// Running timer was cancelled and restarted at the new rate
    Preempted,
    /// Rate recorded; applies from the next tick
    Stored,
}

/// Scheduler core
#[derive(Debug)]
pub struct SchedulerCore {
    min_rate: Duration,
    max_rate: Duration,
    tenants: HashMap<String, HashSet<SocketId>>,
    pools: HashMap<String, HashSet<String>>,
    sockets: HashMap<SocketId, Registration>,
    timer: Option<Timer>,
    previous: Snapshot,
}

impl SchedulerCore {
    /// Create an idle scheduler
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            min_rate: Duration::from_secs(config.min_rate_secs),
            max_rate: Duration::from_secs(config.max_rate_secs),
            tenants: HashMap::new(),
            pools: HashMap::new(),
            sockets: HashMap::new(),
            timer: None,
            previous: Snapshot::default(),
        }
    }

    /// Current timer, if any
    pub fn timer(&self) -> Option<Timer> {
        self.timer
    }

    /// Next fire time, if a timer is running
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|timer| timer.deadline)
    }

    /// Number of registered sockets
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Register a socket under its tenant and pool
    pub fn register(&mut self, socket: SocketId, tenant: &str, pool: Option<&str>) {
        self.tenants.entry(tenant.to_string()).or_default().insert(socket);
        if let Some(pool) = pool {
            self.pools.entry(pool.to_string()).or_default().insert(tenant.to_string());
        }
        self.sockets.insert(
            socket,
            Registration {
                tenant: tenant.to_string(),
                pool: pool.map(str::to_string),
                rate: None,
            },
        );
    }

    /// Remove a socket from every index; clears the timer once nobody is left
    pub fn deregister(&mut self, socket: SocketId) {
        let Some(registration) = self.sockets.remove(&socket) else {
            return;
        };

        if let Some(sockets) = self.tenants.get_mut(&registration.tenant) {
            sockets.remove(&socket);
            if sockets.is_empty() {
                self.tenants.remove(&registration.tenant);
            }
        }

        // the tenant stays in the pool while any of its sockets still joined through it
        if let Some(pool) = &registration.pool {
            let still_joined = self
                .sockets
                .values()
                .any(|r| r.tenant == registration.tenant && r.pool.as_deref() == Some(pool.as_str()));
            if !still_joined {
                if let Some(members) = self.pools.get_mut(pool) {
                    members.remove(&registration.tenant);
                    if members.is_empty() {
                        self.pools.remove(pool);
                    }
                }
            }
        }

        if self.sockets.is_empty() {
            self.timer = None;
        }
    }

    /// Minimum requested rate across live sockets
    pub fn minimum_rate(&self) -> Option<Duration> {
        self.sockets.values().filter_map(|r| r.rate).min()
    }

    /// Record a socket's requested rate and adjust the timer
    pub fn request_rate(&mut self, socket: SocketId, rate: Duration, now: Instant) -> Result<RateOutcome, SyncError> {
        // a zero period would never advance the grid
        if rate.is_zero() || rate < self.min_rate || rate > self.max_rate {
            return Err(SyncError::RateOutOfRange {
                requested: rate.as_secs(),
                min: self.min_rate.as_secs(),
                max: self.max_rate.as_secs(),
            });
        }
        let current_min = self.minimum_rate();
        let registration = self.sockets.get_mut(&socket).ok_or(SyncError::UnknownSocket(socket))?;
        registration.rate = Some(rate);

        let restart = Timer {
            deadline: now + rate,
            phase: now,
            period: rate,
        };
        match self.timer {
            None => {
                self.timer = Some(restart);
                Ok(RateOutcome::Started)
            }
            Some(timer) => {
                let lower = current_min.map_or(true, |min| rate < min);
                let remaining = timer.deadline.saturating_duration_since(now);
                if lower && remaining > rate {
                    self.timer = Some(restart);
                    Ok(RateOutcome::Preempted)
                } else {
                    Ok(RateOutcome::Stored)
                }
            }
        }
    }

    /// Start of a tick: the rate to run at, or `None` to stop scheduling
    pub fn begin_tick(&mut self) -> Option<Duration> {
        let rate = self.minimum_rate();
        if rate.is_none() {
            self.timer = None;
        }
        rate
    }

    /// Diff a fresh listing against the retained snapshot
    ///
    /// Returns the sockets to signal, and replaces the snapshot.
    pub fn observe(&mut self, entries: Vec<ClusterEntry>) -> Vec<SocketId> {
        let next = Snapshot::new(entries);
        let mut marked: BTreeSet<&str> = BTreeSet::new();

        for entry in next.changed_since(&self.previous) {
            if entry.is_node() {
                marked.extend(self.tenants.keys().map(String::as_str));
                continue;
            }
            if let Some(members) = entry.pool.as_ref().and_then(|pool| self.pools.get(pool)) {
                marked.extend(members.iter().map(String::as_str));
            }
        }

        let mut sockets: Vec<SocketId> = marked
            .into_iter()
            .filter_map(|tenant| self.tenants.get(tenant))
            .flatten()
            .copied()
            .collect();
        sockets.sort_unstable();

        self.previous = next;
        sockets
    }

    /// Schedule the next fire at the current minimum rate
    ///
    /// Fire times stay on the grid anchored at the phase reference; a rate
    /// change re-anchors the grid at the slot that just fired. Missed slots
    /// are skipped.
    pub fn reschedule(&mut self, now: Instant) {
        let Some(period) = self.minimum_rate() else {
            self.timer = None;
            return;
        };
        let Some(timer) = self.timer.as_mut() else {
            return;
        };

        if period != timer.period {
            timer.phase = timer.deadline;
            timer.period = period;
        }

        let mut next = timer.deadline + period;
        if next <= now {
            let behind = now.saturating_duration_since(next);
            let missed = behind.as_nanos() / period.as_nanos() + 1;
            next += period.saturating_mul(u32::try_from(missed).unwrap_or(u32::MAX));
        }
        timer.deadline = next;
    }
}
