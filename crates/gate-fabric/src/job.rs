//! Completion Watcher
//!
//! Follows a submitted mutation to completion:
//!
//! ```text
//! Submitted ─┬─► non-2xx ──────────────────────────► passthrough
//!            ├─► 2xx, no job handle ───────────────► done (sync)
//!            └─► 2xx, UPID ─► running ─► stopped ─┬─► OK    ─► 200 + log
//!                                                 └─► other ─► 500 + log
//! ```
//!
//! Without `max_wait` the watcher polls until the job stops, however long that
//! takes. A job that never stops keeps the caller waiting; dropping the future
//! is the only way out.

use crate::client::{FabricClient, FabricResponse};
use gate_common::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Prefix of fabric job handles
const UPID_PREFIX: &str = "UPID:";

/// Asynchronous job handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Node executing the job
    pub node: String,
    /// Opaque job id
    pub upid: String,
}

impl JobHandle {
    /// Parse a `UPID:<node>:...` handle
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(UPID_PREFIX)?;
        let node = rest.split(':').next().filter(|n| !n.is_empty())?;
        Some(Self {
            node: node.to_string(),
            upid: value.to_string(),
        })
    }

    /// Detect a job handle in a submission payload
    pub fn detect(data: &Value) -> Option<Self> {
        data.as_str().and_then(Self::parse)
    }
}

/// Observed job state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still executing
    Running,
    /// Terminal state with exit status
    Stopped {
        /// `OK` on success
        exit_status: String,
    },
}

impl JobState {
    fn from_status(data: &Value) -> Self {
        match data["status"].as_str() {
            Some("stopped") => JobState::Stopped {
                exit_status: data["exitstatus"].as_str().unwrap_or_default().to_string(),
            },
            _ => JobState::Running,
        }
    }
}

/// Resolved outcome of a submitted mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// HTTP status to return to the caller
    pub status: u16,
    /// JSON body to return to the caller
    pub body: Value,
}

impl Completion {
    /// Whether the mutation succeeded
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn still_running(handle: &JobHandle) -> Self {
        Self {
            status: 202,
            body: json!({ "upid": handle.upid, "status": "running" }),
        }
    }
}

/// Polls asynchronous jobs to a terminal state
#[derive(Clone)]
pub struct JobWatcher {
    fabric: Arc<FabricClient>,
    poll_interval: Duration,
    max_wait: Option<Duration>,
}

impl JobWatcher {
    /// Create watcher with a fixed poll interval and no wait bound
    pub fn new(fabric: Arc<FabricClient>, poll_interval: Duration) -> Self {
        Self {
            fabric,
            poll_interval,
            max_wait: None,
        }
    }

    /// Give up waiting after `max_wait`, answering 202 with the job handle
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Resolve a submission result
    pub async fn resolve(&self, submission: FabricResponse, credentials: &Credentials) -> Completion {
        if !submission.is_success() {
            return Completion {
                status: submission.status,
                body: submission.data,
            };
        }

        match JobHandle::detect(&submission.data) {
            Some(handle) => self.wait(&handle, credentials).await,
            None => Completion {
                status: submission.status,
                body: submission.data,
            },
        }
    }

    /// Poll a job until it stops
    pub async fn wait(&self, handle: &JobHandle, credentials: &Credentials) -> Completion {
        let deadline = self.max_wait.map(|wait| Instant::now() + wait);
        tracing::debug!(upid = %handle.upid, node = %handle.node, "waiting for job");

        let status = loop {
            let response = self
                .fabric
                .task_status(&handle.node, &handle.upid, credentials)
                .await;

            if response.is_success() {
                if let JobState::Stopped { .. } = JobState::from_status(&response.data) {
                    break response.data;
                }
            } else {
                tracing::warn!(upid = %handle.upid, status = response.status, "job status poll failed");
            }

            if let Some(deadline) = deadline {
                if Instant::now() + self.poll_interval > deadline {
                    tracing::info!(upid = %handle.upid, "job still running after max wait");
                    return Completion::still_running(handle);
                }
            }
            sleep(self.poll_interval).await;
        };

        let log = self
            .fabric
            .task_log(&handle.node, &handle.upid, credentials)
            .await
            .data;

        let exit_status = status["exitstatus"].as_str().unwrap_or_default().to_string();
        let body = json!({ "result": status, "log": log });

        if exit_status == "OK" {
            tracing::debug!(upid = %handle.upid, "job finished");
            Completion { status: 200, body }
        } else {
            tracing::info!(upid = %handle.upid, %exit_status, "job failed");
            Completion { status: 500, body }
        }
    }
}
