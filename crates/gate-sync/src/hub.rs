//! Sync hub actor
//!
//! A single task owns the [`SchedulerCore`] and every socket's signal
//! channel. Connections talk to it through a cloneable [`SyncHandle`].
//!
//! ```text
//!  socket task ──Register/Rate/Deregister──►┐
//!  socket task ──────────────────────────────►  mpsc  ──► hub loop ──► ClusterSource
//!  hash/poke   ──Poke────────────────────────►┘             │
//!                                                           ▼
//!                                            "sync" ──► marked sockets
//! ```

use crate::scheduler::{RateOutcome, SchedulerCore, SocketId};
use crate::state::{filter_listing, ClusterEntry};
use crate::{SyncConfig, SyncError, SyncResult};
use async_trait::async_trait;
use gate_common::Credentials;
use gate_fabric::FabricClient;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

/// Source of the live cluster listing
#[async_trait]
pub trait ClusterSource: Send + Sync + 'static {
    /// Raw cluster resource listing
    async fn cluster_state(&self) -> SyncResult<Vec<Value>>;
}

#[async_trait]
impl ClusterSource for FabricClient {
    async fn cluster_state(&self) -> SyncResult<Vec<Value>> {
        let data = self
            .cluster_resources(&Credentials::Root, None)
            .await
            .into_result()
            .map_err(|e| SyncError::Source(e.to_string()))?;
        match data {
            Value::Array(items) => Ok(items),
            other => Err(SyncError::Source(format!("unexpected listing: {}", other))),
        }
    }
}

/// Command protocol spoken by connected clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// `rate <seconds>`
    Rate(Duration),
}

/// Parse one client text frame
pub fn parse_command(text: &str) -> SyncResult<ClientCommand> {
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("rate"), Some(value), None) => value
            .parse::<u64>()
            .map(|secs| ClientCommand::Rate(Duration::from_secs(secs)))
            .map_err(|_| SyncError::UnknownCommand(text.to_string())),
        _ => Err(SyncError::UnknownCommand(text.to_string())),
    }
}

enum HubCommand {
    Register {
        socket: SocketId,
        tenant: String,
        pool: Option<String>,
        signal: mpsc::UnboundedSender<()>,
    },
    Deregister {
        socket: SocketId,
    },
    Rate {
        socket: SocketId,
        rate: Duration,
        reply: oneshot::Sender<SyncResult<RateOutcome>>,
    },
    Poke,
}

/// Handle to a running hub
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_socket: Arc<AtomicU64>,
}

impl SyncHandle {
    /// Register a socket; dropping the subscription deregisters it
    pub fn register(&self, tenant: &str, pool: Option<&str>) -> SyncResult<Subscription> {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let (signal, signals) = mpsc::unbounded_channel();
        self.tx
            .send(HubCommand::Register {
                socket,
                tenant: tenant.to_string(),
                pool: pool.map(str::to_string),
                signal,
            })
            .map_err(|_| SyncError::HubClosed)?;

        Ok(Subscription {
            socket,
            signals,
            handle: self.clone(),
        })
    }

    /// Run an out-of-band tick without moving the timer
    pub fn poke(&self) -> SyncResult<()> {
        self.tx.send(HubCommand::Poke).map_err(|_| SyncError::HubClosed)
    }

    async fn request_rate(&self, socket: SocketId, rate: Duration) -> SyncResult<RateOutcome> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(HubCommand::Rate { socket, rate, reply })
            .map_err(|_| SyncError::HubClosed)?;
        response.await.map_err(|_| SyncError::HubClosed)?
    }
}

/// A registered socket's view of the hub
pub struct Subscription {
    socket: SocketId,
    signals: mpsc::UnboundedReceiver<()>,
    handle: SyncHandle,
}

impl Subscription {
    /// Socket id
    pub fn id(&self) -> SocketId {
        self.socket
    }

    /// Wait for the next sync signal; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<()> {
        self.signals.recv().await
    }

    /// Non-blocking check for a pending signal
    pub fn try_recv(&mut self) -> Option<()> {
        self.signals.try_recv().ok()
    }

    /// Negotiate this socket's notification rate
    pub async fn request_rate(&self, rate: Duration) -> SyncResult<RateOutcome> {
        self.handle.request_rate(self.socket, rate).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(HubCommand::Deregister { socket: self.socket });
    }
}

/// The hub actor
pub struct SyncHub<S: ClusterSource> {
    core: SchedulerCore,
    source: Arc<S>,
    signals: HashMap<SocketId, mpsc::UnboundedSender<()>>,
    rx: mpsc::UnboundedReceiver<HubCommand>,
}

impl<S: ClusterSource> SyncHub<S> {
    /// Spawn the hub on the current runtime
    pub fn spawn(config: &SyncConfig, source: Arc<S>) -> SyncHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            core: SchedulerCore::new(config),
            source,
            signals: HashMap::new(),
            rx,
        };
        tokio::spawn(hub.run());
        SyncHandle {
            tx,
            next_socket: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn run(mut self) {
        tracing::info!("sync hub started");
        loop {
            let deadline = self.core.next_deadline();
            let fire = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = fire => self.tick().await,
            }
        }
        tracing::info!("sync hub stopped");
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                socket,
                tenant,
                pool,
                signal,
            } => {
                tracing::debug!(socket, %tenant, pool = ?pool, "socket registered");
                self.core.register(socket, &tenant, pool.as_deref());
                self.signals.insert(socket, signal);
            }
            HubCommand::Deregister { socket } => {
                self.core.deregister(socket);
                self.signals.remove(&socket);
                tracing::debug!(socket, remaining = self.core.socket_count(), "socket deregistered");
            }
            HubCommand::Rate { socket, rate, reply } => {
                let outcome = self.core.request_rate(socket, rate, Instant::now());
                match &outcome {
                    Ok(outcome) => tracing::debug!(socket, rate_secs = rate.as_secs(), ?outcome, "rate negotiated"),
                    Err(e) => tracing::info!(socket, error = %e, "rate rejected"),
                }
                let _ = reply.send(outcome);
            }
            HubCommand::Poke => {
                if let Some(entries) = self.fetch().await {
                    self.notify(entries);
                }
            }
        }
    }

    async fn tick(&mut self) {
        if self.core.begin_tick().is_none() {
            tracing::debug!("no requested rates, timer stopped");
            return;
        }
        if let Some(entries) = self.fetch().await {
            self.notify(entries);
        }
        self.core.reschedule(Instant::now());
    }

    async fn fetch(&self) -> Option<Vec<ClusterEntry>> {
        match self.source.cluster_state().await {
            Ok(listing) => Some(filter_listing(&listing)),
            Err(e) => {
                tracing::warn!(error = %e, "cluster listing failed, skipping diff");
                None
            }
        }
    }

    fn notify(&mut self, entries: Vec<ClusterEntry>) {
        let sockets = self.core.observe(entries);
        if !sockets.is_empty() {
            tracing::debug!(sockets = sockets.len(), "sending sync");
        }
        for socket in sockets {
            if let Some(signal) = self.signals.get(&socket) {
                let _ = signal.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct StaticSource {
        listing: Mutex<Vec<Value>>,
    }

    impl StaticSource {
        fn set(&self, listing: Vec<Value>) {
            *self.listing.lock() = listing;
        }
    }

    #[async_trait]
    impl ClusterSource for StaticSource {
        async fn cluster_state(&self) -> SyncResult<Vec<Value>> {
            Ok(self.listing.lock().clone())
        }
    }

    fn vm(id: u32, status: &str, pool: &str) -> Value {
        json!({ "id": format!("qemu/{}", id), "type": "qemu", "status": status, "node": "pve1", "pool": pool })
    }

    fn config() -> SyncConfig {
        SyncConfig {
            min_rate_secs: 1,
            max_rate_secs: 60,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("rate 5").unwrap(), ClientCommand::Rate(Duration::from_secs(5)));
        assert_eq!(parse_command("  rate   2 ").unwrap(), ClientCommand::Rate(Duration::from_secs(2)));
        assert!(matches!(parse_command("rate"), Err(SyncError::UnknownCommand(_))));
        assert!(matches!(parse_command("rate x"), Err(SyncError::UnknownCommand(_))));
        assert!(matches!(parse_command("hello"), Err(SyncError::UnknownCommand(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_pool_scoped_signals() {
        let source = Arc::new(StaticSource::default());
        source.set(vec![vm(101, "running", "a"), vm(201, "running", "b")]);
        let hub = SyncHub::spawn(&config(), source.clone());

        let mut alice = hub.register("alice@pve", Some("a")).unwrap();
        let mut bob = hub.register("bob@pve", Some("b")).unwrap();
        assert_eq!(alice.request_rate(Duration::from_secs(2)).await.unwrap(), RateOutcome::Started);

        // first tick sees everything as new
        tokio::time::timeout(Duration::from_secs(3), alice.recv()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), bob.recv()).await.unwrap();

        source.set(vec![vm(101, "stopped", "a"), vm(201, "running", "b")]);
        tokio::time::timeout(Duration::from_secs(3), alice.recv()).await.unwrap();
        assert!(bob.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_rejects_out_of_range_rate() {
        let hub = SyncHub::spawn(&config(), Arc::new(StaticSource::default()));
        let sub = hub.register("alice@pve", None).unwrap();
        assert!(matches!(
            sub.request_rate(Duration::from_secs(600)).await,
            Err(SyncError::RateOutOfRange { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poke_runs_out_of_band_tick() {
        let source = Arc::new(StaticSource::default());
        let hub = SyncHub::spawn(&config(), source.clone());
        let mut alice = hub.register("alice@pve", Some("a")).unwrap();

        source.set(vec![vm(101, "running", "a")]);
        hub.poke().unwrap();
        tokio::time::timeout(Duration::from_millis(10), alice.recv()).await.unwrap();
    }
}
