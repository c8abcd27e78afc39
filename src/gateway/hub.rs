//! Monitoring hub.
//!
//! # Architecture
//!
//! - [`HubState`]: the latest [`HostMetricSnapshot`] per host. Owned by one
//!   task; every mutation arrives as a [`HubCommand`] over a bounded queue.
//! - [`MonitorHub`]: cloneable handle used by ingest, the dashboard route and
//!   the stop-monitoring route.
//! - Subscribers: a set of per-dashboard queues behind a reader/writer lock.
//!   Broadcasts hold the read lock; queues that fail are collected and
//!   removed under the write lock after the read lock is released.
//!
//! Updates are samples, not transactions: when the inbound queue is full the
//! new sample is dropped and the next one carries fresh counters anyway.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::LIVENESS_WINDOW;
use super::types::{DashboardFrame, HostMetricSnapshot};

/// Capacity of the hub's inbound queue.
pub const UPDATE_QUEUE_CAPACITY: usize = 100;

/// Capacity of each subscriber's outbound queue, in frames.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Bytes per second between two counter readings, zero on decrease or when
/// no time elapsed.
fn rate(previous: u64, current: u64, elapsed_ms: i64) -> u64 {
    if elapsed_ms <= 0 || current < previous {
        return 0;
    }
    let per_sec = u128::from(current - previous) * 1000 / elapsed_ms as u128;
    u64::try_from(per_sec).unwrap_or(u64::MAX)
}

/// Latest snapshot per host.
#[derive(Debug, Default)]
pub struct HubState {
    hosts: HashMap<u64, HostMetricSnapshot>,
    /// When each host was last removed
    removed: HashMap<u64, DateTime<Utc>>,
}

impl HubState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new snapshot, filling rates from the previous one.
    pub fn apply(&mut self, mut snapshot: HostMetricSnapshot) -> &HostMetricSnapshot {
        if let Some(prev) = self.hosts.get(&snapshot.host_id) {
            let elapsed_ms = (snapshot.last_updated - prev.last_updated).num_milliseconds();
            if elapsed_ms > 0 {
                snapshot.net_rx_rate = rate(prev.net_rx, snapshot.net_rx, elapsed_ms);
                snapshot.net_tx_rate = rate(prev.net_tx, snapshot.net_tx, elapsed_ms);
                for iface in snapshot.interfaces.iter_mut() {
                    if let Some(prev_iface) = prev.interfaces.iter().find(|p| p.name == iface.name)
                    {
                        iface.rx_rate = rate(prev_iface.rx, iface.rx, elapsed_ms);
                        iface.tx_rate = rate(prev_iface.tx, iface.tx, elapsed_ms);
                    }
                }
            }
        }

        let host_id = snapshot.host_id;
        self.hosts.insert(host_id, snapshot);
        &self.hosts[&host_id]
    }

    pub fn remove(&mut self, host_id: u64) -> bool {
        self.hosts.remove(&host_id).is_some()
    }

    /// Forget a host and refuse snapshots taken at or before `at`, so a pulse
    /// already in flight when monitoring stopped cannot bring it back.
    pub fn remove_at(&mut self, host_id: u64, at: DateTime<Utc>) -> bool {
        self.removed.insert(host_id, at);
        self.remove(host_id)
    }

    /// Whether `snapshot` postdates the last removal of its host.
    pub fn accepts(&self, snapshot: &HostMetricSnapshot) -> bool {
        match self.removed.get(&snapshot.host_id) {
            Some(removed_at) => snapshot.last_updated > *removed_at,
            None => true,
        }
    }

    pub fn get(&self, host_id: u64) -> Option<&HostMetricSnapshot> {
        self.hosts.get(&host_id)
    }

    /// Every snapshot, ordered by host id.
    pub fn all(&self) -> Vec<HostMetricSnapshot> {
        let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
        hosts.sort_by_key(|h| h.host_id);
        hosts
    }

    /// Snapshots updated within the liveness window, ordered by host id.
    pub fn live_hosts(&self, now: DateTime<Utc>) -> Vec<HostMetricSnapshot> {
        let mut hosts: Vec<_> = self
            .hosts
            .values()
            .filter(|h| {
                (now - h.last_updated)
                    .to_std()
                    .map(|age| age < LIVENESS_WINDOW)
                    // Clock skew puts last_updated in the future
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        hosts.sort_by_key(|h| h.host_id);
        hosts
    }
}

enum HubCommand {
    Update(HostMetricSnapshot),
    Remove(u64, DateTime<Utc>),
    Snapshot(oneshot::Sender<Vec<HostMetricSnapshot>>),
}

type Subscribers = Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>;

/// Handle to the monitoring hub.
#[derive(Clone)]
pub struct MonitorHub {
    tx: mpsc::Sender<HubCommand>,
    subscribers: Subscribers,
}

/// A registered dashboard subscriber.
pub struct Subscription {
    pub id: Uuid,
    pub frames: mpsc::Receiver<String>,
}

impl MonitorHub {
    /// Spawn the hub task. It runs until `cancel` fires.
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(run_hub(rx, subscribers.clone(), cancel));
        Self { tx, subscribers }
    }

    /// Queue a snapshot. Returns `false` when the sample was dropped.
    pub fn update(&self, snapshot: HostMetricSnapshot) -> bool {
        match self.tx.try_send(HubCommand::Update(snapshot)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Monitor hub queue full, dropping sample");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Forget a host and tell subscribers to evict it.
    pub async fn remove_host(&self, host_id: u64) {
        if self.tx.send(HubCommand::Remove(host_id, Utc::now())).await.is_err() {
            warn!(host_id, "Monitor hub stopped, remove ignored");
        }
    }

    /// Copy of the hub's full state.
    pub async fn snapshot(&self) -> Vec<HostMetricSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Snapshot(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Register a subscriber. Its queue starts with an `init` frame holding
    /// every known host.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, frames) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        let hosts = self.snapshot().await;
        match serde_json::to_string(&DashboardFrame::Init(hosts)) {
            Ok(frame) => {
                let _ = tx.try_send(frame);
            }
            Err(e) => error!("Failed to encode init frame: {}", e),
        }

        self.subscribers.write().await.insert(id, tx);
        debug!(subscriber = %id, "Dashboard subscriber registered");
        Subscription { id, frames }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!(subscriber = %id, "Dashboard subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

/// Send one frame to every subscriber, then drop those whose queue failed.
async fn broadcast(subscribers: &Subscribers, frame: &DashboardFrame) {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode dashboard frame: {}", e);
            return;
        }
    };

    let failed: Vec<Uuid> = {
        let subscribers = subscribers.read().await;
        subscribers
            .iter()
            .filter(|(_, tx)| tx.try_send(payload.clone()).is_err())
            .map(|(id, _)| *id)
            .collect()
    };

    if !failed.is_empty() {
        let mut subscribers = subscribers.write().await;
        for id in failed {
            subscribers.remove(&id);
            debug!(subscriber = %id, "Dropped dashboard subscriber after failed write");
        }
    }
}

async fn handle_command(state: &mut HubState, subscribers: &Subscribers, command: HubCommand) {
    match command {
        HubCommand::Update(snapshot) => {
            if !state.accepts(&snapshot) {
                debug!(
                    host_id = snapshot.host_id,
                    "Dropping snapshot taken before the host was removed"
                );
                return;
            }
            state.apply(snapshot);
            let live = state.live_hosts(Utc::now());
            broadcast(subscribers, &DashboardFrame::Update(live)).await;
        }
        HubCommand::Remove(host_id, at) => {
            state.remove_at(host_id, at);
            broadcast(subscribers, &DashboardFrame::Remove(host_id)).await;
        }
        HubCommand::Snapshot(reply) => {
            let _ = reply.send(state.all());
        }
    }
}

async fn run_hub(
    mut rx: mpsc::Receiver<HubCommand>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    let mut state = HubState::new();
    info!("Monitor hub started");

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let outcome = AssertUnwindSafe(handle_command(&mut state, &subscribers, command))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            error!("Monitor hub update panicked: {:?}", panic_message(&*panic));
        }
    }

    info!("Monitor hub stopped");
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
