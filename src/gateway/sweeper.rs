//! Offline sweeper.
//!
//! Every [`SWEEP_INTERVAL`] the sweeper looks at hosts that are online with
//! monitoring enabled and marks those whose last pulse is older than their
//! offline threshold as offline. The reverse transition belongs to ingest.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::SWEEP_INTERVAL;
use super::hub::panic_message;
use super::message::{NotificationBuilder, NotificationKind};
use super::notify::NotificationDispatcher;
use super::storage::MonitorStore;
use super::types::{HostStatus, MonitoredHost, StatusLogEntry};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Offline threshold of a host in minutes, at least one.
pub fn threshold_minutes(host: &MonitoredHost) -> u32 {
    host.offline_threshold_minutes.unwrap_or(0).max(1)
}

/// Whether `host` has been silent past its threshold at `now`.
pub fn is_stale(host: &MonitoredHost, now: DateTime<Utc>) -> bool {
    let threshold = now - chrono::Duration::minutes(i64::from(threshold_minutes(host)));
    match host.last_pulse {
        Some(last) => last < threshold,
        None => true,
    }
}

pub struct OfflineSweeper {
    store: Arc<dyn MonitorStore>,
    notifications: NotificationDispatcher,
}

impl OfflineSweeper {
    pub fn new(store: Arc<dyn MonitorStore>, notifications: NotificationDispatcher) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Run one pass. Returns the ids of hosts marked offline.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<u64> {
        let candidates = self
            .store
            .list_hosts()
            .into_iter()
            .filter(|h| h.monitor_enabled && h.status == HostStatus::Online);

        let mut marked = Vec::new();
        for host in candidates {
            if !is_stale(&host, now) {
                continue;
            }

            // Re-check under the store's lock in case a pulse landed meanwhile
            let mut transitioned = false;
            let updated = self.store.update_host(host.id, &mut |h: &mut MonitoredHost| {
                if h.status == HostStatus::Online && is_stale(h, now) {
                    h.status = HostStatus::Offline;
                    transitioned = true;
                }
            });
            let host = match updated {
                Ok(host) if transitioned => host,
                Ok(_) => continue,
                Err(e) => {
                    warn!(host_id = host.id, "Failed to update host status: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.store.append_status_log(StatusLogEntry {
                host_id: host.id,
                status: HostStatus::Offline,
                created_at: now,
            }) {
                warn!(host_id = host.id, "Failed to append status log: {}", e);
            }

            let last_pulse = host
                .last_pulse
                .map(|t| t.format(TIME_FORMAT).to_string())
                .unwrap_or_else(|| "never".to_string());
            info!(
                host_id = host.id,
                "Host {} marked offline (last pulse: {})", host.name, last_pulse
            );

            if host.notify_offline {
                let builder = NotificationBuilder::new(
                    NotificationKind::Offline,
                    format!("Host Offline Alert: {}", host.name),
                )
                .with_message(format!(
                    "Host '{}' (ID: {}) has gone offline.\nLast Pulse: {}",
                    host.name, host.id, last_pulse
                ))
                .at(now);
                self.notifications.notify_host(&host, builder).await;
            }

            marked.push(host.id);
        }
        marked
    }

    /// Sweep on a fixed interval until `cancel` fires. A panicking pass is
    /// logged and the loop carries on.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Offline sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = AssertUnwindSafe(self.sweep(Utc::now())).catch_unwind().await;
                    if let Err(panic) = outcome {
                        error!("Offline sweep panicked: {}", panic_message(&*panic));
                    }
                }
            }
        }

        info!("Offline sweeper stopped");
    }
}
