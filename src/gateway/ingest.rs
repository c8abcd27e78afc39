//! Metric ingest.
//!
//! Validates agent pulses, runs traffic accounting against the persisted host
//! record, forwards the enriched snapshot to the hub and writes a coalesced
//! metric record at most once per host per [`SNAPSHOT_INTERVAL`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::config::SNAPSHOT_INTERVAL;
use super::error::GatewayError;
use super::hub::MonitorHub;
use super::message::{NotificationBuilder, NotificationKind};
use super::notify::NotificationDispatcher;
use super::storage::MonitorStore;
use super::traffic::{Counters, accumulate, apply_reset_day, select_counters};
use super::types::{
    CounterMode, HostMetricSnapshot, HostStatus, MetricPulse, MetricRecord, MonitoredHost,
    StatusLogEntry, TrafficAccountingState,
};

/// Compare secrets without leaking where they differ.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length.
pub(crate) fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Bytes counted against the traffic limit.
fn traffic_used(mode: CounterMode, state: &TrafficAccountingState, adjustment: u64) -> u64 {
    let counted = match mode {
        CounterMode::Total => state.monthly_rx.saturating_add(state.monthly_tx),
        CounterMode::Rx => state.monthly_rx,
        CounterMode::Tx => state.monthly_tx,
    };
    counted.saturating_add(adjustment)
}

/// What one accepted pulse did.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub delta: Counters,
    pub snapshot: HostMetricSnapshot,
    pub came_online: bool,
    pub limit_crossed: bool,
    pub record_saved: bool,
}

pub struct MetricIngest {
    store: Arc<dyn MonitorStore>,
    hub: MonitorHub,
    notifications: NotificationDispatcher,
    last_saved: DashMap<u64, DateTime<Utc>>,
}

impl MetricIngest {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        hub: MonitorHub,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            hub,
            notifications,
            last_saved: DashMap::new(),
        }
    }

    /// Ingest one pulse presented with bearer `secret`.
    pub async fn ingest(
        &self,
        secret: &str,
        pulse: MetricPulse,
    ) -> Result<IngestOutcome, GatewayError> {
        self.ingest_at(secret, pulse, Utc::now()).await
    }

    pub(crate) async fn ingest_at(
        &self,
        secret: &str,
        pulse: MetricPulse,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, GatewayError> {
        let host = self
            .store
            .get_host(pulse.host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("host {}", pulse.host_id)))?;

        if !host.monitor_enabled
            || host.secret.is_empty()
            || !constant_time_eq(host.secret.as_bytes(), secret.as_bytes())
        {
            return Err(GatewayError::Auth(
                "invalid secret or monitoring disabled".to_string(),
            ));
        }

        let today = now.date_naive();
        let mut delta = Counters::default();
        let mut came_online = false;
        let mut used_before = 0;

        let host = self.store.update_host(pulse.host_id, &mut |host: &mut MonitoredHost| {
            used_before = traffic_used(
                host.traffic.counter_mode,
                &host.accounting,
                host.traffic.used_adjustment,
            );

            let current = select_counters(&pulse, host.traffic.interfaces.as_deref());
            if apply_reset_day(&mut host.accounting, host.traffic.reset_day, today) {
                info!(host_id = host.id, "Monthly traffic counters reset");
            }
            delta = accumulate(&mut host.accounting, current);

            host.last_pulse = Some(now);
            came_online = host.status != HostStatus::Online;
            host.status = HostStatus::Online;
        })?;

        debug!(
            host_id = host.id,
            delta_rx = delta.rx,
            delta_tx = delta.tx,
            monthly_rx = host.accounting.monthly_rx,
            monthly_tx = host.accounting.monthly_tx,
            "Pulse accepted"
        );

        let mut snapshot = HostMetricSnapshot::from_pulse(&pulse, now);
        snapshot.net_monthly_rx = host.accounting.monthly_rx;
        snapshot.net_monthly_tx = host.accounting.monthly_tx;
        snapshot.net_traffic_limit = host.traffic.limit;
        snapshot.net_traffic_used_adjustment = host.traffic.used_adjustment;
        snapshot.net_traffic_counter_mode = host.traffic.counter_mode;
        self.hub.update(snapshot.clone());

        if came_online {
            self.mark_online(&host, now).await;
        }

        let limit_crossed = self.check_traffic_limit(&host, used_before, now).await;
        let record_saved = self.save_record(&pulse, now);

        Ok(IngestOutcome {
            delta,
            snapshot,
            came_online,
            limit_crossed,
            record_saved,
        })
    }

    async fn mark_online(&self, host: &MonitoredHost, now: DateTime<Utc>) {
        info!(host_id = host.id, "Host {} is back online", host.name);
        if let Err(e) = self.store.append_status_log(StatusLogEntry {
            host_id: host.id,
            status: HostStatus::Online,
            created_at: now,
        }) {
            warn!(host_id = host.id, "Failed to append status log: {}", e);
        }

        if host.notify_offline {
            let builder = NotificationBuilder::new(
                NotificationKind::Online,
                format!("Host Online: {}", host.name),
            )
            .with_message(format!(
                "Host '{}' (ID: {}) is back online.",
                host.name, host.id
            ))
            .at(now);
            self.notifications.notify_host(host, builder).await;
        }
    }

    /// Notify when this pulse pushed usage over the configured limit.
    async fn check_traffic_limit(
        &self,
        host: &MonitoredHost,
        used_before: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let limit = host.traffic.limit;
        if limit == 0 {
            return false;
        }
        let used_after = traffic_used(
            host.traffic.counter_mode,
            &host.accounting,
            host.traffic.used_adjustment,
        );
        if used_before >= limit || used_after < limit {
            return false;
        }

        warn!(
            host_id = host.id,
            used = used_after,
            limit,
            "Traffic limit reached"
        );
        let builder = NotificationBuilder::new(
            NotificationKind::Traffic,
            format!("Traffic Limit Reached: {}", host.name),
        )
        .with_message(format!(
            "Host '{}' (ID: {}) used {} of {} bytes this period.",
            host.name, host.id, used_after, limit
        ))
        .at(now);
        self.notifications.notify_host(host, builder).await;
        true
    }

    /// Persist a metric record unless one was saved for this host within the
    /// coalescing window.
    fn save_record(&self, pulse: &MetricPulse, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(SNAPSHOT_INTERVAL)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let should_save = match self.last_saved.entry(pulse.host_id) {
            Entry::Occupied(mut last) => {
                if now - *last.get() > window {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if should_save {
            if let Err(e) = self
                .store
                .append_metric_record(MetricRecord::from_pulse(pulse, now))
            {
                warn!(host_id = pulse.host_id, "Failed to save metric record: {}", e);
            }
        }
        should_save
    }
}
