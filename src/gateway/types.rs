//! Data model and wire types shared by the session bridge and the monitoring
//! pipeline.
//!
//! Wire types serialize to the JSON shapes the browser terminal, the
//! dashboard and the agents already speak, so field names here are part of
//! the external contract.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::error::GatewayError;

// ---------------------------------------------------------------------------
// Session bridge model
// ---------------------------------------------------------------------------

/// Identity obtained by consuming a one-time ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub role: String,
}

/// Decrypted authentication material for one remote host.
///
/// Scoped to one request; never cached by the gateway.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthMaterial {
    #[serde(default)]
    pub password: Option<String>,
    /// PEM/OpenSSH encoded private key text.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl AuthMaterial {
    pub fn is_empty(&self) -> bool {
        self.password.as_deref().is_none_or(str::is_empty)
            && self.private_key.as_deref().is_none_or(str::is_empty)
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMaterial")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Target endpoint of one session. Immutable for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHostRef {
    pub host_id: u64,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
    /// Expected host key fingerprint; `None` means trust on first use.
    pub fingerprint: Option<String>,
}

impl RemoteHostRef {
    /// `address:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub rows: u32,
    pub cols: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl PtySize {
    /// Build a size from optional caller values, defaulting each missing or
    /// zero dimension.
    pub fn from_optional(rows: Option<u32>, cols: Option<u32>) -> Self {
        let default = Self::default();
        Self {
            rows: rows.filter(|r| *r > 0).unwrap_or(default.rows),
            cols: cols.filter(|c| *c > 0).unwrap_or(default.cols),
        }
    }
}

/// Status of one session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Success,
    Failed,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Success => write!(f, "success"),
            ConnectionStatus::Failed => write!(f, "failed"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One row per session attempt, owned by the bridge that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub user_id: u64,
    pub host_id: u64,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Session length in whole seconds, set at teardown
    pub duration_secs: u64,
}

impl ConnectionRecord {
    pub fn connecting(subject: &Subject, host: &RemoteHostRef, now: DateTime<Utc>) -> Self {
        Self {
            user_id: subject.user_id,
            host_id: host.host_id,
            host: host.address.clone(),
            port: host.port,
            username: host.username.clone(),
            status: ConnectionStatus::Connecting,
            error_message: None,
            connected_at: now,
            disconnected_at: None,
            duration_secs: 0,
        }
    }

    pub fn mark_success(&mut self) {
        self.status = ConnectionStatus::Success;
    }

    pub fn mark_failed(&mut self, error: &GatewayError) {
        self.status = ConnectionStatus::Failed;
        self.error_message = Some(error.to_string());
    }

    pub fn mark_disconnected(&mut self, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Disconnected;
        self.disconnected_at = Some(now);
        self.duration_secs = elapsed_secs(self.connected_at, now);
    }
}

/// Metadata row describing one recording artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub user_id: u64,
    pub host_id: u64,
    pub host: String,
    pub username: String,
    pub file_path: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
}

/// Whole seconds between two instants, clamped at zero.
pub(crate) fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

/// Frames the gateway sends to the browser terminal besides raw output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerFrame {
    Connected(String),
    Error(String),
}

impl ServerFrame {
    pub fn connected() -> Self {
        ServerFrame::Connected("Connected successfully".to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error(message.into())
    }
}

// ---------------------------------------------------------------------------
// Monitoring model
// ---------------------------------------------------------------------------

/// Per-interface counters as sent by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfacePulse {
    pub name: String,
    #[serde(default)]
    pub rx: u64,
    #[serde(default)]
    pub tx: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
}

/// One periodic metrics push from a remote agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPulse {
    pub host_id: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem_used: u64,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub disk_used: u64,
    #[serde(default)]
    pub disk_total: u64,
    /// Sum of all interfaces, precomputed by the agent
    #[serde(default)]
    pub net_rx: u64,
    #[serde(default)]
    pub net_tx: u64,
    #[serde(default)]
    pub interfaces: Vec<InterfacePulse>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub hostname: String,
}

/// Per-interface breakdown held by the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub rx: u64,
    pub tx: u64,
    pub rx_rate: u64,
    pub tx_rate: u64,
}

/// Which direction counts against a traffic limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterMode {
    #[default]
    Total,
    Rx,
    Tx,
}

/// The hub's authoritative per-host record.
///
/// Only the hub's update path produces new values; everyone else sends
/// messages and receives copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetricSnapshot {
    pub host_id: u64,
    pub uptime: u64,
    pub cpu: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub net_rx_rate: u64,
    pub net_tx_rate: u64,
    pub net_monthly_rx: u64,
    pub net_monthly_tx: u64,
    pub net_traffic_limit: u64,
    pub net_traffic_used_adjustment: u64,
    pub net_traffic_counter_mode: CounterMode,
    pub interfaces: Vec<InterfaceSnapshot>,
    pub os: String,
    pub hostname: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_updated: DateTime<Utc>,
}

impl HostMetricSnapshot {
    /// Build a snapshot from a pulse. Rates start at zero; the hub fills them.
    pub fn from_pulse(pulse: &MetricPulse, now: DateTime<Utc>) -> Self {
        Self {
            host_id: pulse.host_id,
            uptime: pulse.uptime,
            cpu: pulse.cpu,
            mem_used: pulse.mem_used,
            mem_total: pulse.mem_total,
            disk_used: pulse.disk_used,
            disk_total: pulse.disk_total,
            net_rx: pulse.net_rx,
            net_tx: pulse.net_tx,
            net_rx_rate: 0,
            net_tx_rate: 0,
            net_monthly_rx: 0,
            net_monthly_tx: 0,
            net_traffic_limit: 0,
            net_traffic_used_adjustment: 0,
            net_traffic_counter_mode: CounterMode::Total,
            interfaces: pulse
                .interfaces
                .iter()
                .map(|iface| InterfaceSnapshot {
                    name: iface.name.clone(),
                    rx: iface.rx,
                    tx: iface.tx,
                    rx_rate: 0,
                    tx_rate: 0,
                })
                .collect(),
            os: pulse.os.clone(),
            hostname: pulse.hostname.clone(),
            last_updated: now,
        }
    }
}

/// Frames pushed to dashboard subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DashboardFrame {
    Init(Vec<HostMetricSnapshot>),
    Update(Vec<HostMetricSnapshot>),
    Remove(u64),
}

/// Liveness state of a monitored host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    #[default]
    Offline,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Online => write!(f, "online"),
            HostStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Traffic configuration of a host, edited by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSettings {
    /// Comma separated interface names; `None` or `"auto"` uses the totals
    #[serde(default)]
    pub interfaces: Option<String>,
    /// Day of month on which the monthly accumulators reset
    #[serde(default = "default_reset_day")]
    pub reset_day: u32,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub used_adjustment: u64,
    #[serde(default)]
    pub counter_mode: CounterMode,
}

fn default_reset_day() -> u32 {
    1
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            interfaces: None,
            reset_day: default_reset_day(),
            limit: 0,
            used_adjustment: 0,
            counter_mode: CounterMode::Total,
        }
    }
}

/// Persisted traffic accounting state, read and written by metric ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficAccountingState {
    pub last_raw_rx: u64,
    pub last_raw_tx: u64,
    pub monthly_rx: u64,
    pub monthly_tx: u64,
    #[serde(default)]
    pub last_reset_date: Option<NaiveDate>,
}

/// Host record as seen by the monitoring pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredHost {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub monitor_enabled: bool,
    /// Bearer secret the host's agent must present
    #[serde(default, skip_serializing)]
    pub secret: String,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub last_pulse: Option<DateTime<Utc>>,
    /// Minutes of silence before the host is declared offline
    #[serde(default)]
    pub offline_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub notify_offline: bool,
    #[serde(default)]
    pub notify_channels: Vec<String>,
    #[serde(default)]
    pub traffic: TrafficSettings,
    #[serde(default)]
    pub accounting: TrafficAccountingState,
}

/// Partial update of monitoring settings. Absent fields stay unchanged, so
/// an explicit zero is distinguishable from an omitted field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettingsUpdate {
    #[serde(default)]
    pub interfaces: Option<String>,
    #[serde(default)]
    pub reset_day: Option<u32>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub used_adjustment: Option<u64>,
    #[serde(default)]
    pub counter_mode: Option<CounterMode>,
    #[serde(default)]
    pub offline_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub notify_offline: Option<bool>,
    #[serde(default)]
    pub notify_channels: Option<Vec<String>>,
}

/// Status transition row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub host_id: u64,
    pub status: HostStatus,
    pub created_at: DateTime<Utc>,
}

/// Coalesced metric snapshot persisted at most once a minute per host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub host_id: u64,
    pub cpu: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub created_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn from_pulse(pulse: &MetricPulse, now: DateTime<Utc>) -> Self {
        Self {
            host_id: pulse.host_id,
            cpu: pulse.cpu,
            mem_used: pulse.mem_used,
            mem_total: pulse.mem_total,
            disk_used: pulse.disk_used,
            disk_total: pulse.disk_total,
            net_rx: pulse.net_rx,
            net_tx: pulse.net_tx,
            created_at: now,
        }
    }
}
