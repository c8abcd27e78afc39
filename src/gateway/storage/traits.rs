//! Collaborator traits for persistence.
//!
//! The gateway never owns user, host or credential data; it consumes these
//! interfaces. Implementations must be thread-safe (`Send + Sync`) for use
//! across async tasks. The bundled implementations use `DashMap`.

use chrono::{DateTime, Utc};

use crate::gateway::error::GatewayError;
use crate::gateway::types::{
    ConnectionRecord, MetricRecord, MonitoredHost, RecordingMeta, RemoteHostRef, StatusLogEntry,
    Subject,
};

/// Credential lookup for remote hosts.
pub trait CredentialStore: Send + Sync {
    /// Resolve the host reference and decrypted credentials for `host_id`,
    /// as visible to `subject`.
    fn resolve(&self, subject: &Subject, host_id: u64) -> Result<RemoteHostRef, GatewayError>;

    /// Persist a fingerprint adopted on first use.
    fn store_fingerprint(&self, host_id: u64, fingerprint: &str) -> Result<(), GatewayError>;
}

/// Connection log, one row per session attempt.
pub trait ConnectionLogStore: Send + Sync {
    /// Append a new row and return its id.
    fn create(&self, record: &ConnectionRecord) -> Result<u64, GatewayError>;

    /// Overwrite the row `id` with the current state of `record`.
    fn update(&self, id: u64, record: &ConnectionRecord) -> Result<(), GatewayError>;
}

/// Recording metadata rows.
pub trait RecordingStore: Send + Sync {
    fn create(&self, meta: &RecordingMeta) -> Result<u64, GatewayError>;

    fn finalize(
        &self,
        id: u64,
        ended_at: DateTime<Utc>,
        duration_secs: u64,
    ) -> Result<(), GatewayError>;
}

/// Monitored host records, status log and metric history.
pub trait MonitorStore: Send + Sync {
    fn get_host(&self, host_id: u64) -> Option<MonitoredHost>;

    fn list_hosts(&self) -> Vec<MonitoredHost>;

    /// Apply `change` to the host record atomically and return the result.
    fn update_host(
        &self,
        host_id: u64,
        change: &mut dyn FnMut(&mut MonitoredHost),
    ) -> Result<MonitoredHost, GatewayError>;

    fn append_status_log(&self, entry: StatusLogEntry) -> Result<(), GatewayError>;

    fn append_metric_record(&self, record: MetricRecord) -> Result<(), GatewayError>;
}
