//! DashMap-based collaborator implementations.
//!
//! Used by the bundled binary and by tests. Host data can be seeded from a
//! JSON inventory file (`HOSTS_FILE`):
//!
//! ```json
//! {
//!   "ssh_hosts": [
//!     {"id": 1, "owner_id": 7, "address": "10.0.0.1", "username": "root", "password": "..."}
//!   ],
//!   "monitored_hosts": [
//!     {"id": 1, "name": "web-1", "monitor_enabled": true, "secret": "..."}
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;

use super::traits::{ConnectionLogStore, CredentialStore, MonitorStore, RecordingStore};
use crate::gateway::error::GatewayError;
use crate::gateway::types::{
    AuthMaterial, ConnectionRecord, MetricRecord, MonitoredHost, RecordingMeta, RemoteHostRef,
    StatusLogEntry, Subject,
};

/// Role allowed to open sessions to hosts owned by other users.
const ADMIN_ROLE: &str = "admin";

fn default_ssh_port() -> u16 {
    22
}

/// One SSH host entry of the inventory file.
#[derive(Debug, Clone, Deserialize)]
pub struct SshHostEntry {
    pub id: u64,
    /// Owning user; `None` makes the host visible to everyone
    #[serde(default)]
    pub owner_id: Option<u64>,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Seed data for the in-memory stores.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub ssh_hosts: Vec<SshHostEntry>,
    #[serde(default)]
    pub monitored_hosts: Vec<MonitoredHost>,
}

impl Inventory {
    /// Read and parse an inventory file.
    pub async fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Invalid host inventory: {}", e)))
    }
}

/// In-memory credential store.
pub struct MemoryCredentialStore {
    hosts: DashMap<u64, SshHostEntry>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = SshHostEntry>) -> Self {
        let store = Self::new();
        for entry in entries {
            store.insert(entry);
        }
        store
    }

    pub fn insert(&self, entry: SshHostEntry) {
        self.hosts.insert(entry.id, entry);
    }

    /// Stored fingerprint of a host, if any.
    pub fn fingerprint(&self, host_id: u64) -> Option<String> {
        self.hosts
            .get(&host_id)
            .and_then(|entry| entry.fingerprint.clone())
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve(&self, subject: &Subject, host_id: u64) -> Result<RemoteHostRef, GatewayError> {
        let entry = self
            .hosts
            .get(&host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("host {}", host_id)))?;

        let visible = match entry.owner_id {
            None => true,
            Some(owner) => owner == subject.user_id || subject.role == ADMIN_ROLE,
        };
        if !visible {
            return Err(GatewayError::NotFound(format!("host {}", host_id)));
        }

        Ok(RemoteHostRef {
            host_id: entry.id,
            address: entry.address.clone(),
            port: entry.port,
            username: entry.username.clone(),
            auth: AuthMaterial {
                password: entry.password.clone(),
                private_key: entry.private_key.clone(),
            },
            fingerprint: entry.fingerprint.clone(),
        })
    }

    fn store_fingerprint(&self, host_id: u64, fingerprint: &str) -> Result<(), GatewayError> {
        let mut entry = self
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("host {}", host_id)))?;
        entry.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}

/// In-memory connection log.
#[derive(Default)]
pub struct MemoryConnectionLog {
    next_id: AtomicU64,
    rows: DashMap<u64, ConnectionRecord>,
}

impl MemoryConnectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, ordered by id.
    pub fn rows(&self) -> Vec<(u64, ConnectionRecord)> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }
}

impl ConnectionLogStore for MemoryConnectionLog {
    fn create(&self, record: &ConnectionRecord) -> Result<u64, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.insert(id, record.clone());
        Ok(id)
    }

    fn update(&self, id: u64, record: &ConnectionRecord) -> Result<(), GatewayError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("connection log {}", id)))?;
        *row = record.clone();
        Ok(())
    }
}

/// In-memory recording metadata.
#[derive(Default)]
pub struct MemoryRecordingStore {
    next_id: AtomicU64,
    rows: DashMap<u64, RecordingMeta>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<RecordingMeta> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, meta)| meta).collect()
    }
}

impl RecordingStore for MemoryRecordingStore {
    fn create(&self, meta: &RecordingMeta) -> Result<u64, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.insert(id, meta.clone());
        Ok(id)
    }

    fn finalize(
        &self,
        id: u64,
        ended_at: DateTime<Utc>,
        duration_secs: u64,
    ) -> Result<(), GatewayError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("recording {}", id)))?;
        row.ended_at = Some(ended_at);
        row.duration_secs = duration_secs;
        Ok(())
    }
}

/// In-memory monitored host records with status log and metric history.
#[derive(Default)]
pub struct MemoryMonitorStore {
    hosts: DashMap<u64, MonitoredHost>,
    status_log: DashMap<u64, Vec<StatusLogEntry>>,
    metric_records: DashMap<u64, Vec<MetricRecord>>,
}

impl MemoryMonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: impl IntoIterator<Item = MonitoredHost>) -> Self {
        let store = Self::new();
        for host in hosts {
            store.insert(host);
        }
        store
    }

    pub fn insert(&self, host: MonitoredHost) {
        self.hosts.insert(host.id, host);
    }

    pub fn status_log(&self, host_id: u64) -> Vec<StatusLogEntry> {
        self.status_log
            .get(&host_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    pub fn metric_records(&self, host_id: u64) -> Vec<MetricRecord> {
        self.metric_records
            .get(&host_id)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }
}

impl MonitorStore for MemoryMonitorStore {
    fn get_host(&self, host_id: u64) -> Option<MonitoredHost> {
        self.hosts.get(&host_id).map(|entry| entry.value().clone())
    }

    fn list_hosts(&self) -> Vec<MonitoredHost> {
        self.hosts.iter().map(|entry| entry.value().clone()).collect()
    }

    fn update_host(
        &self,
        host_id: u64,
        change: &mut dyn FnMut(&mut MonitoredHost),
    ) -> Result<MonitoredHost, GatewayError> {
        let mut entry = self
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("host {}", host_id)))?;
        change(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn append_status_log(&self, entry: StatusLogEntry) -> Result<(), GatewayError> {
        self.status_log.entry(entry.host_id).or_default().push(entry);
        Ok(())
    }

    fn append_metric_record(&self, record: MetricRecord) -> Result<(), GatewayError> {
        self.metric_records
            .entry(record.host_id)
            .or_default()
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::HostStatus;

    fn subject(user_id: u64, role: &str) -> Subject {
        Subject {
            user_id,
            username: format!("user{}", user_id),
            role: role.into(),
        }
    }

    fn entry(id: u64, owner_id: Option<u64>) -> SshHostEntry {
        SshHostEntry {
            id,
            owner_id,
            address: "10.0.0.1".into(),
            port: 22,
            username: "root".into(),
            password: Some("pw".into()),
            private_key: None,
            fingerprint: None,
        }
    }

    mod inventory {
        use super::*;

        #[test]
        fn test_parse_full_inventory() {
            let inventory = Inventory::parse(
                r#"{
                    "ssh_hosts": [{"id": 1, "address": "a", "username": "root"}],
                    "monitored_hosts": [{"id": 1, "name": "web", "monitor_enabled": true, "secret": "s"}]
                }"#,
            )
            .unwrap();
            assert_eq!(inventory.ssh_hosts[0].port, 22);
            assert_eq!(inventory.monitored_hosts[0].secret, "s");
            assert_eq!(inventory.monitored_hosts[0].traffic.reset_day, 1);
        }

        #[test]
        fn test_parse_rejects_garbage() {
            assert!(matches!(
                Inventory::parse("not json"),
                Err(GatewayError::Config(_))
            ));
        }
    }

    mod credentials {
        use super::*;

        #[test]
        fn test_owner_can_resolve() {
            let store = MemoryCredentialStore::from_entries([entry(1, Some(7))]);
            let host = store.resolve(&subject(7, "user"), 1).unwrap();
            assert_eq!(host.auth.password.as_deref(), Some("pw"));
        }

        #[test]
        fn test_other_user_gets_not_found() {
            let store = MemoryCredentialStore::from_entries([entry(1, Some(7))]);
            assert!(matches!(
                store.resolve(&subject(8, "user"), 1),
                Err(GatewayError::NotFound(_))
            ));
        }

        #[test]
        fn test_admin_can_resolve_any_host() {
            let store = MemoryCredentialStore::from_entries([entry(1, Some(7))]);
            assert!(store.resolve(&subject(8, "admin"), 1).is_ok());
        }

        #[test]
        fn test_fingerprint_is_persisted() {
            let store = MemoryCredentialStore::from_entries([entry(1, None)]);
            store.store_fingerprint(1, "SHA256:abc").unwrap();
            let host = store.resolve(&subject(1, "user"), 1).unwrap();
            assert_eq!(host.fingerprint.as_deref(), Some("SHA256:abc"));
        }
    }

    mod logs {
        use super::*;

        #[test]
        fn test_update_unknown_row_fails() {
            let log = MemoryConnectionLog::new();
            let host = MemoryCredentialStore::from_entries([entry(1, None)])
                .resolve(&subject(1, "user"), 1)
                .unwrap();
            let record = ConnectionRecord::connecting(&subject(1, "user"), &host, Utc::now());
            assert!(log.update(99, &record).is_err());
            let id = log.create(&record).unwrap();
            assert!(log.update(id, &record).is_ok());
            assert_eq!(log.rows().len(), 1);
        }
    }

    mod monitor {
        use super::*;

        fn host(id: u64) -> MonitoredHost {
            MonitoredHost {
                id,
                name: format!("host{}", id),
                monitor_enabled: true,
                secret: "s".into(),
                status: HostStatus::Offline,
                last_pulse: None,
                offline_threshold_minutes: None,
                notify_offline: false,
                notify_channels: Vec::new(),
                traffic: Default::default(),
                accounting: Default::default(),
            }
        }

        #[test]
        fn test_update_host_returns_new_state() {
            let store = MemoryMonitorStore::from_hosts([host(1)]);
            let updated = store
                .update_host(1, &mut |h| h.status = HostStatus::Online)
                .unwrap();
            assert_eq!(updated.status, HostStatus::Online);
            assert_eq!(store.get_host(1).unwrap().status, HostStatus::Online);
        }

        #[test]
        fn test_update_missing_host_fails() {
            let store = MemoryMonitorStore::new();
            assert!(store.update_host(1, &mut |_| {}).is_err());
        }
    }
}
