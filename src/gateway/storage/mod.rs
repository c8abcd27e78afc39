//! Persistence collaborators.
//!
//! This module provides trait-based storage abstractions that enable:
//! - Dependency injection for testability
//! - Lock-free concurrent access via DashMap implementations
//! - Clean separation between storage and the bridge/monitoring logic

mod memory;
mod traits;

pub use memory::{
    Inventory, MemoryConnectionLog, MemoryCredentialStore, MemoryMonitorStore,
    MemoryRecordingStore, SshHostEntry,
};
pub use traits::{ConnectionLogStore, CredentialStore, MonitorStore, RecordingStore};
