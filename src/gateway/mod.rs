//! SSH gateway and monitoring hub.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and retry classification
//! - `types`: Data model shared by the bridge and the monitoring pipeline
//! - `auth`, `session`, `shell`, `client`: SSH dialing, host key checks and
//!   PTY shell streams
//! - `bridge`: Browser WebSocket to remote shell session bridge
//! - `recorder`: Append-only session recordings
//! - `ticket`: One-time tickets for WebSocket upgrades
//! - `traffic`, `ingest`: Agent pulses and monthly traffic accounting
//! - `hub`: Live snapshot fan-out to dashboards
//! - `sweeper`: Online to offline transitions
//! - `message`, `notify`: Operator notifications
//! - `storage`: Persistence collaborators and in-memory implementations
//! - `routes`: HTTP and WebSocket surface

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod message;
pub mod notify;
pub mod recorder;
pub mod routes;
pub mod session;
pub mod shell;
pub mod storage;
pub mod sweeper;
pub mod ticket;
pub mod traffic;
pub mod types;

pub use bridge::{SessionBridge, SessionRequest};
pub use client::SshDialer;
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use hub::MonitorHub;
pub use ingest::MetricIngest;
pub use notify::{NotificationDispatcher, TracingNotifier};
pub use routes::{AppState, routes};
pub use sweeper::OfflineSweeper;
pub use ticket::TicketStore;
