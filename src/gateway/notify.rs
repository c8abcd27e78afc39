//! Notification dispatch.
//!
//! Delivery itself (email, chat, ...) is an external collaborator behind
//! [`Notifier`]. The bundled [`TracingNotifier`] writes notifications to the
//! log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::GatewayError;
use super::message::{NotificationBuilder, NotificationKind};
use super::types::MonitoredHost;

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub event: String,
    pub body: String,
}

/// Delivery channel collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, notification: &Notification) -> Result<(), GatewayError>;
}

/// Notifier that only logs.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, channel: &str, notification: &Notification) -> Result<(), GatewayError> {
        info!(
            channel,
            kind = ?notification.kind,
            "Notification: {}\n{}",
            notification.event,
            notification.body
        );
        Ok(())
    }
}

/// Renders notifications and fans them out to a host's channels.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    template: Option<String>,
}

/// Lowercased, trimmed, de-duplicated channel names.
fn normalize_channels(channels: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for channel in channels {
        let channel = channel.trim().to_lowercase();
        if !channel.is_empty() && !normalized.contains(&channel) {
            normalized.push(channel);
        }
    }
    normalized
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, template: Option<String>) -> Self {
        Self { notifier, template }
    }

    /// Send to every configured channel of `host`, once per channel.
    /// Returns how many deliveries succeeded.
    pub async fn notify_host(&self, host: &MonitoredHost, builder: NotificationBuilder) -> usize {
        let channels = normalize_channels(&host.notify_channels);
        if channels.is_empty() {
            return 0;
        }

        let builder = builder
            .with_client(host.name.clone())
            .with_template(self.template.clone());
        let notification = Notification {
            kind: builder.kind(),
            event: builder.event().to_string(),
            body: builder.build(),
        };

        let mut delivered = 0;
        for channel in &channels {
            match self.notifier.send(channel, &notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    host_id = host.id,
                    channel = channel.as_str(),
                    "Notification delivery failed: {}",
                    e
                ),
            }
        }
        delivered
    }
}
