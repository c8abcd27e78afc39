//! Message building utilities for operator notifications.
//!
//! Notifications are rendered from a plain-text template so deployments can
//! reword them without code changes.

mod builder;

pub use builder::{DEFAULT_NOTIFICATION_TEMPLATE, NotificationBuilder, NotificationKind};
