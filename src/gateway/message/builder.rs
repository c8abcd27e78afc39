//! Builder for notification messages.
//!
//! These builders follow the fluent API pattern. Placeholders in the
//! template are `{{emoji}}`, `{{event}}`, `{{client}}`, `{{message}}` and
//! `{{time}}`.

use chrono::{DateTime, Utc};

/// Template used when none is configured.
pub const DEFAULT_NOTIFICATION_TEMPLATE: &str = "{{emoji}}{{emoji}}{{emoji}}
Event: {{event}}
Clients: {{client}}
Message: {{message}}
Time: {{time}}";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What a notification is about; selects the emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Offline,
    Online,
    Traffic,
    Info,
}

impl NotificationKind {
    pub fn emoji(self) -> &'static str {
        match self {
            NotificationKind::Offline => "🔴",
            NotificationKind::Online => "🟢",
            NotificationKind::Traffic => "⚠️",
            NotificationKind::Info => "ℹ️",
        }
    }
}

/// Builder for a rendered notification body.
///
/// # Example
///
/// ```ignore
/// let body = NotificationBuilder::new(NotificationKind::Offline, "Host Offline Alert: web-1")
///     .with_client("web-1")
///     .with_message("Host 'web-1' (ID: 1) has gone offline.")
///     .at(Utc::now())
///     .build();
/// ```
pub struct NotificationBuilder {
    kind: NotificationKind,
    event: String,
    client: String,
    message: String,
    time: Option<DateTime<Utc>>,
    template: Option<String>,
}

impl NotificationBuilder {
    pub fn new(kind: NotificationKind, event: impl Into<String>) -> Self {
        Self {
            kind,
            event: event.into(),
            client: String::new(),
            message: String::new(),
            time: None,
            template: None,
        }
    }

    /// Name of the host the notification is about.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Override the template. Blank templates are ignored.
    pub fn with_template(mut self, template: Option<impl Into<String>>) -> Self {
        self.template = template.map(Into::into).filter(|t| !t.trim().is_empty());
        self
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Render the notification body.
    pub fn build(&self) -> String {
        let template = self
            .template
            .as_deref()
            .unwrap_or(DEFAULT_NOTIFICATION_TEMPLATE);
        let time = self.time.unwrap_or_else(Utc::now).format(TIME_FORMAT);

        template
            .replace("{{emoji}}", self.kind.emoji())
            .replace("{{event}}", &self.event)
            .replace("{{client}}", &self.client)
            .replace("{{message}}", &self.message)
            .replace("{{time}}", &time.to_string())
    }
}
