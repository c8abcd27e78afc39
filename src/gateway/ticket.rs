//! One-time ticket store.
//!
//! WebSocket upgrades cannot carry an `Authorization` header from a browser,
//! so the browser first obtains a short-lived ticket and presents it as a
//! query parameter. A ticket yields its subject exactly once.
//!
//! The ticket map is owned by a single task; callers talk to it through
//! [`TicketStore`], a cheap cloneable handle.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

use super::error::GatewayError;
use super::types::Subject;

/// Interval between sweeps of expired tickets.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_QUEUE_CAPACITY: usize = 256;

struct TicketEntry {
    subject: Subject,
    expires_at: Instant,
}

enum TicketCommand {
    Issue {
        subject: Subject,
        reply: oneshot::Sender<String>,
    },
    Consume {
        token: String,
        reply: oneshot::Sender<Option<Subject>>,
    },
}

/// Handle to the ticket actor.
#[derive(Clone)]
pub struct TicketStore {
    tx: mpsc::Sender<TicketCommand>,
}

impl TicketStore {
    /// Spawn the ticket actor. It stops once every handle is dropped.
    pub fn spawn(ttl: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run_tickets(rx, ttl));
        Self { tx }
    }

    /// Issue a new ticket for `subject`.
    pub async fn issue(&self, subject: Subject) -> Result<String, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TicketCommand::Issue { subject, reply })
            .await
            .map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())
    }

    /// Consume a ticket. Succeeds at most once per ticket.
    pub async fn consume(&self, token: &str) -> Result<Subject, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TicketCommand::Consume {
                token: token.to_string(),
                reply,
            })
            .await
            .map_err(|_| unavailable())?;
        rx.await
            .map_err(|_| unavailable())?
            .ok_or_else(|| GatewayError::Auth("invalid or expired ticket".to_string()))
    }
}

fn unavailable() -> GatewayError {
    GatewayError::Storage("ticket store unavailable".to_string())
}

async fn run_tickets(mut rx: mpsc::Receiver<TicketCommand>, ttl: Duration) {
    let mut tickets: HashMap<String, TicketEntry> = HashMap::new();
    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    TicketCommand::Issue { subject, reply } => {
                        let token = Uuid::new_v4().simple().to_string();
                        tickets.insert(
                            token.clone(),
                            TicketEntry {
                                subject,
                                expires_at: Instant::now() + ttl,
                            },
                        );
                        let _ = reply.send(token);
                    }
                    TicketCommand::Consume { token, reply } => {
                        // Removed whether or not it is still valid
                        let subject = tickets
                            .remove(&token)
                            .filter(|entry| Instant::now() < entry.expires_at)
                            .map(|entry| entry.subject);
                        let _ = reply.send(subject);
                    }
                }
            }
            _ = purge.tick() => {
                let now = Instant::now();
                let before = tickets.len();
                tickets.retain(|_, entry| now < entry.expires_at);
                let purged = before - tickets.len();
                if purged > 0 {
                    debug!("Purged {} expired ticket(s)", purged);
                }
            }
        }
    }
}
