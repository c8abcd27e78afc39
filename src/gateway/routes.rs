//! HTTP and WebSocket surface.
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `GET /ws/ssh/:host_id` | `ticket` query | Session bridge |
//! | `GET /ws/monitor` | `ticket` query | Dashboard stream |
//! | `POST /api/monitor/pulse` | per-host bearer secret | Agent pulse |
//! | `PUT /api/monitor/hosts/:id/settings` | `ticket` query | Traffic settings |
//! | `POST /api/monitor/hosts/:id/stop` | `ticket` query | Stop monitoring |
//! | `POST /api/tickets` | admin bearer token | Issue a ticket |
//! | `GET /health` | none | Liveness |
//!
//! Tickets are consumed before any upgrade or side effect.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use poem::http::StatusCode;
use poem::middleware::Tracing;
use poem::web::websocket::{Message, WebSocket};
use poem::web::{Data, Json, Path, Query};
use poem::{Endpoint, EndpointExt, IntoResponse, Request, Route, get, handler, post, put};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::bridge::{SessionBridge, SessionRequest};
use super::config::PING_INTERVAL;
use super::error::GatewayError;
use super::hub::MonitorHub;
use super::ingest::{MetricIngest, constant_time_eq};
use super::storage::MonitorStore;
use super::ticket::TicketStore;
use super::traffic::{apply_settings, validate_settings};
use super::types::{MetricPulse, MonitorSettingsUpdate, MonitoredHost, PtySize, Subject};

/// Shared state behind every route.
pub struct AppState {
    pub tickets: TicketStore,
    pub bridge: Arc<SessionBridge>,
    pub hub: MonitorHub,
    pub ingest: MetricIngest,
    pub monitor_store: Arc<dyn MonitorStore>,
    /// Enables `POST /api/tickets` when set
    pub admin_token: Option<String>,
    pub ticket_ttl: Duration,
}

/// Build the route tree.
pub fn routes(state: Arc<AppState>) -> impl Endpoint {
    Route::new()
        .at("/health", get(health))
        .at("/ws/ssh/:host_id", get(ssh_session))
        .at("/ws/monitor", get(monitor_stream))
        .at("/api/monitor/pulse", post(pulse))
        .at("/api/monitor/hosts/:id/settings", put(update_settings))
        .at("/api/monitor/hosts/:id/stop", post(stop_monitoring))
        .at("/api/tickets", post(issue_ticket))
        .data(state)
        .with(Tracing)
}

fn http_error(error: GatewayError) -> poem::Error {
    let status = match &error {
        GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Config(_) | GatewayError::Credential(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    poem::Error::from_string(error.to_string(), status)
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.header("Authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Deserialize)]
struct TicketQuery {
    ticket: String,
}

async fn redeem(state: &AppState, ticket: &str) -> poem::Result<Subject> {
    state.tickets.consume(ticket).await.map_err(|e| {
        debug!("Ticket rejected: {}", e);
        http_error(e)
    })
}

#[handler]
fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Session bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionQuery {
    ticket: String,
    #[serde(default)]
    record: bool,
    rows: Option<u32>,
    cols: Option<u32>,
}

#[handler]
async fn ssh_session(
    Path(host_id): Path<u64>,
    Query(query): Query<SessionQuery>,
    ws: WebSocket,
    state: Data<&Arc<AppState>>,
) -> poem::Result<impl IntoResponse> {
    let subject = redeem(&state, &query.ticket).await?;
    let request = SessionRequest {
        subject,
        host_id,
        pty: PtySize::from_optional(query.rows, query.cols),
        record: query.record,
    };
    let bridge = state.bridge.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        if let Err(e) = bridge.run(request, sink, stream).await {
            debug!(host_id, "Session ended before the shell started: {}", e);
        }
    }))
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[handler]
async fn monitor_stream(
    Query(query): Query<TicketQuery>,
    ws: WebSocket,
    state: Data<&Arc<AppState>>,
) -> poem::Result<impl IntoResponse> {
    let subject = redeem(&state, &query.ticket).await?;
    let hub = state.hub.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sink, mut stream) = socket.split();
        let mut subscription = hub.subscribe().await;
        info!(
            subscriber = %subscription.id,
            user_id = subject.user_id,
            "Dashboard connected"
        );

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            tokio::select! {
                frame = subscription.frames.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        hub.unsubscribe(subscription.id).await;
        let _ = sink.close().await;
        info!(subscriber = %subscription.id, "Dashboard disconnected");
    }))
}

// ---------------------------------------------------------------------------
// Monitoring API
// ---------------------------------------------------------------------------

#[handler]
async fn pulse(
    req: &Request,
    Json(pulse): Json<MetricPulse>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<serde_json::Value>> {
    let secret = bearer_token(req).ok_or_else(|| {
        poem::Error::from_string("missing bearer secret", StatusCode::UNAUTHORIZED)
    })?;

    let host_id = pulse.host_id;
    match state.ingest.ingest(secret, pulse).await {
        Ok(_) => Ok(Json(json!({ "status": "ok" }))),
        Err(GatewayError::Auth(msg)) => {
            warn!(host_id, "Pulse rejected: {}", msg);
            Err(poem::Error::from_string(msg, StatusCode::FORBIDDEN))
        }
        Err(e) => Err(http_error(e)),
    }
}

#[handler]
async fn update_settings(
    Path(id): Path<u64>,
    Query(query): Query<TicketQuery>,
    Json(update): Json<MonitorSettingsUpdate>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<serde_json::Value>> {
    let subject = redeem(&state, &query.ticket).await?;
    validate_settings(&update).map_err(http_error)?;

    let host = state
        .monitor_store
        .update_host(id, &mut |host: &mut MonitoredHost| apply_settings(host, &update))
        .map_err(http_error)?;

    info!(
        host_id = id,
        user_id = subject.user_id,
        "Monitoring settings updated"
    );
    Ok(Json(json!({
        "status": "ok",
        "traffic": host.traffic,
        "offline_threshold_minutes": host.offline_threshold_minutes,
        "notify_offline": host.notify_offline,
        "notify_channels": host.notify_channels,
    })))
}

#[handler]
async fn stop_monitoring(
    Path(id): Path<u64>,
    Query(query): Query<TicketQuery>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<serde_json::Value>> {
    let subject = redeem(&state, &query.ticket).await?;

    state
        .monitor_store
        .update_host(id, &mut |host: &mut MonitoredHost| host.monitor_enabled = false)
        .map_err(http_error)?;
    state.hub.remove_host(id).await;

    info!(host_id = id, user_id = subject.user_id, "Monitoring stopped");
    Ok(Json(json!({ "status": "ok" })))
}

#[handler]
async fn issue_ticket(
    req: &Request,
    Json(subject): Json<Subject>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<serde_json::Value>> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(poem::Error::from_string(
            "ticket issuance disabled",
            StatusCode::NOT_FOUND,
        ));
    };
    let provided = bearer_token(req).unwrap_or_default();
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(poem::Error::from_string(
            "invalid admin token",
            StatusCode::UNAUTHORIZED,
        ));
    }

    let user_id = subject.user_id;
    let ticket = state.tickets.issue(subject).await.map_err(http_error)?;
    debug!(user_id, "Ticket issued");
    Ok(Json(json!({
        "ticket": ticket,
        "expires_in": state.ticket_ttl.as_secs(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::{DialOutcome, RemoteDialer};
    use crate::gateway::config::BridgeSettings;
    use crate::gateway::notify::NotificationDispatcher;
    use crate::gateway::notify::testing::CollectingNotifier;
    use crate::gateway::storage::{
        MemoryConnectionLog, MemoryCredentialStore, MemoryMonitorStore, MemoryRecordingStore,
    };
    use crate::gateway::types::{HostStatus, RemoteHostRef};
    use async_trait::async_trait;
    use poem::test::TestClient;
    use tokio_util::sync::CancellationToken;

    struct RefusingDialer;

    #[async_trait]
    impl RemoteDialer for RefusingDialer {
        async fn dial(&self, _: &RemoteHostRef, _: Duration) -> Result<DialOutcome, GatewayError> {
            Err(GatewayError::Connect("Connection refused".into()))
        }
    }

    fn monitored(id: u64) -> MonitoredHost {
        MonitoredHost {
            id,
            name: format!("host{}", id),
            monitor_enabled: true,
            secret: "agent-secret".into(),
            status: HostStatus::Offline,
            last_pulse: None,
            offline_threshold_minutes: None,
            notify_offline: false,
            notify_channels: Vec::new(),
            traffic: Default::default(),
            accounting: Default::default(),
        }
    }

    fn state(admin_token: Option<&str>) -> (Arc<AppState>, Arc<MemoryMonitorStore>) {
        let store = Arc::new(MemoryMonitorStore::from_hosts([monitored(1)]));
        let hub = MonitorHub::spawn(CancellationToken::new());
        let dispatcher =
            NotificationDispatcher::new(Arc::new(CollectingNotifier::default()), None);
        let bridge = SessionBridge::new(
            Arc::new(RefusingDialer),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryConnectionLog::new()),
            Arc::new(MemoryRecordingStore::new()),
            BridgeSettings {
                connect_timeout: Duration::from_secs(1),
                idle_timeout: None,
                ping_interval: PING_INTERVAL,
                recording_dir: std::env::temp_dir(),
                drain_grace: Duration::from_millis(100),
            },
        );

        let state = Arc::new(AppState {
            tickets: TicketStore::spawn(Duration::from_secs(30)),
            bridge: Arc::new(bridge),
            hub: hub.clone(),
            ingest: MetricIngest::new(store.clone(), hub, dispatcher),
            monitor_store: store.clone(),
            admin_token: admin_token.map(String::from),
            ticket_ttl: Duration::from_secs(30),
        });
        (state, store)
    }

    fn subject() -> Subject {
        Subject {
            user_id: 7,
            username: "alice".into(),
            role: "admin".into(),
        }
    }

    async fn body_json(resp: poem::test::TestResponse) -> serde_json::Value {
        let text = resp.0.into_body().into_string().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    mod liveness {
        use super::*;

        #[tokio::test]
        async fn test_health_ok() {
            let (state, _) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli.get("/health").send().await;
            resp.assert_status_is_ok();
        }
    }

    mod agent_pulse {
        use super::*;

        fn body(host_id: u64) -> serde_json::Value {
            json!({ "host_id": host_id, "cpu": 12.5, "net_rx": 100, "net_tx": 50 })
        }

        #[tokio::test]
        async fn test_valid_secret_accepted() {
            let (state, store) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli
                .post("/api/monitor/pulse")
                .header("Authorization", "Bearer agent-secret")
                .body_json(&body(1))
                .send()
                .await;
            resp.assert_status_is_ok();
            assert_eq!(store.get_host(1).unwrap().status, HostStatus::Online);
        }

        #[tokio::test]
        async fn test_wrong_secret_forbidden_without_side_effects() {
            let (state, store) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli
                .post("/api/monitor/pulse")
                .header("Authorization", "Bearer nope")
                .body_json(&body(1))
                .send()
                .await;
            resp.assert_status(StatusCode::FORBIDDEN);
            assert!(store.get_host(1).unwrap().last_pulse.is_none());
        }

        #[tokio::test]
        async fn test_missing_secret_unauthorized() {
            let (state, _) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli.post("/api/monitor/pulse").body_json(&body(1)).send().await;
            resp.assert_status(StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_unknown_host_not_found() {
            let (state, _) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli
                .post("/api/monitor/pulse")
                .header("Authorization", "Bearer agent-secret")
                .body_json(&body(42))
                .send()
                .await;
            resp.assert_status(StatusCode::NOT_FOUND);
        }
    }

    mod settings {
        use super::*;

        #[tokio::test]
        async fn test_update_requires_ticket() {
            let (state, _) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli
                .put("/api/monitor/hosts/1/settings")
                .query("ticket", &"bogus")
                .body_json(&json!({ "limit": 1000 }))
                .send()
                .await;
            resp.assert_status(StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_update_applies_and_ticket_is_single_use() {
            let (state, store) = state(None);
            let ticket = state.tickets.issue(subject()).await.unwrap();
            let cli = TestClient::new(routes(state));

            let resp = cli
                .put("/api/monitor/hosts/1/settings")
                .query("ticket", &ticket)
                .body_json(&json!({ "limit": 1000, "reset_day": 5 }))
                .send()
                .await;
            resp.assert_status_is_ok();
            let host = store.get_host(1).unwrap();
            assert_eq!(host.traffic.limit, 1000);
            assert_eq!(host.traffic.reset_day, 5);

            let again = cli
                .put("/api/monitor/hosts/1/settings")
                .query("ticket", &ticket)
                .body_json(&json!({ "limit": 1 }))
                .send()
                .await;
            again.assert_status(StatusCode::UNAUTHORIZED);
            assert_eq!(store.get_host(1).unwrap().traffic.limit, 1000);
        }

        #[tokio::test]
        async fn test_out_of_range_reset_day_rejected() {
            let (state, store) = state(None);
            let ticket = state.tickets.issue(subject()).await.unwrap();
            let cli = TestClient::new(routes(state));

            let resp = cli
                .put("/api/monitor/hosts/1/settings")
                .query("ticket", &ticket)
                .body_json(&json!({ "reset_day": 32 }))
                .send()
                .await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            assert_ne!(store.get_host(1).unwrap().traffic.reset_day, 32);
        }

        #[tokio::test]
        async fn test_stop_disables_monitoring() {
            let (state, store) = state(None);
            let ticket = state.tickets.issue(subject()).await.unwrap();
            let cli = TestClient::new(routes(state));

            let resp = cli
                .post("/api/monitor/hosts/1/stop")
                .query("ticket", &ticket)
                .send()
                .await;
            resp.assert_status_is_ok();
            assert!(!store.get_host(1).unwrap().monitor_enabled);
        }
    }

    mod tickets {
        use super::*;

        #[tokio::test]
        async fn test_disabled_without_admin_token() {
            let (state, _) = state(None);
            let cli = TestClient::new(routes(state));
            let resp = cli.post("/api/tickets").body_json(&subject()).send().await;
            resp.assert_status(StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn test_wrong_admin_token_rejected() {
            let (state, _) = state(Some("root-token"));
            let cli = TestClient::new(routes(state));
            let resp = cli
                .post("/api/tickets")
                .header("Authorization", "Bearer guess")
                .body_json(&subject())
                .send()
                .await;
            resp.assert_status(StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_issued_ticket_redeems_once() {
            let (state, _) = state(Some("root-token"));
            let tickets = state.tickets.clone();
            let cli = TestClient::new(routes(state));
            let resp = cli
                .post("/api/tickets")
                .header("Authorization", "Bearer root-token")
                .body_json(&subject())
                .send()
                .await;
            resp.assert_status_is_ok();

            let body = body_json(resp).await;
            let ticket = body["ticket"].as_str().unwrap().to_string();
            assert_eq!(body["expires_in"], 30);
            assert_eq!(tickets.consume(&ticket).await.unwrap(), subject());
            assert!(tickets.consume(&ticket).await.is_err());
        }
    }
}
