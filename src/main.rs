#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use ssh_gateway::gateway::storage::{
    Inventory, MemoryConnectionLog, MemoryCredentialStore, MemoryMonitorStore,
    MemoryRecordingStore,
};
use ssh_gateway::gateway::{
    AppState, GatewayConfig, MetricIngest, MonitorHub, NotificationDispatcher, OfflineSweeper,
    SessionBridge, SshDialer, TicketStore, TracingNotifier, routes,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = GatewayConfig::from_env();

    let inventory = match &config.hosts_file {
        Some(path) => {
            let inventory = Inventory::load(path).await?;
            info!(
                "Loaded {} SSH hosts and {} monitored hosts from {}",
                inventory.ssh_hosts.len(),
                inventory.monitored_hosts.len(),
                path.display()
            );
            inventory
        }
        None => {
            warn!("HOSTS_FILE not set, starting with empty inventories");
            Inventory::default()
        }
    };

    let credentials = Arc::new(MemoryCredentialStore::from_entries(inventory.ssh_hosts));
    let monitor_store = Arc::new(MemoryMonitorStore::from_hosts(inventory.monitored_hosts));

    let cancel = CancellationToken::new();
    let hub = MonitorHub::spawn(cancel.clone());
    let notifications = NotificationDispatcher::new(
        Arc::new(TracingNotifier),
        config.notification_template.clone(),
    );

    let sweeper = OfflineSweeper::new(monitor_store.clone(), notifications.clone());
    let sweeper_task = tokio::spawn(sweeper.run(cancel.clone()));

    let bridge = SessionBridge::new(
        Arc::new(SshDialer::new(config.dial)),
        credentials,
        Arc::new(MemoryConnectionLog::new()),
        Arc::new(MemoryRecordingStore::new()),
        config.bridge.clone(),
    );

    if config.admin_token.is_none() {
        info!("GATEWAY_ADMIN_TOKEN not set, ticket issuance over HTTP is disabled");
    }

    let state = Arc::new(AppState {
        tickets: TicketStore::spawn(config.ticket_ttl),
        bridge: Arc::new(bridge),
        hub: hub.clone(),
        ingest: MetricIngest::new(monitor_store.clone(), hub, notifications),
        monitor_store,
        admin_token: config.admin_token.clone(),
        ticket_ttl: config.ticket_ttl,
    });

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!("Starting SSH gateway on {}", addr);

    let result = Server::new(TcpListener::bind(addr))
        .name("SSH Gateway")
        .run_with_graceful_shutdown(
            routes(state),
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            None,
        )
        .await;

    cancel.cancel();
    let _ = sweeper_task.await;

    result?;
    Ok(())
}
