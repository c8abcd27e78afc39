//! Configuration resolution for the SSH gateway.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HTTP_PORT` | 8080 | Listening port for HTTP and WebSocket routes |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_IDLE_TIMEOUT` | 1800s | Inbound idle timeout in seconds (0 disables) |
//! | `SSH_MAX_RETRIES` | 2 | Maximum dial retry attempts |
//! | `SSH_RETRY_DELAY_MS` | 500ms | Initial retry delay in milliseconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `RECORDING_DIR` | data/recordings | Directory for session recordings |
//! | `TICKET_TTL_SECS` | 30 | Lifetime of one-time tickets |
//! | `HOSTS_FILE` | unset | JSON inventory used to seed the in-memory stores |
//! | `GATEWAY_ADMIN_TOKEN` | unset | Bearer token enabling ticket issuance |
//! | `NOTIFICATION_TEMPLATE` | built-in | Template for operator notifications |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP listening port
pub(crate) const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default inbound idle timeout in seconds (30 minutes)
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Default maximum retry attempts for SSH connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap (10 seconds)
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default one-time ticket lifetime in seconds
pub(crate) const DEFAULT_TICKET_TTL_SECS: u64 = 30;

/// Default directory for session recordings
pub(crate) const DEFAULT_RECORDING_DIR: &str = "data/recordings";

/// Interval between WebSocket keep-alive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Hosts whose last update is older than this are left out of broadcasts
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(15);

/// Interval of the offline sweeper
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum spacing between persisted metric snapshots for one host
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Terminal type requested for every PTY
pub const TERM_TYPE: &str = "xterm-256color";

pub(crate) const HTTP_PORT_ENV_VAR: &str = "HTTP_PORT";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "SSH_IDLE_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const RECORDING_DIR_ENV_VAR: &str = "RECORDING_DIR";
pub(crate) const TICKET_TTL_ENV_VAR: &str = "TICKET_TTL_SECS";
pub(crate) const HOSTS_FILE_ENV_VAR: &str = "HOSTS_FILE";
pub(crate) const ADMIN_TOKEN_ENV_VAR: &str = "GATEWAY_ADMIN_TOKEN";
pub(crate) const NOTIFICATION_TEMPLATE_ENV_VAR: &str = "NOTIFICATION_TEMPLATE";

/// Read and parse an environment variable, ignoring unset or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Resolve the HTTP port with priority: parameter -> env var -> default
pub(crate) fn resolve_http_port(port_param: Option<u16>) -> u16 {
    port_param
        .or_else(|| env_parse(HTTP_PORT_ENV_VAR))
        .unwrap_or(DEFAULT_HTTP_PORT)
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the inbound idle timeout. Zero disables idle enforcement.
pub(crate) fn resolve_idle_timeout(timeout_param: Option<u64>) -> Option<Duration> {
    let secs = timeout_param
        .or_else(|| env_parse(IDLE_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Resolve the max retries value with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parse(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    let ms = retry_delay_param
        .or_else(|| env_parse(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Resolve the recording directory with priority: parameter -> env var -> default
pub(crate) fn resolve_recording_dir(dir_param: Option<PathBuf>) -> PathBuf {
    dir_param
        .or_else(|| env::var(RECORDING_DIR_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDING_DIR))
}

/// Resolve the ticket lifetime with priority: parameter -> env var -> default
pub(crate) fn resolve_ticket_ttl(ttl_param: Option<u64>) -> Duration {
    let secs = ttl_param
        .or_else(|| env_parse(TICKET_TTL_ENV_VAR))
        .unwrap_or(DEFAULT_TICKET_TTL_SECS);
    Duration::from_secs(secs)
}

/// Settings shared by every session bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub connect_timeout: Duration,
    /// Sliding read deadline on the browser side; `None` disables it.
    pub idle_timeout: Option<Duration>,
    pub ping_interval: Duration,
    pub recording_dir: PathBuf,
    /// How long teardown waits for the output pumps to drain.
    pub drain_grace: Duration,
}

impl BridgeSettings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            idle_timeout: resolve_idle_timeout(None),
            ping_interval: PING_INTERVAL,
            recording_dir: resolve_recording_dir(None),
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// Dial tuning for the SSH client.
#[derive(Debug, Clone, Copy)]
pub struct DialSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
}

impl DialSettings {
    pub fn from_env() -> Self {
        Self {
            max_retries: resolve_max_retries(None),
            retry_delay: resolve_retry_delay(None),
            compress: resolve_compression(None),
        }
    }
}

/// Top-level service configuration assembled in `main`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub ticket_ttl: Duration,
    pub hosts_file: Option<PathBuf>,
    pub admin_token: Option<String>,
    pub notification_template: Option<String>,
    pub bridge: BridgeSettings,
    pub dial: DialSettings,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            http_port: resolve_http_port(None),
            ticket_ttl: resolve_ticket_ttl(None),
            hosts_file: env::var(HOSTS_FILE_ENV_VAR).ok().map(PathBuf::from),
            admin_token: env::var(ADMIN_TOKEN_ENV_VAR)
                .ok()
                .filter(|t| !t.trim().is_empty()),
            notification_template: env::var(NOTIFICATION_TEMPLATE_ENV_VAR).ok(),
            bridge: BridgeSettings::from_env(),
            dial: DialSettings::from_env(),
        }
    }
}
