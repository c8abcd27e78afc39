//! Remote session client: SSH dial, PTY shell, resize, keep-alive, close.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: Build the russh client configuration with
//!    compression preferences. There is no inactivity timeout and no
//!    background keepalive timer; liveness is probed on demand by the bridge.
//!
//! 2. **Connection Establishment**: TCP + SSH handshake bounded by the
//!    connect timeout. The host key is checked by [`SshClientHandler`]
//!    (trust on first use, exact match afterwards).
//!
//! 3. **Authentication**: Password, then private key material, via
//!    [`AuthChain`].
//!
//! 4. **Shell**: One session channel with a PTY and an interactive shell,
//!    exposed as [`ShellStreams`].
//!
//! ## Retry Strategy
//!
//! Dials use exponential backoff with jitter via the `backon` crate. Only
//! transient connection errors are retried; authentication failures and
//! host key mismatches fail immediately.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{Disconnect, Pty, client};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::{DialSettings, MAX_RETRY_DELAY};
use super::error::GatewayError;
use super::session::{FingerprintSlot, SshClientHandler};
use super::shell::{ChannelWriter, ShellStreams, spawn_output_demux};
use super::types::{PtySize, RemoteHostRef};

/// Terminal modes requested with every PTY: echo on, 14400 baud both ways.
const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// An established remote session, as the bridge sees it.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a session channel, allocate a PTY of `size` with terminal type
    /// `term`, start the shell and return its streams.
    async fn open_shell_session(
        &self,
        term: &str,
        size: PtySize,
    ) -> Result<ShellStreams, GatewayError>;

    /// Resize the PTY of the open shell.
    async fn resize(&self, size: PtySize) -> Result<(), GatewayError>;

    /// Send a no-op protocol request to probe liveness.
    async fn keepalive(&self) -> Result<(), GatewayError>;

    /// Release the shell channel and the connection. Idempotent.
    async fn close(&self);
}

/// Result of a successful dial.
pub struct DialOutcome {
    pub session: Arc<dyn RemoteSession>,
    /// Fingerprint observed during the handshake, for TOFU persistence
    pub observed_fingerprint: Option<String>,
}

/// Factory for remote sessions.
#[async_trait]
pub trait RemoteDialer: Send + Sync {
    async fn dial(
        &self,
        host: &RemoteHostRef,
        timeout: Duration,
    ) -> Result<DialOutcome, GatewayError>;
}

/// Build russh client configuration.
///
/// Inactivity timeout and keepalive timer are disabled: idle enforcement is
/// done on the browser side and keepalives are sent on demand.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: None,
        preferred,
        ..Default::default()
    })
}

/// Translate a handshake error, turning a rejected host key into a hard
/// authentication failure that names both fingerprints.
fn classify_dial_error(
    err: russh::Error,
    expected: Option<&str>,
    observed: &FingerprintSlot,
) -> GatewayError {
    if matches!(err, russh::Error::UnknownKey) {
        let observed = observed.lock().ok().and_then(|slot| slot.clone());
        return GatewayError::Auth(format!(
            "host key fingerprint mismatch: expected {}, got {}",
            expected.unwrap_or("<none>"),
            observed.as_deref().unwrap_or("<unknown>")
        ));
    }
    GatewayError::Connect(format!("Failed to connect: {}", err))
}

/// SSH implementation of [`RemoteSession`].
pub struct RemoteSessionClient {
    handle: client::Handle<SshClientHandler>,
    shell: Mutex<Option<Arc<ChannelWriter>>>,
    fingerprint: Option<String>,
}

impl RemoteSessionClient {
    /// Dial with retry using exponential backoff with jitter.
    ///
    /// # Returns
    ///
    /// * `Ok((client, retry_count))` - Connected client and number of retries needed
    /// * `Err(_)` - Last error after retries were exhausted, or the first
    ///   non-retryable error
    pub async fn connect_with_retry(
        host: &RemoteHostRef,
        timeout: Duration,
        settings: DialSettings,
    ) -> Result<(Self, u32), GatewayError> {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(settings.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(settings.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!(
                    "SSH connection retry attempt {} to {}@{}",
                    current_attempt,
                    host.username,
                    host.endpoint()
                );
            }
            Self::connect(host, timeout, settings.compress).await
        })
        .retry(backoff)
        .when(|e: &GatewayError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!(
                    "SSH connection to {}@{} failed with non-retryable error: {}",
                    host.username,
                    host.endpoint(),
                    e
                );
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        let retry_count = total_attempts.saturating_sub(1);

        match result {
            Ok(client) => {
                if retry_count > 0 {
                    info!(
                        "SSH connection to {}@{} succeeded after {} retry attempt(s)",
                        host.username,
                        host.endpoint(),
                        retry_count
                    );
                }
                Ok((client, retry_count))
            }
            Err(e) => {
                error!(
                    "SSH connection to {}@{} failed after {} attempt(s). Last error: {}",
                    host.username,
                    host.endpoint(),
                    total_attempts,
                    e
                );
                Err(e)
            }
        }
    }

    /// Establish one SSH connection and authenticate.
    pub async fn connect(
        host: &RemoteHostRef,
        timeout: Duration,
        compress: bool,
    ) -> Result<Self, GatewayError> {
        if host.auth.is_empty() {
            return Err(GatewayError::Credential(
                "No authentication method provided".to_string(),
            ));
        }
        let auth_chain = AuthChain::from_material(&host.auth);
        debug!(
            "Authenticating {} with {}",
            host.username,
            auth_chain.names().join(", ")
        );

        let config = build_client_config(compress);
        let observed: FingerprintSlot = Arc::new(StdMutex::new(None));
        let handler = SshClientHandler::new(host.fingerprint.clone(), observed.clone());

        let connect_future = client::connect(config, (host.address.as_str(), host.port), handler);

        let mut handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| {
                GatewayError::Connect(format!("Connection timed out after {:?}", timeout))
            })?
            .map_err(|e| classify_dial_error(e, host.fingerprint.as_deref(), &observed))?;

        let success = auth_chain.authenticate(&mut handle, &host.username).await?;
        if !success {
            return Err(GatewayError::Auth(
                "no authentication methods succeeded".to_string(),
            ));
        }

        let fingerprint = observed.lock().ok().and_then(|slot| slot.clone());
        debug!(
            "Connected to {}@{} (host key {:?})",
            host.username,
            host.endpoint(),
            fingerprint
        );

        Ok(Self {
            handle,
            shell: Mutex::new(None),
            fingerprint,
        })
    }

    /// Fingerprint observed during the handshake.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

#[async_trait]
impl RemoteSession for RemoteSessionClient {
    async fn open_shell_session(
        &self,
        term: &str,
        size: PtySize,
    ) -> Result<ShellStreams, GatewayError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Protocol(format!("Failed to create session: {}", e)))?;

        channel
            .request_pty(true, term, size.cols, size.rows, 0, 0, PTY_MODES)
            .await
            .map_err(|e| GatewayError::Protocol(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| GatewayError::Protocol(format!("Failed to start shell: {}", e)))?;

        let (read_half, write_half) = channel.split();
        let writer = Arc::new(ChannelWriter::new(write_half));
        *self.shell.lock().await = Some(writer.clone());

        let (stdout, stderr) = spawn_output_demux(read_half);

        Ok(ShellStreams {
            stdin: Box::new(writer),
            stdout,
            stderr,
        })
    }

    async fn resize(&self, size: PtySize) -> Result<(), GatewayError> {
        let writer = self
            .shell
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Protocol("no shell session".to_string()))?;
        writer.resize(size.rows, size.cols).await
    }

    async fn keepalive(&self) -> Result<(), GatewayError> {
        self.handle
            .send_keepalive(true)
            .await
            .map_err(|e| GatewayError::Stream(format!("Keepalive failed: {}", e)))
    }

    async fn close(&self) {
        if let Some(writer) = self.shell.lock().await.take() {
            let _ = writer.close().await;
        }
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

/// Dialer producing [`RemoteSessionClient`]s.
pub struct SshDialer {
    settings: DialSettings,
}

impl SshDialer {
    pub fn new(settings: DialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteDialer for SshDialer {
    async fn dial(
        &self,
        host: &RemoteHostRef,
        timeout: Duration,
    ) -> Result<DialOutcome, GatewayError> {
        let (client, _retries) =
            RemoteSessionClient::connect_with_retry(host, timeout, self.settings).await?;
        let observed_fingerprint = client.fingerprint().map(str::to_string);
        Ok(DialOutcome {
            session: Arc::new(client),
            observed_fingerprint,
        })
    }
}
