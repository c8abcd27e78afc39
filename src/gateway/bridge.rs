//! Session bridge: one browser WebSocket driving one remote PTY shell.
//!
//! # State machine
//!
//! 1. **Resolving**: fetch the host reference and credentials for the
//!    subject. Failure sends an error frame and closes.
//! 2. **Connecting**: dial the remote host. Failure marks the connection log
//!    row `failed`, sends an error frame and closes.
//! 3. **SessionInit**: open a PTY shell. Same failure path as Connecting.
//! 4. **ShellActive**: a `connected` frame is sent and four tasks run until
//!    the first of them finishes (stderr closing on its own does not count):
//!    - stdout pump (remote to browser, optional recording tap)
//!    - stderr pump (remote to browser)
//!    - stdin pump (browser to remote, structured control messages)
//!    - ping loop (transport keep-alive and remote liveness probe)
//! 5. **Closing**: release the remote session, join the pumps within a grace
//!    period, finalize the recording and mark the log row `disconnected`.
//!
//! Ticket validation happens before the WebSocket upgrade, in the route.
//!
//! All writes to the browser go through one [`OutboundWriter`]. Each task
//! runs behind its own panic boundary; a panic is logged and counts as the
//! task finishing.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use poem::web::websocket::Message;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{RemoteDialer, RemoteSession};
use super::config::{BridgeSettings, TERM_TYPE};
use super::error::GatewayError;
use super::hub::panic_message;
use super::recorder::{Recorder, recording_meta};
use super::shell::{ShellInput, ShellStreams};
use super::storage::{ConnectionLogStore, CredentialStore, RecordingStore};
use super::types::{ConnectionRecord, PtySize, RemoteHostRef, ServerFrame, Subject};

/// Parameters of one session, taken from the upgrade request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub subject: Subject,
    pub host_id: u64,
    pub pty: PtySize,
    pub record: bool,
}

// ---------------------------------------------------------------------------
// Browser message decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResizeData {
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    cols: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    cols: Option<u32>,
}

/// What a browser text message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientInput {
    Keys(Vec<u8>),
    Resize(PtySize),
    Ignored,
}

/// Decode a text message. Anything that is not a `{type, ...}` object is
/// keystrokes.
pub(crate) fn decode_client_text(text: &str) -> ClientInput {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        return ClientInput::Keys(text.as_bytes().to_vec());
    };

    match frame.kind.as_str() {
        "input" => match frame.data {
            Some(serde_json::Value::String(data)) => ClientInput::Keys(data.into_bytes()),
            _ => ClientInput::Ignored,
        },
        "resize" => {
            // Dimensions may sit at the top level or inside `data`
            let nested = frame
                .data
                .and_then(|d| serde_json::from_value::<ResizeData>(d).ok());
            let rows = frame.rows.or(nested.as_ref().and_then(|d| d.rows));
            let cols = frame.cols.or(nested.as_ref().and_then(|d| d.cols));
            match (rows, cols) {
                (Some(rows), Some(cols)) if rows > 0 && cols > 0 => {
                    ClientInput::Resize(PtySize { rows, cols })
                }
                _ => ClientInput::Ignored,
            }
        }
        _ => ClientInput::Ignored,
    }
}

// ---------------------------------------------------------------------------
// Output text framing
// ---------------------------------------------------------------------------

/// Turns raw output chunks into text, carrying an incomplete trailing UTF-8
/// sequence over to the next chunk.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Whatever is still pending, lossily decoded.
    pub(crate) fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

// ---------------------------------------------------------------------------
// Shared task plumbing
// ---------------------------------------------------------------------------

/// Serializes every write to the browser transport.
pub(crate) struct OutboundWriter<S> {
    sink: Arc<Mutex<S>>,
}

impl<S> Clone for OutboundWriter<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<S> OutboundWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    <S as Sink<Message>>::Error: Display,
{
    fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    async fn send(&self, message: Message) -> Result<(), GatewayError> {
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| GatewayError::Stream(format!("Failed to write to browser: {}", e)))
    }

    async fn send_frame(&self, frame: &ServerFrame) -> Result<(), GatewayError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| GatewayError::Protocol(format!("Failed to encode frame: {}", e)))?;
        self.send(Message::Text(text)).await
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Completion signal fired by whichever task finishes first.
#[derive(Clone)]
struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn fire(&self, source: &str) {
        let first = self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
        if first {
            debug!("{} finished first, closing session", source);
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolve once the completion signal has fired.
async fn wait_done(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

/// Spawn a task behind a panic boundary. Whatever way it ends, it fires
/// `done`.
fn spawn_isolated<T, F>(name: &'static str, done: DoneSignal, task: F) -> JoinHandle<Option<T>>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(task).catch_unwind().await;
        done.fire(name);
        match outcome {
            Ok(value) => Some(value),
            Err(panic) => {
                error!("{} task panicked: {}", name, panic_message(&*panic));
                None
            }
        }
    })
}

/// Join a task, aborting it if it does not finish within `grace`.
async fn join_within<T>(mut handle: JoinHandle<Option<T>>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            debug!("Session task ended abnormally: {}", e);
            None
        }
        Err(_) => {
            handle.abort();
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn stdout_pump<S>(
    mut stdout: mpsc::Receiver<Vec<u8>>,
    writer: OutboundWriter<S>,
    mut recorder: Option<Recorder>,
    mut done: watch::Receiver<bool>,
) -> Option<Recorder>
where
    S: Sink<Message> + Unpin + Send,
    <S as Sink<Message>>::Error: Display,
{
    let mut carry = Utf8Carry::default();

    loop {
        // Queued output is drained before the completion signal is honoured
        let chunk = tokio::select! {
            biased;
            chunk = stdout.recv() => chunk,
            _ = wait_done(&mut done) => break,
        };

        let text = match chunk {
            Some(bytes) => carry.push(&bytes),
            None => {
                let rest = carry.finish();
                if !rest.is_empty() {
                    let _ = writer.send(Message::Text(rest)).await;
                }
                debug!("Remote stdout closed");
                break;
            }
        };
        if text.is_empty() {
            continue;
        }

        if let Some(rec) = recorder.as_mut() {
            let offset = rec.offset();
            if let Err(e) = rec.record(&text, offset).await {
                warn!("Recording disabled after write failure: {}", e);
                recorder = None;
            }
        }

        if let Err(e) = writer.send(Message::Text(text)).await {
            debug!("{}", e);
            break;
        }
    }

    recorder
}

async fn stderr_pump<S>(
    mut stderr: mpsc::Receiver<Vec<u8>>,
    writer: OutboundWriter<S>,
    mut done: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin + Send,
    <S as Sink<Message>>::Error: Display,
{
    let mut carry = Utf8Carry::default();

    loop {
        let chunk = tokio::select! {
            biased;
            chunk = stderr.recv() => chunk,
            _ = wait_done(&mut done) => break,
        };
        let Some(bytes) = chunk else {
            // Stderr closing is not the end of the session; stdout EOF is
            wait_done(&mut done).await;
            break;
        };
        let text = carry.push(&bytes);
        if text.is_empty() {
            continue;
        }
        if let Err(e) = writer.send(Message::Text(text)).await {
            debug!("{}", e);
            break;
        }
    }
}

enum Inbound {
    Message(Message),
    Closed(String),
    Idle,
}

async fn next_inbound<R, E>(stream: &mut R, idle_timeout: Option<Duration>) -> Inbound
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => stream.next().await,
    };

    match next {
        Some(Ok(message)) => Inbound::Message(message),
        Some(Err(e)) => Inbound::Closed(format!("read error: {}", e)),
        None => Inbound::Closed("browser closed the connection".to_string()),
    }
}

async fn stdin_pump<R, E>(
    mut browser: R,
    stdin: Box<dyn ShellInput>,
    session: Arc<dyn RemoteSession>,
    idle_timeout: Option<Duration>,
    mut done: watch::Receiver<bool>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    loop {
        // Any inbound message, control frames included, restarts the deadline
        let event = tokio::select! {
            _ = wait_done(&mut done) => break,
            event = next_inbound(&mut browser, idle_timeout) => event,
        };

        let keys = match event {
            Inbound::Message(Message::Text(text)) => match decode_client_text(&text) {
                ClientInput::Keys(keys) => keys,
                ClientInput::Resize(size) => {
                    if let Err(e) = session.resize(size).await {
                        warn!("Resize to {}x{} failed: {}", size.cols, size.rows, e);
                    }
                    continue;
                }
                ClientInput::Ignored => continue,
            },
            Inbound::Message(Message::Binary(bytes)) => bytes,
            Inbound::Message(Message::Close(_)) => {
                debug!("Browser sent close frame");
                break;
            }
            Inbound::Message(_) => continue,
            Inbound::Closed(reason) => {
                debug!("Inbound stream ended: {}", reason);
                break;
            }
            Inbound::Idle => {
                info!("Session idle timeout reached");
                break;
            }
        };

        if let Err(e) = stdin.write(&keys).await {
            debug!("{}", e);
            break;
        }
    }
}

async fn ping_loop<S>(
    writer: OutboundWriter<S>,
    session: Arc<dyn RemoteSession>,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin + Send,
    <S as Sink<Message>>::Error: Display,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = wait_done(&mut done) => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = writer.send(Message::Ping(Vec::new())).await {
            debug!("Ping failed: {}", e);
            break;
        }
        if let Err(e) = session.keepalive().await {
            warn!("Remote keepalive failed: {}", e);
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Orchestrates browser to remote sessions.
pub struct SessionBridge {
    dialer: Arc<dyn RemoteDialer>,
    credentials: Arc<dyn CredentialStore>,
    connection_log: Arc<dyn ConnectionLogStore>,
    recordings: Arc<dyn RecordingStore>,
    settings: BridgeSettings,
}

impl SessionBridge {
    pub fn new(
        dialer: Arc<dyn RemoteDialer>,
        credentials: Arc<dyn CredentialStore>,
        connection_log: Arc<dyn ConnectionLogStore>,
        recordings: Arc<dyn RecordingStore>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            dialer,
            credentials,
            connection_log,
            recordings,
            settings,
        }
    }

    /// Drive one session over an already upgraded browser transport.
    ///
    /// Returns the final connection record, or the error that aborted the
    /// session before the shell became active.
    pub async fn run<S, R, E>(
        &self,
        request: SessionRequest,
        sink: S,
        inbound: R,
    ) -> Result<ConnectionRecord, GatewayError>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        <S as Sink<Message>>::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let writer = OutboundWriter::new(sink);

        // Resolving
        debug!(session = %session_id, host_id = request.host_id, "Resolving host");
        let host = match self.credentials.resolve(&request.subject, request.host_id) {
            Ok(host) => host,
            Err(e) => {
                warn!(session = %session_id, "Host lookup failed: {}", e);
                let _ = writer.send_frame(&ServerFrame::error(e.to_string())).await;
                writer.close().await;
                return Err(e);
            }
        };

        let mut record = ConnectionRecord::connecting(&request.subject, &host, Utc::now());
        let log_id = match self.connection_log.create(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(session = %session_id, "Failed to create connection log: {}", e);
                None
            }
        };

        // Connecting
        debug!(
            session = %session_id,
            "Connecting to {}@{}",
            host.username,
            host.endpoint()
        );
        let outcome = match self.dialer.dial(&host, self.settings.connect_timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(self.abort(&writer, &mut record, log_id, e, "SSH connection failed").await);
            }
        };
        let session = outcome.session;

        let first_use = host
            .fingerprint
            .as_deref()
            .is_none_or(|fp| fp.trim().is_empty());
        if first_use {
            if let Some(fingerprint) = outcome.observed_fingerprint.as_deref() {
                info!(
                    session = %session_id,
                    host_id = host.host_id,
                    "Trusting host key on first use: {}",
                    fingerprint
                );
                if let Err(e) = self.credentials.store_fingerprint(host.host_id, fingerprint) {
                    warn!(session = %session_id, "Failed to store fingerprint: {}", e);
                }
            }
        }

        // SessionInit
        let streams = match session.open_shell_session(TERM_TYPE, request.pty).await {
            Ok(streams) => streams,
            Err(e) => {
                session.close().await;
                return Err(self.abort(&writer, &mut record, log_id, e, "Failed to start shell").await);
            }
        };

        // ShellActive
        record.mark_success();
        self.update_log(log_id, &record);
        if let Err(e) = writer.send_frame(&ServerFrame::connected()).await {
            debug!(session = %session_id, "{}", e);
        }
        info!(
            session = %session_id,
            user_id = request.subject.user_id,
            "SSH session established to {}@{}",
            host.username,
            host.endpoint()
        );

        let recording = if request.record {
            self.open_recording(&request.subject, &host).await
        } else {
            None
        };
        let (recorder, recording_id) = match recording {
            Some((recorder, id)) => (Some(recorder), id),
            None => (None, None),
        };

        let ShellStreams {
            stdin,
            stdout,
            stderr,
        } = streams;

        let done = DoneSignal::new();
        let mut done_rx = done.subscribe();

        let stdout_task = spawn_isolated(
            "stdout",
            done.clone(),
            stdout_pump(stdout, writer.clone(), recorder, done.subscribe()),
        );
        let stderr_task = spawn_isolated(
            "stderr",
            done.clone(),
            stderr_pump(stderr, writer.clone(), done.subscribe()),
        );
        let stdin_task = spawn_isolated(
            "stdin",
            done.clone(),
            stdin_pump(
                inbound,
                stdin,
                session.clone(),
                self.settings.idle_timeout,
                done.subscribe(),
            ),
        );
        let ping_task = spawn_isolated(
            "ping",
            done.clone(),
            ping_loop(
                writer.clone(),
                session.clone(),
                self.settings.ping_interval,
                done.subscribe(),
            ),
        );

        wait_done(&mut done_rx).await;

        // Closing
        debug!(session = %session_id, "Closing session");
        session.close().await;

        let grace = self.settings.drain_grace;
        let recorder = join_within(stdout_task, grace).await.flatten();
        join_within(stderr_task, grace).await;
        join_within(stdin_task, grace).await;
        join_within(ping_task, grace).await;

        if let Some(recorder) = recorder {
            self.finish_recording(recorder, recording_id).await;
        }

        writer.close().await;

        record.mark_disconnected(Utc::now());
        self.update_log(log_id, &record);
        info!(
            session = %session_id,
            duration_secs = record.duration_secs,
            "SSH session closed for user {}, host {}",
            request.subject.user_id,
            host.address
        );

        Ok(record)
    }

    /// Failure path of Connecting and SessionInit.
    async fn abort<S>(
        &self,
        writer: &OutboundWriter<S>,
        record: &mut ConnectionRecord,
        log_id: Option<u64>,
        error: GatewayError,
        context: &str,
    ) -> GatewayError
    where
        S: Sink<Message> + Unpin + Send,
        <S as Sink<Message>>::Error: Display,
    {
        warn!("{}: {}", context, error);
        record.mark_failed(&error);
        self.update_log(log_id, record);
        let _ = writer
            .send_frame(&ServerFrame::error(format!("{}: {}", context, error)))
            .await;
        writer.close().await;
        error
    }

    fn update_log(&self, log_id: Option<u64>, record: &ConnectionRecord) {
        if let Some(id) = log_id {
            if let Err(e) = self.connection_log.update(id, record) {
                warn!("Failed to update connection log {}: {}", id, e);
            }
        }
    }

    async fn open_recording(
        &self,
        subject: &Subject,
        host: &RemoteHostRef,
    ) -> Option<(Recorder, Option<u64>)> {
        let started_at = Utc::now();
        let recorder =
            match Recorder::create(&self.settings.recording_dir, subject, host, started_at).await {
                Ok(recorder) => recorder,
                Err(e) => {
                    warn!("Recording disabled for this session: {}", e);
                    return None;
                }
            };

        let meta = recording_meta(subject, host, &recorder, started_at);
        let id = match self.recordings.create(&meta) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to store recording metadata: {}", e);
                None
            }
        };
        Some((recorder, id))
    }

    async fn finish_recording(&self, recorder: Recorder, recording_id: Option<u64>) {
        let path = recorder.path().display().to_string();
        let duration = match recorder.finalize().await {
            Ok(secs) => secs as u64,
            Err(e) => {
                warn!("Failed to finalize recording {}: {}", path, e);
                return;
            }
        };
        debug!("Recording {} closed after {}s", path, duration);

        if let Some(id) = recording_id {
            if let Err(e) = self.recordings.finalize(id, Utc::now(), duration) {
                warn!("Failed to update recording {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::DialOutcome;
    use crate::gateway::storage::{
        MemoryConnectionLog, MemoryCredentialStore, MemoryRecordingStore, SshHostEntry,
    };
    use crate::gateway::types::ConnectionStatus;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // -- fakes --------------------------------------------------------------

    struct SharedInput {
        written: Arc<StdMutex<Vec<u8>>>,
        panic_on_write: bool,
    }

    #[async_trait]
    impl ShellInput for SharedInput {
        async fn write(&self, data: &[u8]) -> Result<(), GatewayError> {
            if self.panic_on_write {
                panic!("stdin exploded");
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    struct FakeSession {
        streams: StdMutex<Option<ShellStreams>>,
        fail_shell: bool,
        resizes: StdMutex<Vec<PtySize>>,
        keepalives: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn open_shell_session(
            &self,
            term: &str,
            _size: PtySize,
        ) -> Result<ShellStreams, GatewayError> {
            assert_eq!(term, TERM_TYPE);
            if self.fail_shell {
                return Err(GatewayError::Protocol("PTY refused".into()));
            }
            self.streams
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| GatewayError::Protocol("shell already open".into()))
        }

        async fn resize(&self, size: PtySize) -> Result<(), GatewayError> {
            self.resizes.lock().unwrap().push(size);
            Ok(())
        }

        async fn keepalive(&self) -> Result<(), GatewayError> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeDialer {
        session: Option<Arc<FakeSession>>,
        observed_fingerprint: Option<String>,
    }

    #[async_trait]
    impl RemoteDialer for FakeDialer {
        async fn dial(
            &self,
            _host: &RemoteHostRef,
            _timeout: Duration,
        ) -> Result<DialOutcome, GatewayError> {
            match &self.session {
                Some(session) => Ok(DialOutcome {
                    session: session.clone(),
                    observed_fingerprint: self.observed_fingerprint.clone(),
                }),
                None => Err(GatewayError::Connect("Connection refused".into())),
            }
        }
    }

    // -- harness ------------------------------------------------------------

    struct Harness {
        bridge: Arc<SessionBridge>,
        session: Option<Arc<FakeSession>>,
        credentials: Arc<MemoryCredentialStore>,
        log: Arc<MemoryConnectionLog>,
        recordings: Arc<MemoryRecordingStore>,
        stdout_tx: Option<mpsc::Sender<Vec<u8>>>,
        stderr_tx: Option<mpsc::Sender<Vec<u8>>>,
        written: Arc<StdMutex<Vec<u8>>>,
        recording_dir: PathBuf,
    }

    struct Options {
        dial_ok: bool,
        fail_shell: bool,
        panic_on_write: bool,
        idle_timeout: Option<Duration>,
        ping_interval: Duration,
        fingerprint: Option<String>,
        stored_fingerprint: Option<String>,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                dial_ok: true,
                fail_shell: false,
                panic_on_write: false,
                idle_timeout: None,
                ping_interval: Duration::from_secs(60),
                fingerprint: None,
                stored_fingerprint: None,
            }
        }
    }

    fn harness(options: Options) -> Harness {
        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let written = Arc::new(StdMutex::new(Vec::new()));
        let streams = ShellStreams {
            stdin: Box::new(SharedInput {
                written: written.clone(),
                panic_on_write: options.panic_on_write,
            }),
            stdout: stdout_rx,
            stderr: stderr_rx,
        };
        let session = Arc::new(FakeSession {
            streams: StdMutex::new(Some(streams)),
            fail_shell: options.fail_shell,
            resizes: StdMutex::new(Vec::new()),
            keepalives: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let session = options.dial_ok.then_some(session);

        let credentials = Arc::new(MemoryCredentialStore::from_entries([SshHostEntry {
            id: 1,
            owner_id: Some(7),
            address: "10.0.0.1".into(),
            port: 22,
            username: "root".into(),
            password: Some("pw".into()),
            private_key: None,
            fingerprint: options.stored_fingerprint.clone(),
        }]));
        let log = Arc::new(MemoryConnectionLog::new());
        let recordings = Arc::new(MemoryRecordingStore::new());
        let recording_dir =
            std::env::temp_dir().join(format!("gateway-bridge-{}", Uuid::new_v4()));

        let settings = BridgeSettings {
            connect_timeout: Duration::from_secs(1),
            idle_timeout: options.idle_timeout,
            ping_interval: options.ping_interval,
            recording_dir: recording_dir.clone(),
            drain_grace: Duration::from_millis(200),
        };

        let bridge = Arc::new(SessionBridge::new(
            Arc::new(FakeDialer {
                session: session.clone(),
                observed_fingerprint: options.fingerprint,
            }),
            credentials.clone(),
            log.clone(),
            recordings.clone(),
            settings,
        ));

        Harness {
            bridge,
            session,
            credentials,
            log,
            recordings,
            stdout_tx: Some(stdout_tx),
            stderr_tx: Some(stderr_tx),
            written,
            recording_dir,
        }
    }

    fn request(host_id: u64, record: bool) -> SessionRequest {
        SessionRequest {
            subject: Subject {
                user_id: 7,
                username: "alice".into(),
                role: "user".into(),
            },
            host_id,
            pty: PtySize::default(),
            record,
        }
    }

    type Browser = (
        fmpsc::UnboundedSender<Result<Message, std::io::Error>>,
        fmpsc::UnboundedReceiver<Message>,
        JoinHandle<Result<ConnectionRecord, GatewayError>>,
    );

    fn start(h: &Harness, req: SessionRequest) -> Browser {
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, std::io::Error>>();
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let bridge = h.bridge.clone();
        let task = tokio::spawn(async move { bridge.run(req, out_tx, in_rx).await });
        (in_tx, out_rx, task)
    }

    async fn next_out(out: &mut fmpsc::UnboundedReceiver<Message>) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(2), out.next())
            .await
            .ok()
            .flatten()
    }

    async fn next_text(out: &mut fmpsc::UnboundedReceiver<Message>) -> String {
        loop {
            match next_out(out).await {
                Some(Message::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("browser transport closed"),
            }
        }
    }

    async fn finish(
        task: JoinHandle<Result<ConnectionRecord, GatewayError>>,
    ) -> Result<ConnectionRecord, GatewayError> {
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session did not finish")
            .unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // -- tests --------------------------------------------------------------

    mod decoding {
        use super::*;

        #[test]
        fn test_plain_text_is_keys() {
            assert_eq!(decode_client_text("ls -la\r"), ClientInput::Keys(b"ls -la\r".to_vec()));
        }

        #[test]
        fn test_json_scalar_is_keys() {
            assert_eq!(decode_client_text("1"), ClientInput::Keys(b"1".to_vec()));
            assert_eq!(decode_client_text("{}"), ClientInput::Keys(b"{}".to_vec()));
        }

        #[test]
        fn test_input_frame() {
            assert_eq!(
                decode_client_text(r#"{"type":"input","data":"pwd\n"}"#),
                ClientInput::Keys(b"pwd\n".to_vec())
            );
        }

        #[test]
        fn test_resize_nested_and_flat() {
            let size = PtySize { rows: 40, cols: 120 };
            assert_eq!(
                decode_client_text(r#"{"type":"resize","data":{"rows":40,"cols":120}}"#),
                ClientInput::Resize(size)
            );
            assert_eq!(
                decode_client_text(r#"{"type":"resize","rows":40,"cols":120}"#),
                ClientInput::Resize(size)
            );
        }

        #[test]
        fn test_bad_resize_ignored() {
            assert_eq!(
                decode_client_text(r#"{"type":"resize","rows":0,"cols":120}"#),
                ClientInput::Ignored
            );
            assert_eq!(
                decode_client_text(r#"{"type":"shrug"}"#),
                ClientInput::Ignored
            );
        }
    }

    mod utf8 {
        use super::*;

        #[test]
        fn test_split_multibyte_is_carried() {
            let mut carry = Utf8Carry::default();
            let bytes = "héllo".as_bytes();
            assert_eq!(carry.push(&bytes[..2]), "h");
            assert_eq!(carry.push(&bytes[2..]), "éllo");
        }

        #[test]
        fn test_invalid_bytes_replaced() {
            let mut carry = Utf8Carry::default();
            assert_eq!(carry.push(b"a\xffb"), "a\u{FFFD}b");
        }

        #[test]
        fn test_finish_flushes_pending() {
            let mut carry = Utf8Carry::default();
            assert_eq!(carry.push(&[0xe2, 0x82]), "");
            assert_eq!(carry.finish(), "\u{FFFD}");
            assert_eq!(carry.finish(), "");
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_full_session() {
            let mut h = harness(Options::default());
            let (in_tx, mut out, task) = start(&h, request(1, false));

            let connected: serde_json::Value =
                serde_json::from_str(&next_text(&mut out).await).unwrap();
            assert_eq!(connected["type"], "connected");

            let stdout = h.stdout_tx.clone().unwrap();
            stdout.send(b"hello".to_vec()).await.unwrap();
            assert_eq!(next_text(&mut out).await, "hello");

            let stderr = h.stderr_tx.clone().unwrap();
            stderr.send(b"oops".to_vec()).await.unwrap();
            assert_eq!(next_text(&mut out).await, "oops");

            in_tx.unbounded_send(Ok(Message::Text("ls\n".into()))).unwrap();
            in_tx
                .unbounded_send(Ok(Message::Text(
                    r#"{"type":"resize","data":{"rows":40,"cols":120}}"#.into(),
                )))
                .unwrap();
            in_tx
                .unbounded_send(Ok(Message::Text(r#"{"type":"input","data":"pwd\n"}"#.into())))
                .unwrap();
            in_tx.unbounded_send(Ok(Message::Binary(b"\x03".to_vec()))).unwrap();

            let written = h.written.clone();
            eventually(|| written.lock().unwrap().as_slice() == b"ls\npwd\n\x03").await;
            let session = h.session.clone().unwrap();
            assert_eq!(
                session.resizes.lock().unwrap().as_slice(),
                &[PtySize { rows: 40, cols: 120 }]
            );

            drop(in_tx);
            let record = finish(task).await.unwrap();
            assert_eq!(record.status, ConnectionStatus::Disconnected);
            assert!(record.disconnected_at.is_some());
            assert!(session.closed.load(Ordering::SeqCst));

            let rows = h.log.rows();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].1.status, ConnectionStatus::Disconnected);

            h.stdout_tx.take();
            h.stderr_tx.take();
        }

        #[tokio::test]
        async fn test_remote_eof_ends_session_while_browser_is_silent() {
            let mut h = harness(Options::default());
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;

            // Browser keeps its side open; the remote shell exits
            h.stdout_tx.take();
            let record = finish(task).await.unwrap();
            assert_eq!(record.status, ConnectionStatus::Disconnected);
            drop(in_tx);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_remote_exit_flushes_queued_output() {
            let expected: String = (0..8).map(|i| format!("line{}\n", i)).collect();

            for _ in 0..50 {
                let mut h = harness(Options::default());
                let (_in_tx, mut out, task) = start(&h, request(1, false));
                let _connected = next_text(&mut out).await;

                let stdout = h.stdout_tx.take().unwrap();
                for i in 0..8 {
                    stdout.send(format!("line{}\n", i).into_bytes()).await.unwrap();
                }
                // The shell exits: both output queues close together
                drop(stdout);
                h.stderr_tx.take();

                let record = finish(task).await.unwrap();
                assert_eq!(record.status, ConnectionStatus::Disconnected);

                let mut received = String::new();
                while let Some(message) = next_out(&mut out).await {
                    if let Message::Text(text) = message {
                        received.push_str(&text);
                    }
                }
                assert_eq!(received, expected);
            }
        }

        #[tokio::test]
        async fn test_stderr_close_keeps_session_open() {
            let mut h = harness(Options::default());
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;

            h.stderr_tx.take();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!task.is_finished());

            let stdout = h.stdout_tx.clone().unwrap();
            stdout.send(b"still here".to_vec()).await.unwrap();
            assert_eq!(next_text(&mut out).await, "still here");

            drop(in_tx);
            finish(task).await.unwrap();
        }

        #[tokio::test]
        async fn test_idle_timeout_closes_session() {
            let h = harness(Options {
                idle_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            });
            let (_in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;

            let record = finish(task).await.unwrap();
            assert_eq!(record.status, ConnectionStatus::Disconnected);
        }

        #[tokio::test]
        async fn test_ping_loop_probes_both_sides() {
            let h = harness(Options {
                ping_interval: Duration::from_millis(30),
                ..Default::default()
            });
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;

            let mut saw_ping = false;
            while let Some(message) = next_out(&mut out).await {
                if matches!(message, Message::Ping(_)) {
                    saw_ping = true;
                    break;
                }
            }
            assert!(saw_ping);
            let session = h.session.clone().unwrap();
            eventually(|| session.keepalives.load(Ordering::SeqCst) > 0).await;

            drop(in_tx);
            finish(task).await.unwrap();
        }

        #[tokio::test]
        async fn test_panicking_task_tears_session_down() {
            let h = harness(Options {
                panic_on_write: true,
                ..Default::default()
            });
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;

            in_tx.unbounded_send(Ok(Message::Text("boom".into()))).unwrap();
            let record = finish(task).await.unwrap();
            assert_eq!(record.status, ConnectionStatus::Disconnected);
            assert!(h.session.clone().unwrap().closed.load(Ordering::SeqCst));
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_failed_dial_logs_one_failed_row() {
            let h = harness(Options {
                dial_ok: false,
                ..Default::default()
            });
            let (_in_tx, mut out, task) = start(&h, request(1, false));

            let mut frames = Vec::new();
            while let Some(message) = next_out(&mut out).await {
                if let Message::Text(text) = message {
                    frames.push(serde_json::from_str::<serde_json::Value>(&text).unwrap());
                }
            }
            let result = finish(task).await;

            assert!(matches!(result, Err(GatewayError::Connect(_))));
            assert!(frames.iter().all(|f| f["type"] != "connected"));
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "error");

            let rows = h.log.rows();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].1.status, ConnectionStatus::Failed);
            assert!(rows[0].1.error_message.as_deref().unwrap().contains("refused"));
        }

        #[tokio::test]
        async fn test_failed_shell_mirrors_dial_failure() {
            let h = harness(Options {
                fail_shell: true,
                ..Default::default()
            });
            let (_in_tx, mut out, task) = start(&h, request(1, false));
            let frame: serde_json::Value =
                serde_json::from_str(&next_text(&mut out).await).unwrap();
            let result = finish(task).await;

            assert_eq!(frame["type"], "error");
            assert!(matches!(result, Err(GatewayError::Protocol(_))));
            assert_eq!(h.log.rows()[0].1.status, ConnectionStatus::Failed);
            assert!(h.session.clone().unwrap().closed.load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn test_unknown_host_sends_error_without_log_row() {
            let h = harness(Options::default());
            let (_in_tx, mut out, task) = start(&h, request(99, false));
            let frame: serde_json::Value =
                serde_json::from_str(&next_text(&mut out).await).unwrap();
            let result = finish(task).await;

            assert_eq!(frame["type"], "error");
            assert!(matches!(result, Err(GatewayError::NotFound(_))));
            assert!(h.log.rows().is_empty());
        }
    }

    mod extras {
        use super::*;

        #[tokio::test]
        async fn test_first_use_fingerprint_is_stored() {
            let h = harness(Options {
                fingerprint: Some("SHA256:abc".into()),
                ..Default::default()
            });
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;
            assert_eq!(h.credentials.fingerprint(1).as_deref(), Some("SHA256:abc"));
            drop(in_tx);
            finish(task).await.unwrap();
        }

        #[tokio::test]
        async fn test_blank_stored_fingerprint_counts_as_first_use() {
            let h = harness(Options {
                fingerprint: Some("SHA256:abc".into()),
                stored_fingerprint: Some("  ".into()),
                ..Default::default()
            });
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;
            assert_eq!(h.credentials.fingerprint(1).as_deref(), Some("SHA256:abc"));
            drop(in_tx);
            finish(task).await.unwrap();
        }

        #[tokio::test]
        async fn test_known_fingerprint_is_not_overwritten() {
            let h = harness(Options {
                fingerprint: Some("SHA256:abc".into()),
                stored_fingerprint: Some("SHA256:pinned".into()),
                ..Default::default()
            });
            let (in_tx, mut out, task) = start(&h, request(1, false));
            let _connected = next_text(&mut out).await;
            assert_eq!(h.credentials.fingerprint(1).as_deref(), Some("SHA256:pinned"));
            drop(in_tx);
            finish(task).await.unwrap();
        }

        #[tokio::test]
        async fn test_recording_captures_output() {
            let h = harness(Options::default());
            let (in_tx, mut out, task) = start(&h, request(1, true));
            let _connected = next_text(&mut out).await;

            let stdout = h.stdout_tx.clone().unwrap();
            stdout.send(b"recorded".to_vec()).await.unwrap();
            assert_eq!(next_text(&mut out).await, "recorded");

            drop(in_tx);
            finish(task).await.unwrap();

            let rows = h.recordings.rows();
            assert_eq!(rows.len(), 1);
            assert!(rows[0].ended_at.is_some());
            let content = tokio::fs::read_to_string(&rows[0].file_path).await.unwrap();
            let line: serde_json::Value =
                serde_json::from_str(content.lines().next().unwrap()).unwrap();
            assert_eq!(line[1], "o");
            assert_eq!(line[2], "recorded");

            let _ = tokio::fs::remove_dir_all(&h.recording_dir).await;
        }
    }
}
