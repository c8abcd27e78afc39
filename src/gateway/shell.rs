//! Interactive PTY shell streams.
//!
//! A shell opened on the remote host is exposed to the bridge as three
//! independent streams:
//!
//! - `stdin`: a [`ShellInput`] writer for keystrokes
//! - `stdout`: channel data, one chunk per SSH data message
//! - `stderr`: extended data of type 1
//!
//! The russh channel is split so writes never wait on the read half. A small
//! demultiplexer task owns the read half and fans messages out into the two
//! output queues; it ends (closing both queues) when the channel reports EOF,
//! close, or disappears.

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::sync::mpsc;
use tracing::debug;

use super::error::GatewayError;

/// Capacity of each output queue, in chunks.
pub const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// Writer half of a remote shell.
#[async_trait]
pub trait ShellInput: Send + Sync {
    /// Send data (text, keystrokes, escape sequences) to the shell.
    async fn write(&self, data: &[u8]) -> Result<(), GatewayError>;
}

/// The three streams of an open shell.
pub struct ShellStreams {
    pub stdin: Box<dyn ShellInput>,
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
}

/// Write handle for sending input to a shell channel.
///
/// Wraps `russh::ChannelWriteHalf` to provide a `Send + Sync` interface
/// for writing data to the PTY channel without holding a lock on the read half.
pub struct ChannelWriter {
    pub(crate) write_half: ChannelWriteHalf<client::Msg>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    /// Tell the remote PTY about a new window size.
    pub async fn resize(&self, rows: u32, cols: u32) -> Result<(), GatewayError> {
        self.write_half
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| GatewayError::Stream(format!("Failed to resize PTY: {}", e)))
    }

    /// Close the channel gracefully.
    pub async fn close(&self) -> Result<(), GatewayError> {
        self.write_half
            .close()
            .await
            .map_err(|e| GatewayError::Stream(format!("Failed to close shell channel: {}", e)))
    }
}

#[async_trait]
impl ShellInput for ChannelWriter {
    async fn write(&self, data: &[u8]) -> Result<(), GatewayError> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| GatewayError::Stream(format!("Failed to write to shell: {}", e)))
    }
}

#[async_trait]
impl<T: ShellInput + ?Sized> ShellInput for std::sync::Arc<T> {
    async fn write(&self, data: &[u8]) -> Result<(), GatewayError> {
        (**self).write(data).await
    }
}

/// Spawn the demultiplexer that owns the channel read half.
///
/// Returns the stdout and stderr receivers. Both close once the channel ends
/// or once both receivers are dropped.
pub(crate) fn spawn_output_demux(
    mut read_half: ChannelReadHalf,
) -> (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);

    tokio::spawn(async move {
        loop {
            match read_half.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    if stdout_tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in SSH protocol
                    if ext == 1 && stderr_tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        debug!("Shell output demultiplexer finished");
    });

    (stdout_rx, stderr_rx)
}
