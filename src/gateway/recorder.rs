//! Session recorder.
//!
//! Appends one JSON line per output chunk, `[offset_seconds, "o", chunk]`,
//! to a file opened when the session starts. Offsets are measured from the
//! moment the recorder was created and never decrease, because every call
//! goes through the stdout pump, which is the recorder's only writer.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::error::GatewayError;
use super::types::{RecordingMeta, RemoteHostRef, Subject};

/// Build the file name of a recording: `<user>-<host>-<unix-ts>.cast`.
pub fn recording_file_name(user_id: u64, host_id: u64, started_at: DateTime<Utc>) -> String {
    format!("{}-{}-{}.cast", user_id, host_id, started_at.timestamp())
}

/// Append-only recording of one session's output.
pub struct Recorder {
    writer: BufWriter<File>,
    path: PathBuf,
    started: Instant,
    last_offset: f64,
}

impl Recorder {
    /// Create the recording directory if needed and open a new file in it.
    pub async fn create(
        dir: &Path,
        subject: &Subject,
        host: &RemoteHostRef,
        started_at: DateTime<Utc>,
    ) -> Result<Self, GatewayError> {
        fs::create_dir_all(dir).await.map_err(|e| {
            GatewayError::Storage(format!(
                "Failed to create recording directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(recording_file_name(
            subject.user_id,
            host.host_id,
            started_at,
        ));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                GatewayError::Storage(format!(
                    "Failed to open recording {}: {}",
                    path.display(),
                    e
                ))
            })?;

        debug!("Recording session to {}", path.display());

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            started: Instant::now(),
            last_offset: 0.0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seconds elapsed since the recorder was opened.
    pub fn offset(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Append one output chunk at `offset` seconds.
    pub async fn record(&mut self, chunk: &str, offset: f64) -> Result<(), GatewayError> {
        let offset = offset.max(self.last_offset);
        self.last_offset = offset;

        let mut line = serde_json::to_string(&(offset, "o", chunk))
            .map_err(|e| GatewayError::Storage(format!("Failed to encode recording entry: {}", e)))?;
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to write recording: {}", e)))
    }

    /// Flush and close the file, returning the session duration in seconds.
    pub async fn finalize(mut self) -> Result<f64, GatewayError> {
        self.writer
            .flush()
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to flush recording: {}", e)))?;
        Ok(self.offset())
    }
}

/// Metadata row for a recording that has just been opened.
pub(crate) fn recording_meta(
    subject: &Subject,
    host: &RemoteHostRef,
    recorder: &Recorder,
    started_at: DateTime<Utc>,
) -> RecordingMeta {
    RecordingMeta {
        user_id: subject.user_id,
        host_id: host.host_id,
        host: host.address.clone(),
        username: host.username.clone(),
        file_path: recorder.path().display().to_string(),
        started_at,
        ended_at: None,
        duration_secs: 0,
    }
}
