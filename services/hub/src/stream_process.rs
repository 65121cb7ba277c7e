//! Capture subprocess lifecycle management.
//!
//! One capture process per stream id. The process writes a continuous
//! motion-JPEG stream to stdout, which is read back in fixed-size chunks
//! by the capture worker of the owning task.

use crate::config::CaptureConfig;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, warn};

/// Maximum number of bytes returned by a single output read.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Errors that can occur while managing capture processes.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn capture process for stream {id}: {source}")]
    ProcessSpawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture process for stream {0} has no stdout")]
    MissingStdout(String),

    #[error("Failed to read output of stream {id}: {source}")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read side of a capture process. The buffer is reused across reads.
struct StreamOutput {
    stdout: ChildStdout,
    buffer: BytesMut,
}

/// A running capture process.
struct StreamProcess {
    child: Child,
    output: Arc<tokio::sync::Mutex<StreamOutput>>,
    input_device: String,
    started_at: Instant,
}

impl StreamProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the process to exit, escalating to SIGKILL after `grace`.
    async fn terminate(&mut self, id: &str, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(stream_id = %id, status = %status, "Capture process already exited");
            return;
        }

        self.request_exit(id);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(stream_id = %id, status = %status, "Capture process exited");
            }
            Ok(Err(e)) => {
                warn!(stream_id = %id, error = %e, "Failed waiting for capture process, killing");
                self.kill(id).await;
            }
            Err(_) => {
                warn!(
                    stream_id = %id,
                    grace_ms = grace.as_millis(),
                    "Capture process ignored SIGTERM, killing"
                );
                self.kill(id).await;
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self, id: &str) {
        if let Some(pid) = self.child.id() {
            // SAFETY: kill(2) on a pid we own; a stale pid only yields ESRCH.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(stream_id = %id, pid, "SIGTERM delivery failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self, id: &str) {
        if let Err(e) = self.child.start_kill() {
            debug!(stream_id = %id, error = %e, "Kill request failed");
        }
    }

    async fn kill(&mut self, id: &str) {
        if let Err(e) = self.child.kill().await {
            error!(stream_id = %id, error = %e, "Failed to kill capture process");
        }
    }
}

/// Owner of every capture process, keyed by stream id.
pub struct StreamProcessManager {
    config: CaptureConfig,
    processes: Mutex<HashMap<String, StreamProcess>>,
}

impl StreamProcessManager {
    /// Create a manager spawning processes as described by `config`.
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a capture process for `id` reading from `input_device`.
    ///
    /// Fails with [`StreamError::AlreadyRunning`] while a live process is
    /// registered under the same id. A process that already exited is
    /// replaced.
    pub fn start_stream(&self, id: &str, input_device: &str) -> Result<(), StreamError> {
        let mut processes = self.processes.lock();

        if let Some(existing) = processes.get_mut(id) {
            if existing.is_alive() {
                warn!(stream_id = %id, "Stream is already running");
                return Err(StreamError::AlreadyRunning(id.to_string()));
            }
            debug!(stream_id = %id, "Replacing exited capture process");
            processes.remove(id);
        }

        let args = self.config.args_for(input_device);
        debug!(stream_id = %id, program = %self.config.program, args = ?args, "Spawning capture process");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::ProcessSpawn {
                id: id.to_string(),
                source,
            })?;

        // dropping `child` on this path kills it
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::MissingStdout(id.to_string()))?;

        info!(
            stream_id = %id,
            input_device = %input_device,
            pid = ?child.id(),
            "Started capture stream"
        );

        processes.insert(
            id.to_string(),
            StreamProcess {
                child,
                output: Arc::new(tokio::sync::Mutex::new(StreamOutput {
                    stdout,
                    buffer: BytesMut::new(),
                })),
                input_device: input_device.to_string(),
                started_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Stop the process registered under `id`.
    ///
    /// The entry is removed before termination starts, so the id is free
    /// again even if the graceful path fails. Returns `false` for unknown
    /// ids.
    pub async fn stop_stream(&self, id: &str) -> bool {
        let Some(mut process) = self.processes.lock().remove(id) else {
            warn!(stream_id = %id, "Stream does not exist");
            return false;
        };

        process.terminate(id, self.config.stop_timeout()).await;

        info!(
            stream_id = %id,
            input_device = %process.input_device,
            uptime_secs = process.started_at.elapsed().as_secs(),
            "Stopped capture stream"
        );
        true
    }

    /// Read up to [`CHUNK_SIZE`] bytes of raw output.
    ///
    /// Returns an empty chunk once the process has closed its output or
    /// when no stream is registered under `id`.
    pub async fn get_stream_output(&self, id: &str) -> Result<Bytes, StreamError> {
        let output = match self.processes.lock().get(id) {
            Some(process) => process.output.clone(),
            None => {
                debug!(stream_id = %id, "No stream to read from");
                return Ok(Bytes::new());
            }
        };

        let mut output = output.lock().await;
        let StreamOutput { stdout, buffer } = &mut *output;
        // reclaims the allocation once earlier chunks are dropped
        buffer.reserve(CHUNK_SIZE);
        stdout
            .take(CHUNK_SIZE as u64)
            .read_buf(buffer)
            .await
            .map_err(|source| StreamError::Read {
                id: id.to_string(),
                source,
            })?;

        Ok(buffer.split().freeze())
    }

    /// Whether a live process is registered under `id`.
    pub fn is_running(&self, id: &str) -> bool {
        self.processes
            .lock()
            .get_mut(id)
            .map(StreamProcess::is_alive)
            .unwrap_or(false)
    }

    /// OS process id of the stream, if registered and not yet reaped.
    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.lock().get(id).and_then(|p| p.child.id())
    }

    /// Ids of every registered stream.
    pub fn list_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every registered stream.
    pub async fn stop_all(&self) {
        for id in self.list_streams() {
            self.stop_stream(&id).await;
        }
    }
}
