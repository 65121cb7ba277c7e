//! Live capture feed of a frontend peer.
//!
//! The feed drains its capture process through the same demuxing worker
//! as a bridged task and queues each frame on the peer's socket writer.

use crate::bridge::pump_frames;
use crate::peers::{Outbound, PeerSender};
use crate::stream_process::StreamProcessManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running feed worker.
pub struct CaptureFeed {
    stream_id: String,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl CaptureFeed {
    /// Start delivering frames of stream `stream_id` to `peer`.
    ///
    /// The worker ends when the capture output ends, the peer's writer is
    /// gone, or the feed is stopped. The capture process stays with its
    /// owner in every case.
    pub fn spawn(
        stream_id: &str,
        streams: Arc<StreamProcessManager>,
        peer: PeerSender,
        queue_size: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (frames_tx, mut frames_rx) = mpsc::channel(queue_size);

        let worker = tokio::spawn({
            let stream_id = stream_id.to_string();
            let cancel = cancel.clone();
            async move {
                let deliver = async {
                    let mut delivered = 0u64;
                    while let Some(frame) = frames_rx.recv().await {
                        if peer.send(Outbound::Frame(frame)).is_err() {
                            debug!(stream_id = %stream_id, "Feed peer is gone");
                            cancel.cancel();
                            break;
                        }
                        delivered += 1;
                    }
                    delivered
                };

                let ((), delivered) = tokio::join!(
                    pump_frames(stream_id.clone(), streams, frames_tx, cancel.clone()),
                    deliver
                );
                info!(stream_id = %stream_id, frames = delivered, "Video feed ended");
            }
        });

        Self {
            stream_id: stream_id.to_string(),
            cancel,
            worker,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cancel the worker and wait for it to end.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.worker.await {
            warn!(stream_id = %self.stream_id, error = %e, "Feed worker panicked");
        }
    }
}
