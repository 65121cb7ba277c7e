//! Bridges a capture stream to a processing device.
//!
//! ```text
//! capture process -> capture worker (demux) -> bounded queue -> device
//!                                                                  |
//!                                   TaskEvent <- bridge task <- responses
//! ```
//!
//! The device stream is opened before anything is spawned, so a device
//! that refuses it leaves nothing to clean up.
//!
//! The capture worker blocks on a full queue, so a slow device throttles
//! capture instead of growing a buffer.

use crate::demux::FrameDemuxer;
use crate::device::{BridgeError, DeviceClient, ResponseStream};
use crate::stream_process::StreamProcessManager;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something that happened on a bridged task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEventKind {
    /// A response message from the device.
    Response(String),
    /// The device or the capture stream ended the bridge.
    Completed,
    /// The bridge aborted on a transport error.
    Failed(String),
}

/// Receiver side of task events, usually a peer connection.
pub type EventSink = mpsc::UnboundedSender<TaskEvent>;

/// Everything needed to bridge one task.
pub struct BridgeParams {
    pub task_id: String,
    pub processing_type: String,
    pub device: Arc<dyn DeviceClient>,
    pub streams: Arc<StreamProcessManager>,
    pub queue_size: usize,
    pub events: Option<EventSink>,
}

/// A device stream the device has accepted, not yet fed with frames.
///
/// Dropping it closes the stream without spawning anything.
pub struct OpenBridge {
    task_id: String,
    device_address: String,
    processing_type: String,
    streams: Arc<StreamProcessManager>,
    events: Option<EventSink>,
    frames: mpsc::Sender<Bytes>,
    responses: ResponseStream,
}

/// Handle to a running bridge.
pub struct StreamBridge {
    task_id: String,
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    bridge: JoinHandle<()>,
}

impl StreamBridge {
    /// Open the outbound device stream.
    ///
    /// The frame queue holds at most `queue_size` frames. Fails if the
    /// device refuses the stream; nothing is running in that case.
    pub async fn open(params: BridgeParams) -> Result<OpenBridge, BridgeError> {
        let BridgeParams {
            task_id,
            processing_type,
            device,
            streams,
            queue_size,
            events,
        } = params;

        let (frames, frame_rx) = mpsc::channel(queue_size);
        let responses = device
            .stream_video(processing_type.clone(), frame_rx)
            .await?;
        debug!(task_id = %task_id, device = %device.address(), "Device accepted stream");

        Ok(OpenBridge {
            task_id,
            device_address: device.address().to_string(),
            processing_type,
            streams,
            events,
            frames,
            responses,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Whether both the capture worker and bridge task have ended.
    pub fn is_finished(&self) -> bool {
        self.capture.is_finished() && self.bridge.is_finished()
    }

    /// Cancel the bridge and wait for both tasks to end.
    pub async fn stop(self) {
        self.cancel.cancel();

        if let Err(e) = self.capture.await {
            warn!(task_id = %self.task_id, error = %e, "Capture worker panicked");
        }
        if let Err(e) = self.bridge.await {
            warn!(task_id = %self.task_id, error = %e, "Bridge task panicked");
        }
        debug!(task_id = %self.task_id, "Bridge stopped");
    }
}

impl OpenBridge {
    /// Start the capture worker and the bridge task.
    ///
    /// `on_exit` runs when the bridge ends without being stopped, after the
    /// stream process has been stopped. It receives the error, if any.
    pub fn spawn<F>(self, on_exit: F) -> StreamBridge
    where
        F: FnOnce(Option<&BridgeError>) + Send + 'static,
    {
        let OpenBridge {
            task_id,
            device_address,
            processing_type,
            streams,
            events,
            frames,
            responses,
        } = self;

        let cancel = CancellationToken::new();

        let capture = tokio::spawn(pump_frames(
            task_id.clone(),
            streams.clone(),
            frames,
            cancel.clone(),
        ));

        let bridge = tokio::spawn({
            let task_id = task_id.clone();
            let cancel = cancel.clone();
            async move {
                info!(
                    task_id = %task_id,
                    device = %device_address,
                    processing_type = %processing_type,
                    "Bridge started"
                );

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(task_id = %task_id, "Bridge cancelled");
                        return;
                    }
                    result = relay(&task_id, responses, events.as_ref()) => result,
                };

                // nothing consumes the capture any more
                cancel.cancel();
                streams.stop_stream(&task_id).await;

                let kind = match &result {
                    Ok(()) => {
                        info!(task_id = %task_id, "Bridge completed");
                        TaskEventKind::Completed
                    }
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Bridge aborted");
                        TaskEventKind::Failed(e.to_string())
                    }
                };
                if let Some(events) = &events {
                    let _ = events.send(TaskEvent {
                        task_id: task_id.clone(),
                        kind,
                    });
                }

                on_exit(result.as_ref().err());
            }
        });

        StreamBridge {
            task_id,
            cancel,
            capture,
            bridge,
        }
    }
}

/// Relay every device response until the stream ends.
async fn relay(
    task_id: &str,
    mut responses: ResponseStream,
    events: Option<&EventSink>,
) -> Result<(), BridgeError> {
    while let Some(response) = responses.next().await {
        let message = response?;
        info!(task_id = %task_id, response = %message, "Response from device");

        if let Some(events) = events {
            let _ = events.send(TaskEvent {
                task_id: task_id.to_string(),
                kind: TaskEventKind::Response(message),
            });
        }
    }

    Ok(())
}

/// Read the capture output, demux it and queue complete frames.
///
/// Parks on a full queue until there is room or `cancel` fires.
pub(crate) async fn pump_frames(
    task_id: String,
    streams: Arc<StreamProcessManager>,
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut demuxer = FrameDemuxer::new();

    'read: loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'read,
            chunk = streams.get_stream_output(&task_id) => chunk,
        };

        let chunk = match chunk {
            Ok(chunk) if chunk.is_empty() => {
                debug!(task_id = %task_id, "Capture output ended");
                break;
            }
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Capture read failed");
                break;
            }
        };

        for frame in demuxer.push(&chunk) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'read,
                sent = frames.send(frame) => {
                    if sent.is_err() {
                        debug!(task_id = %task_id, "Frame queue closed");
                        break 'read;
                    }
                }
            }
        }
    }

    if let Err(truncation) = demuxer.finish() {
        warn!(task_id = %task_id, bytes = truncation.bytes, "{}", truncation);
    }

    debug!(
        task_id = %task_id,
        frames = demuxer.frames_emitted(),
        discarded_bytes = demuxer.bytes_discarded(),
        "Capture worker finished"
    );
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::device::testing::{FakeConnector, FakeDevice};
    use crate::device::DeviceConnector;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn streams_with(script: &str) -> Arc<StreamProcessManager> {
        Arc::new(StreamProcessManager::new(CaptureConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stop_timeout_ms: 1000,
            ..CaptureConfig::default()
        }))
    }

    async fn fake_device(address: &str) -> (Arc<dyn DeviceClient>, Arc<FakeDevice>) {
        let connector = FakeConnector::default();
        let device = connector.connect(address).await.unwrap();
        let fake = connector.device(address).unwrap();
        (device, fake)
    }

    fn params(
        task_id: &str,
        device: Arc<dyn DeviceClient>,
        streams: &Arc<StreamProcessManager>,
        queue_size: usize,
        events: Option<EventSink>,
    ) -> BridgeParams {
        BridgeParams {
            task_id: task_id.to_string(),
            processing_type: "motion_detection".to_string(),
            device,
            streams: streams.clone(),
            queue_size,
            events,
        }
    }

    #[tokio::test]
    async fn test_frames_reach_device_and_responses_are_relayed() {
        let streams = streams_with(r"printf '\377\330ab\377\331noise\377\330cd\377\331'; sleep 30");
        streams.start_stream("t1", "/dev/video0").unwrap();
        let (device, fake) = fake_device("10.0.0.5:9000").await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut params = params("t1", device, &streams, 2, Some(events_tx));
        params.processing_type = "face_recognition".to_string();
        let bridge = StreamBridge::open(params).await.unwrap().spawn(|_| {});

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event.kind, TaskEventKind::Response(_)));
        }

        let frames = fake.frames.lock().clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, b'a', b'b', 0xFF, 0xD9]);
        assert_eq!(&frames[1][..], &[0xFF, 0xD8, b'c', b'd', 0xFF, 0xD9]);
        assert_eq!(*fake.handshakes.lock(), vec!["face_recognition".to_string()]);

        bridge.stop().await;
        streams.stop_stream("t1").await;
    }

    #[tokio::test]
    async fn test_refused_stream_fails_open() {
        let streams = streams_with("sleep 30");
        streams.start_stream("t2", "/dev/video0").unwrap();
        let (device, fake) = fake_device("broken:1").await;

        let result = StreamBridge::open(params("t2", device, &streams, 2, None)).await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("device offline"));
        assert_eq!(fake.handshakes.lock().len(), 1);

        // the capture process belongs to the caller until the bridge runs
        assert!(streams.is_running("t2"));
        streams.stop_stream("t2").await;
    }

    #[tokio::test]
    async fn test_stream_reset_stops_capture_and_reports() {
        let streams = streams_with(r"printf '\377\330ab\377\331'; sleep 30");
        streams.start_stream("t5", "/dev/video0").unwrap();
        let (device, _fake) = fake_device("flaky:1").await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let bridge = StreamBridge::open(params("t5", device, &streams, 2, Some(events_tx)))
            .await
            .unwrap()
            .spawn(move |err| {
                let _ = exit_tx.send(err.map(|e| e.to_string()));
            });

        let reason = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(reason.unwrap().contains("stream reset"));
        assert!(!streams.is_running("t5"));
        assert!(streams.list_streams().is_empty());

        let first = events_rx.recv().await.unwrap();
        assert!(matches!(first.kind, TaskEventKind::Response(_)));
        let last = events_rx.recv().await.unwrap();
        assert!(matches!(last.kind, TaskEventKind::Failed(ref e) if e.contains("stream reset")));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_capture_end_completes_bridge() {
        let streams = streams_with(r"printf '\377\330x\377\331'");
        streams.start_stream("t3", "/dev/video0").unwrap();
        let (device, fake) = fake_device("10.0.0.6:9000").await;
        let (exit_tx, exit_rx) = oneshot::channel();

        let bridge = StreamBridge::open(params("t3", device, &streams, 1, None))
            .await
            .unwrap()
            .spawn(move |err| {
                let _ = exit_tx.send(err.is_none());
            });

        let clean = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(clean);
        assert_eq!(fake.frames.lock().len(), 1);
        assert!(streams.list_streams().is_empty());

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_blocked_worker() {
        let streams = streams_with("sleep 30");
        streams.start_stream("t4", "/dev/video0").unwrap();
        let (device, _fake) = fake_device("10.0.0.7:9000").await;

        let bridge = StreamBridge::open(params("t4", device, &streams, 1, None))
            .await
            .unwrap()
            .spawn(|_| panic!("stopped bridges do not run the exit hook"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), bridge.stop())
            .await
            .unwrap();

        // stopping the bridge leaves the process to its owner
        assert!(streams.is_running("t4"));
        streams.stop_stream("t4").await;
    }

    #[tokio::test]
    async fn test_slow_device_throttles_capture() {
        // 2000 frames of 4 KiB, far more than the pipe, one read and the queue hold
        let marker = std::env::temp_dir().join(format!("camhub-capture-{}", uuid::Uuid::new_v4()));
        let script = format!(
            r"i=0; while [ $i -lt 2000 ]; do printf '\377\330%04096d\377\331' 0; i=$((i+1)); done; touch {}; sleep 30",
            marker.display()
        );
        let streams = streams_with(&script);
        streams.start_stream("t6", "/dev/video0").unwrap();
        let (device, fake) = fake_device("stalled:1").await;

        let bridge = StreamBridge::open(params("t6", device, &streams, 1, None))
            .await
            .unwrap()
            .spawn(|_| panic!("stopped bridges do not run the exit hook"));

        tokio::time::sleep(Duration::from_millis(500)).await;

        // the capture worker is parked on the full queue, so output backs up
        assert!(!marker.exists());
        assert!(!bridge.is_finished());
        assert!(streams.is_running("t6"));

        tokio::time::timeout(Duration::from_secs(5), bridge.stop())
            .await
            .unwrap();

        let mut queued = fake.stalled.lock().take().unwrap();
        let mut held = 0;
        while queued.try_recv().is_ok() {
            held += 1;
        }
        assert_eq!(held, 1);
        assert!(fake.frames.lock().is_empty());

        streams.stop_stream("t6").await;
        let _ = std::fs::remove_file(&marker);
    }
}
