//! Shared application state.

use crate::clients::ClientRegistry;
use crate::config::HubConfig;
use crate::device::{DeviceConnector, SavedFrame};
use crate::feed::CaptureFeed;
use crate::peers::{PeerId, PeerRegistry, PeerSender};
use crate::stream_process::{StreamError, StreamProcessManager};
use crate::tasks::{TaskError, TaskRegistry};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owner of every registry. Shared between connections as `Arc<Hub>`.
pub struct Hub {
    config: HubConfig,
    clients: Arc<ClientRegistry>,
    tasks: TaskRegistry,
    streams: Arc<StreamProcessManager>,
    peers: PeerRegistry,
    feeds: Mutex<HashMap<PeerId, CaptureFeed>>,
}

impl Hub {
    pub fn new(config: HubConfig, connector: Arc<dyn DeviceConnector>) -> Self {
        let clients = Arc::new(ClientRegistry::new(connector));
        let streams = Arc::new(StreamProcessManager::new(config.capture.clone()));
        let tasks = TaskRegistry::new(clients.clone(), streams.clone(), &config.capture);

        Self {
            config,
            clients,
            tasks,
            streams,
            peers: PeerRegistry::new(),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn streams(&self) -> &StreamProcessManager {
        &self.streams
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Remove a client and stop every task it owns.
    ///
    /// The client goes first, so a task start racing this call either
    /// fails or registers a task that is stopped here.
    pub async fn remove_client(&self, id: &str) -> bool {
        let removed = self.clients.remove_client(id).is_some();
        let stopped = self.tasks.stop_tasks_for_client(id).await;
        if stopped > 0 {
            info!(client_id = %id, tasks = stopped, "Stopped tasks of removed client");
        }
        removed
    }

    /// Frames saved on a client's device.
    pub async fn retrieve_frames(&self, client_id: &str) -> Result<Vec<SavedFrame>, TaskError> {
        let device = self
            .clients
            .device(client_id)
            .ok_or_else(|| TaskError::UnknownClient(client_id.to_string()))?;
        Ok(device.retrieve_frames().await?)
    }

    /// Start the capture feed of a frontend peer. Frames are queued on
    /// `sink` as binary messages.
    pub async fn start_feed(
        &self,
        peer: PeerId,
        input_device: Option<&str>,
        sink: PeerSender,
    ) -> Result<String, StreamError> {
        let id = feed_id(peer);
        if self.streams.is_running(&id) {
            return Err(StreamError::AlreadyRunning(id));
        }

        // a previous feed whose capture exited
        let previous = self.feeds.lock().remove(&peer);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let input = input_device.unwrap_or(&self.config.capture.default_input_device);
        self.streams.start_stream(&id, input)?;

        let feed = CaptureFeed::spawn(
            &id,
            self.streams.clone(),
            sink,
            self.config.capture.frame_queue_size,
        );
        self.feeds.lock().insert(peer, feed);
        Ok(id)
    }

    /// Stop the capture feed of a peer, if it has one.
    pub async fn stop_feed(&self, peer: PeerId) -> bool {
        let feed = self.feeds.lock().remove(&peer);
        if let Some(feed) = feed {
            feed.stop().await;
        }

        let id = feed_id(peer);
        if self.streams.list_streams().contains(&id) {
            self.streams.stop_stream(&id).await
        } else {
            false
        }
    }

    /// Stop every task and stream and close every peer.
    pub async fn shutdown(&self) {
        info!("Shutting down hub");
        let feeds: Vec<CaptureFeed> = self.feeds.lock().drain().map(|(_, feed)| feed).collect();
        for feed in feeds {
            feed.stop().await;
        }
        self.tasks.stop_all().await;
        self.streams.stop_all().await;
        self.peers.close_all(&json!({"message": "close"}).to_string());
    }
}

/// Stream id of a peer's capture feed.
pub fn feed_id(peer: PeerId) -> String {
    format!("peer-{}-feed", peer)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::device::testing::FakeConnector;
    use crate::peers::Outbound;
    use crate::tasks::{TaskState, TaskType};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn hub_with(script: &str, connector: Arc<FakeConnector>) -> Hub {
        let config = HubConfig {
            capture: CaptureConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                stop_timeout_ms: 1000,
                ..CaptureConfig::default()
            },
            ..HubConfig::default()
        };
        Hub::new(config, connector)
    }

    fn hub() -> Hub {
        hub_with("sleep 30", Arc::new(FakeConnector::default()))
    }

    #[tokio::test]
    async fn test_remove_client_stops_its_tasks() {
        let hub = hub();
        assert_ok!(hub.clients().add_client("cam1", "10.0.0.5:9000").await);
        let id = hub.tasks().start_task(TaskType::VideoStream, "cam1").await.unwrap();

        assert!(hub.remove_client("cam1").await);
        assert_eq!(hub.tasks().task(&id).unwrap().state, TaskState::Stopped);
        assert!(hub.streams().list_streams().is_empty());
        assert!(!hub.remove_client("cam1").await);
    }

    #[tokio::test]
    async fn test_remove_client_during_start_registers_nothing() {
        let connector = Arc::new(FakeConnector::default());
        let hub = hub_with("sleep 30", connector.clone());
        assert_ok!(hub.clients().add_client("cam1", "gated:9000").await);
        let device = connector.device("gated:9000").unwrap();

        let (started, removed) = tokio::join!(
            hub.tasks().start_task(TaskType::VideoStream, "cam1"),
            async {
                // the start is parked inside the device handshake
                while device.handshakes.lock().is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                assert!(hub.tasks().list_tasks().is_empty());
                let removed = hub.remove_client("cam1").await;
                connector.gate.notify_one();
                removed
            }
        );

        assert!(removed);
        assert!(matches!(started, Err(TaskError::UnknownClient(ref id)) if id == "cam1"));
        assert!(hub.tasks().list_tasks().is_empty());
        assert!(hub.streams().list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_feed_lifecycle() {
        let hub = hub_with(
            r"while true; do printf '\377\330x\377\331'; sleep 0.05; done",
            Arc::new(FakeConnector::default()),
        );
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();

        let id = hub.start_feed(7, Some("/dev/video2"), peer_tx.clone()).await.unwrap();
        assert_eq!(id, "peer-7-feed");
        assert!(hub.streams().is_running(&id));

        let err = hub.start_feed(7, None, peer_tx).await.unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning(_)));

        let frame = tokio::time::timeout(Duration::from_secs(5), peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Outbound::Frame(ref data) if data[..] == [0xFF, 0xD8, b'x', 0xFF, 0xD9]));

        assert!(hub.stop_feed(7).await);
        assert!(!hub.stop_feed(7).await);
        assert!(hub.streams().list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_frames_unknown_client() {
        let hub = hub();
        let err = hub.retrieve_frames("ghost").await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let hub = hub();
        assert_ok!(hub.clients().add_client("cam1", "10.0.0.5:9000").await);
        hub.tasks().start_task(TaskType::VideoStream, "cam1").await.unwrap();
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        hub.start_feed(1, None, peer_tx).await.unwrap();

        hub.shutdown().await;
        assert!(hub.streams().list_streams().is_empty());
        assert!(hub
            .tasks()
            .list_tasks()
            .iter()
            .all(|t| t.state == TaskState::Stopped));
    }
}
