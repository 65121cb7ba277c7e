//! Task lifecycle: start, stop and settings updates.
//!
//! A `video_stream` task owns a capture process keyed by its task id and a
//! [`StreamBridge`] feeding the owning client's device. Other task types
//! are single requests to the device.

use crate::bridge::{BridgeParams, EventSink, StreamBridge};
use crate::clients::ClientRegistry;
use crate::config::CaptureConfig;
use crate::device::{chunk_payload, BridgeError, STREAM_TASK_CHUNK};
use crate::stream_process::{StreamError, StreamProcessManager};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Settings key pushed to the device when updated.
pub const PROCESSING_TYPE_KEY: &str = "processing_type";

/// Errors raised by task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Kind of work a task performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum TaskType {
    /// Capture frames and stream them to the device.
    VideoStream,
    /// A named one-shot request handled by the device.
    Generic(String),
}

impl TaskType {
    pub fn parse(name: &str) -> Self {
        match name {
            "video_stream" => TaskType::VideoStream,
            other => TaskType::Generic(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskType::VideoStream => "video_stream",
            TaskType::Generic(name) => name,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TaskType> for String {
    fn from(task_type: TaskType) -> Self {
        task_type.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Running,
    Stopped,
}

/// Snapshot of a task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub client_id: String,
    pub state: TaskState,
    pub settings: HashMap<String, String>,
}

/// A start request with every optional parameter.
#[derive(Debug, Clone)]
pub struct StartTask {
    pub task_type: TaskType,
    pub client_id: String,
    /// Capture input for `video_stream` tasks; the configured default if unset.
    pub input_device: Option<String>,
    /// Payload of generic tasks.
    pub payload: String,
    /// Receives device responses and the end of the bridge.
    pub events: Option<EventSink>,
}

impl StartTask {
    pub fn new(task_type: TaskType, client_id: impl Into<String>) -> Self {
        Self {
            task_type,
            client_id: client_id.into(),
            input_device: None,
            payload: String::new(),
            events: None,
        }
    }

    pub fn with_input_device(mut self, input_device: impl Into<String>) -> Self {
        self.input_device = Some(input_device.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }
}

struct TaskEntry {
    task: Task,
    bridge: Option<StreamBridge>,
}

type TaskMap = Arc<RwLock<HashMap<String, TaskEntry>>>;

/// Task id to task.
pub struct TaskRegistry {
    clients: Arc<ClientRegistry>,
    streams: Arc<StreamProcessManager>,
    tasks: TaskMap,
    default_input_device: String,
    frame_queue_size: usize,
}

impl TaskRegistry {
    pub fn new(
        clients: Arc<ClientRegistry>,
        streams: Arc<StreamProcessManager>,
        capture: &CaptureConfig,
    ) -> Self {
        Self {
            clients,
            streams,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            default_input_device: capture.default_input_device.clone(),
            frame_queue_size: capture.frame_queue_size,
        }
    }

    /// Start a task of `task_type` for `client_id` with default parameters.
    pub async fn start_task(&self, task_type: TaskType, client_id: &str) -> Result<String, TaskError> {
        self.start(StartTask::new(task_type, client_id)).await
    }

    /// Start a task, returning its fresh id.
    ///
    /// If starting fails, the task is not registered and no capture
    /// process is left behind. A video stream counts as started once the
    /// device has accepted it; later failures stop the task on their own.
    pub async fn start(&self, request: StartTask) -> Result<String, TaskError> {
        let device = self
            .clients
            .device(&request.client_id)
            .ok_or_else(|| TaskError::UnknownClient(request.client_id.clone()))?;
        let task_id = Uuid::new_v4().to_string();

        match &request.task_type {
            TaskType::VideoStream => {
                let input_device = request
                    .input_device
                    .clone()
                    .unwrap_or_else(|| self.default_input_device.clone());
                self.streams.start_stream(&task_id, &input_device)?;

                let opened = StreamBridge::open(BridgeParams {
                    task_id: task_id.clone(),
                    processing_type: device.processing_type(),
                    device,
                    streams: self.streams.clone(),
                    queue_size: self.frame_queue_size,
                    events: request.events.clone(),
                })
                .await;
                let opened = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Device refused video stream");
                        self.streams.stop_stream(&task_id).await;
                        return Err(e.into());
                    }
                };

                // registration and bridge install are one step for stop_task
                let registered = {
                    let mut tasks = self.tasks.write();
                    if self.clients.contains(&request.client_id) {
                        let bridge = opened.spawn(self.exit_hook(&task_id));
                        tasks.insert(task_id.clone(), self.entry(&task_id, &request, Some(bridge)));
                        true
                    } else {
                        false
                    }
                };
                if !registered {
                    warn!(task_id = %task_id, client_id = %request.client_id, "Client removed while starting task");
                    self.streams.stop_stream(&task_id).await;
                    return Err(TaskError::UnknownClient(request.client_id.clone()));
                }
            }
            TaskType::Generic(task_type) => {
                let reply = if request.payload.len() > STREAM_TASK_CHUNK {
                    device
                        .stream_task(&task_id, chunk_payload(request.payload.as_bytes()))
                        .await?
                } else {
                    device
                        .send_task(&task_id, task_type, &request.payload)
                        .await?
                };
                info!(task_id = %task_id, reply = %reply, "Device accepted task");
                self.tasks
                    .write()
                    .insert(task_id.clone(), self.entry(&task_id, &request, None));
            }
        }

        info!(
            task_id = %task_id,
            task_type = %request.task_type,
            client_id = %request.client_id,
            "Task started"
        );
        Ok(task_id)
    }

    /// Stop a task. Unknown ids and repeated stops are no-ops.
    ///
    /// Returns once the bridge and capture process are gone. Returns
    /// whether the task was running.
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let (bridge, was_running, is_stream) = {
            let mut tasks = self.tasks.write();
            let Some(entry) = tasks.get_mut(task_id) else {
                warn!(task_id = %task_id, "Task does not exist");
                return false;
            };
            let was_running = entry.task.state == TaskState::Running;
            entry.task.state = TaskState::Stopped;
            (
                entry.bridge.take(),
                was_running,
                entry.task.task_type == TaskType::VideoStream,
            )
        };

        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
        if is_stream && was_running {
            self.streams.stop_stream(task_id).await;
        }

        if was_running {
            info!(task_id = %task_id, "Task stopped");
        }
        was_running
    }

    /// Merge `settings` into a task's settings.
    ///
    /// A `processing_type` entry is pushed to the owning client's device
    /// without waiting for confirmation.
    pub fn update_task_settings(
        &self,
        task_id: &str,
        settings: HashMap<String, String>,
    ) -> Result<(), TaskError> {
        let client_id = {
            let mut tasks = self.tasks.write();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
            entry.task.settings.extend(settings.clone());
            entry.task.client_id.clone()
        };

        if let Some(processing_type) = settings.get(PROCESSING_TYPE_KEY) {
            match self.clients.device(&client_id) {
                Some(device) => device.set_processing_type(processing_type),
                None => warn!(
                    task_id = %task_id,
                    client_id = %client_id,
                    "Owning client is gone, processing type not pushed"
                ),
            }
        }

        info!(task_id = %task_id, settings = ?settings, "Updated task settings");
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).map(|e| e.task.clone())
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Stop every running task owned by `client_id`.
    pub async fn stop_tasks_for_client(&self, client_id: &str) -> usize {
        let ids: Vec<String> = self
            .tasks
            .read()
            .values()
            .filter(|e| e.task.client_id == client_id && e.task.state == TaskState::Running)
            .map(|e| e.task.id.clone())
            .collect();

        let mut stopped = 0;
        for id in ids {
            if self.stop_task(&id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every running task.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.read().keys().cloned().collect();
        for id in ids {
            self.stop_task(&id).await;
        }
    }

    fn entry(&self, task_id: &str, request: &StartTask, bridge: Option<StreamBridge>) -> TaskEntry {
        TaskEntry {
            task: Task {
                id: task_id.to_string(),
                task_type: request.task_type.clone(),
                client_id: request.client_id.clone(),
                state: TaskState::Running,
                settings: HashMap::new(),
            },
            bridge,
        }
    }

    /// Marks the task stopped when its bridge ends on its own. The bridge
    /// has already stopped the capture process at that point. The hook
    /// waits on the task lock, so it never runs before the entry exists.
    fn exit_hook(&self, task_id: &str) -> impl FnOnce(Option<&BridgeError>) + Send + 'static {
        let tasks = self.tasks.clone();
        let task_id = task_id.to_string();
        move |error| {
            if let Some(entry) = tasks.write().get_mut(&task_id) {
                entry.task.state = TaskState::Stopped;
                // the handle of a finished bridge has nothing left to join
                entry.bridge = None;
            }
            match error {
                Some(e) => warn!(task_id = %task_id, error = %e, "Task stopped after bridge failure"),
                None => info!(task_id = %task_id, "Task finished"),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::TaskEventKind;
    use crate::device::testing::FakeConnector;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    struct Fixture {
        connector: Arc<FakeConnector>,
        clients: Arc<ClientRegistry>,
        streams: Arc<StreamProcessManager>,
        tasks: TaskRegistry,
    }

    fn fixture(script: &str) -> Fixture {
        let connector = Arc::new(FakeConnector::default());
        let clients = Arc::new(ClientRegistry::new(connector.clone()));
        let capture = CaptureConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stop_timeout_ms: 1000,
            ..CaptureConfig::default()
        };
        let streams = Arc::new(StreamProcessManager::new(capture.clone()));
        let tasks = TaskRegistry::new(clients.clone(), streams.clone(), &capture);
        Fixture {
            connector,
            clients,
            streams,
            tasks,
        }
    }

    async fn wait_for_state(tasks: &TaskRegistry, id: &str, state: TaskState) {
        for _ in 0..100 {
            if tasks.task(id).map(|t| t.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn test_video_stream_lifecycle() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "10.0.0.5:9000").await);

        let id = f.tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap();
        assert!(!id.is_empty());

        let task = f.tasks.task(&id).unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.client_id, "cam1");
        assert!(f.streams.is_running(&id));

        assert!(f.tasks.stop_task(&id).await);
        assert_eq!(f.tasks.task(&id).unwrap().state, TaskState::Stopped);
        assert!(!f.streams.is_running(&id));
        assert!(f.streams.list_streams().is_empty());

        // second stop is a no-op
        assert!(!f.tasks.stop_task(&id).await);
        assert_eq!(f.tasks.task(&id).unwrap().state, TaskState::Stopped);
        assert!(f.streams.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_registers_nothing() {
        let f = fixture("sleep 30");

        let err = f.tasks.start_task(TaskType::VideoStream, "ghost").await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownClient(ref id) if id == "ghost"));
        assert!(f.tasks.list_tasks().is_empty());
        assert!(f.streams.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let connector = Arc::new(FakeConnector::default());
        let clients = Arc::new(ClientRegistry::new(connector));
        let capture = CaptureConfig {
            program: "/nonexistent/capture-binary".to_string(),
            ..CaptureConfig::default()
        };
        let streams = Arc::new(StreamProcessManager::new(capture.clone()));
        let tasks = TaskRegistry::new(clients.clone(), streams, &capture);
        assert_ok!(clients.add_client("cam1", "10.0.0.5:9000").await);

        let err = tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap_err();
        assert!(matches!(err, TaskError::Stream(StreamError::ProcessSpawn { .. })));
        assert!(tasks.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_task() {
        let f = fixture("sleep 30");
        assert!(!f.tasks.stop_task("missing").await);
    }

    #[tokio::test]
    async fn test_refused_stream_registers_nothing() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "broken:9000").await);

        let err = f.tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap_err();
        assert!(matches!(err, TaskError::Bridge(_)));
        assert!(err.to_string().contains("device offline"));
        assert!(f.tasks.list_tasks().is_empty());
        assert!(f.streams.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_stream_reset_stops_task() {
        let f = fixture(r"printf '\377\330hello\377\331'; sleep 30");
        assert_ok!(f.clients.add_client("cam1", "flaky:9000").await);

        let id = f.tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap();
        wait_for_state(&f.tasks, &id, TaskState::Stopped).await;
        assert!(!f.streams.is_running(&id));
        assert!(f.streams.list_streams().is_empty());

        // stopping after compensation is still a no-op
        assert!(!f.tasks.stop_task(&id).await);
    }

    #[tokio::test]
    async fn test_stop_during_start_sees_no_task() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "gated:9000").await);
        let device = f.connector.device("gated:9000").unwrap();

        let (started, ()) = tokio::join!(f.tasks.start_task(TaskType::VideoStream, "cam1"), async {
            while device.handshakes.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // nothing is registered while the device handshake is pending
            f.tasks.stop_all().await;
            assert!(f.tasks.list_tasks().is_empty());
            f.connector.gate.notify_one();
        });

        let id = started.unwrap();
        assert_eq!(f.tasks.task(&id).unwrap().state, TaskState::Running);

        // the registered task always carries its bridge
        assert!(f.tasks.stop_task(&id).await);
        assert!(f.streams.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_responses_flow_to_event_sink() {
        let f = fixture(r"printf '\377\330hello\377\331'; sleep 30");
        assert_ok!(f.clients.add_client("cam1", "10.0.0.5:9000").await);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let id = f
            .tasks
            .start(
                StartTask::new(TaskType::VideoStream, "cam1")
                    .with_input_device("/dev/video3")
                    .with_events(events_tx),
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task_id, id);
        assert!(matches!(event.kind, TaskEventKind::Response(_)));

        let device = f.connector.device("10.0.0.5:9000").unwrap();
        assert_eq!(device.frames.lock().len(), 1);

        f.tasks.stop_all().await;
        assert!(f.streams.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_update_settings_pushes_processing_type() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "10.0.0.5:9000").await);
        let id = f.tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap();

        let settings = HashMap::from([
            (PROCESSING_TYPE_KEY.to_string(), "emotion_recognition".to_string()),
            ("quality".to_string(), "high".to_string()),
        ]);
        assert_ok!(f.tasks.update_task_settings(&id, settings));

        let task = f.tasks.task(&id).unwrap();
        assert_eq!(task.settings.get("quality").map(String::as_str), Some("high"));
        let device = f.clients.device("cam1").unwrap();
        assert_eq!(device.processing_type(), "emotion_recognition");

        let err = f.tasks.update_task_settings("missing", HashMap::new()).unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask(_)));

        f.tasks.stop_task(&id).await;
    }

    #[tokio::test]
    async fn test_generic_task_is_sent_to_device() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "10.0.0.5:9000").await);

        let id = f
            .tasks
            .start(StartTask::new(TaskType::parse("snapshot"), "cam1").with_payload("now"))
            .await
            .unwrap();

        let task = f.tasks.task(&id).unwrap();
        assert_eq!(task.task_type, TaskType::Generic("snapshot".to_string()));
        assert_eq!(task.state, TaskState::Running);
        assert!(f.streams.list_streams().is_empty());

        let device = f.connector.device("10.0.0.5:9000").unwrap();
        let sent = device.tasks.lock().clone();
        assert_eq!(sent, vec![(id.clone(), "snapshot".to_string(), "now".to_string())]);

        assert!(f.tasks.stop_task(&id).await);
    }

    #[tokio::test]
    async fn test_stop_tasks_for_client() {
        let f = fixture("sleep 30");
        assert_ok!(f.clients.add_client("cam1", "10.0.0.5:9000").await);
        assert_ok!(f.clients.add_client("cam2", "10.0.0.6:9000").await);

        let a = f.tasks.start_task(TaskType::VideoStream, "cam1").await.unwrap();
        let b = f.tasks.start_task(TaskType::VideoStream, "cam2").await.unwrap();

        assert_eq!(f.tasks.stop_tasks_for_client("cam1").await, 1);
        assert_eq!(f.tasks.task(&a).unwrap().state, TaskState::Stopped);
        assert_eq!(f.tasks.task(&b).unwrap().state, TaskState::Running);

        f.tasks.stop_all().await;
    }

    #[test]
    fn test_task_type_names() {
        assert_eq!(TaskType::parse("video_stream"), TaskType::VideoStream);
        assert_eq!(TaskType::parse("ocr").to_string(), "ocr");
        assert_eq!(TaskType::VideoStream.as_str(), "video_stream");
    }
}
