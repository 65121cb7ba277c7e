//! Registration handshake and directive dispatch for one peer connection.
//!
//! A connection is greeted, then must name its `client_type` before any
//! other message is accepted. Once registered, every text message is a
//! JSON object whose top-level keys select directives.

use crate::bridge::{EventSink, TaskEvent, TaskEventKind};
use crate::hub::Hub;
use crate::peers::{Outbound, PeerId, PeerRole, PeerSender};
use crate::tasks::{StartTask, TaskType};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Keys of camera messages relayed to every frontend.
const CAMERA_ALERTS: [&str; 4] = [
    "motion_detected",
    "face_detected",
    "detection_data",
    "performance_metrics",
];

#[derive(Debug, Error, PartialEq)]
pub enum DirectiveError {
    #[error("Malformed {directive} directive: {reason}")]
    Malformed {
        directive: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddClientArgs {
    pub client_id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRef {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskRef {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartTaskArgs {
    #[serde(default = "default_task_type")]
    pub task_type: String,
    pub client_id: String,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub payload: String,
}

fn default_task_type() -> String {
    TaskType::VideoStream.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateSettingsArgs {
    pub task_id: String,
    pub settings: HashMap<String, String>,
}

/// Camera parameters, each forwarded to every camera when present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CameraParameters {
    #[serde(default)]
    pub set_frame_rate: Option<Value>,
    #[serde(default)]
    pub set_resolution: Option<Value>,
    #[serde(default)]
    pub set_processing_mode: Option<Value>,
}

impl CameraParameters {
    fn camera_messages(&self) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(rate) = &self.set_frame_rate {
            messages.push(json!({"message": "set_frame_rate", "frame_rate": rate}));
        }
        if let Some(resolution) = &self.set_resolution {
            messages.push(json!({"message": "set_resolution", "resolution": resolution}));
        }
        if let Some(mode) = &self.set_processing_mode {
            messages.push(json!({"message": "set_processing_mode", "mode": mode}));
        }
        messages
    }
}

/// A directive accepted from a frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendDirective {
    Ping,
    ShowClients,
    NewCamera { input_device: Option<String> },
    GetVideoFeed,
    StopVideoFeed,
    GetPerformanceMetrics,
    GetDetectionData,
    SetCameraParameters(CameraParameters),
    StartVideo,
    StopVideo,
    AddClient(AddClientArgs),
    RemoveClient(ClientRef),
    ListClients,
    StartTask(StartTaskArgs),
    StopTask(TaskRef),
    UpdateSettings(UpdateSettingsArgs),
    RetrieveFrames(ClientRef),
    CloseClients,
}

/// Frontend directive keys, in execution order.
const FRONTEND_DIRECTIVES: [&str; 18] = [
    "ping",
    "show_clients",
    "new_camera",
    "get_video_feed",
    "stop_video_feed",
    "get_performance_metrics",
    "get_detection_data",
    "set_camera_parameters",
    "start_video",
    "stop_video",
    "add_client",
    "remove_client",
    "list_clients",
    "start_task",
    "stop_task",
    "update_settings",
    "retrieve_frames",
    "close_clients",
];

impl FrontendDirective {
    /// Directives named by the keys of `message`, in execution order.
    /// Unknown keys are ignored.
    pub fn parse_all(message: &Map<String, Value>) -> Vec<Result<Self, DirectiveError>> {
        FRONTEND_DIRECTIVES
            .iter()
            .filter_map(|key| message.get(*key).map(|value| Self::parse(*key, value, message)))
            .collect()
    }

    fn parse(
        key: &'static str,
        value: &Value,
        message: &Map<String, Value>,
    ) -> Result<Self, DirectiveError> {
        let directive = match key {
            "ping" => Self::Ping,
            "show_clients" => Self::ShowClients,
            "new_camera" => Self::NewCamera {
                input_device: match value {
                    Value::String(device) => Some(device.clone()),
                    Value::Object(fields) => fields
                        .get("input_device")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                },
            },
            "get_video_feed" => Self::GetVideoFeed,
            "stop_video_feed" => Self::StopVideoFeed,
            "get_performance_metrics" => Self::GetPerformanceMetrics,
            "get_detection_data" => Self::GetDetectionData,
            "set_camera_parameters" => {
                // parameters may be nested or sit next to the directive key
                let params = if value.is_object() {
                    value.clone()
                } else {
                    Value::Object(message.clone())
                };
                let params: CameraParameters = args(key, params)?;
                if params.camera_messages().is_empty() {
                    return Err(DirectiveError::Malformed {
                        directive: key,
                        reason: "no camera parameters given".to_string(),
                    });
                }
                Self::SetCameraParameters(params)
            }
            "start_video" => Self::StartVideo,
            "stop_video" => Self::StopVideo,
            "add_client" => Self::AddClient(args(key, value.clone())?),
            "remove_client" => Self::RemoveClient(args(key, value.clone())?),
            "list_clients" => Self::ListClients,
            "start_task" => Self::StartTask(args(key, value.clone())?),
            "stop_task" => Self::StopTask(args(key, value.clone())?),
            "update_settings" => Self::UpdateSettings(args(key, value.clone())?),
            "retrieve_frames" => Self::RetrieveFrames(args(key, value.clone())?),
            "close_clients" => Self::CloseClients,
            _ => {
                return Err(DirectiveError::Malformed {
                    directive: key,
                    reason: "unsupported directive".to_string(),
                })
            }
        };
        Ok(directive)
    }
}

fn args<T: DeserializeOwned>(directive: &'static str, value: Value) -> Result<T, DirectiveError> {
    serde_json::from_value(value).map_err(|e| DirectiveError::Malformed {
        directive,
        reason: e.to_string(),
    })
}

fn send(outbound: &PeerSender, message: Value) {
    if outbound.send(Outbound::Text(message.to_string())).is_err() {
        debug!("Connection writer is gone");
    }
}

fn error_reply(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Runs the protocol of one connection against the shared hub.
pub struct ConnectionHandler {
    hub: Arc<Hub>,
}

impl ConnectionHandler {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Serve one connection until `inbound` ends.
    ///
    /// Messages for the peer are queued on `outbound`; the caller's writer
    /// closes the socket on [`Outbound::Close`].
    pub async fn run<S>(&self, mut inbound: S, outbound: PeerSender)
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        send(&outbound, json!({"message": "Connected to server"}));

        let registration = match self.hub.config().session.registration_timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, await_client_type(&mut inbound, &outbound)).await {
                    Ok(role) => role,
                    Err(_) => {
                        warn!(timeout_secs = limit.as_secs(), "Registration timed out");
                        send(&outbound, json!({"message": "Registration timed out"}));
                        let _ = outbound.send(Outbound::Close);
                        return;
                    }
                }
            }
            None => await_client_type(&mut inbound, &outbound).await,
        };

        let Some(role) = registration else {
            debug!("Connection closed before registration");
            return;
        };

        let peer_id = self.hub.peers().register(role, outbound.clone(), |id| {
            let message = match role {
                PeerRole::Frontend => "Registered as frontend client",
                PeerRole::Camera => "Registered as backend client",
            };
            json!({"message": message, "id": id}).to_string()
        });

        match role {
            PeerRole::Frontend => self.frontend_session(peer_id, &mut inbound, outbound).await,
            PeerRole::Camera => self.camera_session(peer_id, &mut inbound, &outbound).await,
        }

        self.hub.peers().unregister(peer_id);
        if self.hub.stop_feed(peer_id).await {
            info!(peer_id, "Stopped video feed of disconnected peer");
        }
    }

    async fn frontend_session<S>(&self, peer_id: PeerId, inbound: &mut S, outbound: PeerSender)
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_task_events(events_rx, outbound.clone()));

        let mut session = FrontendSession {
            hub: self.hub.clone(),
            peer_id,
            outbound,
            feed_input: None,
            events: events_tx,
        };

        while let Some(text) = inbound.next().await {
            info!(peer_id, message = %text, "Received message from frontend");
            session.handle(&text).await;
        }

        forwarder.abort();
    }

    async fn camera_session<S>(&self, peer_id: PeerId, inbound: &mut S, outbound: &PeerSender)
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        while let Some(text) = inbound.next().await {
            info!(peer_id, message = %text, "Received message from camera");

            let message = match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(message)) => message,
                Ok(_) => {
                    send(outbound, error_reply("Unknown directive"));
                    continue;
                }
                Err(_) => {
                    send(outbound, error_reply("Invalid JSON"));
                    continue;
                }
            };

            let mut handled = false;
            if message.contains_key("ping") {
                send(outbound, json!({"message": "pong"}));
                handled = true;
            }
            if CAMERA_ALERTS.iter().any(|key| message.contains_key(*key)) {
                let alert = json!({ "message": text }).to_string();
                let delivered = self.hub.peers().broadcast(PeerRole::Frontend, &alert);
                debug!(peer_id, frontends = delivered, "Relayed camera alert");
                handled = true;
            }
            if !handled {
                send(outbound, error_reply("Unknown directive"));
            }
        }
    }
}

/// Wait for a valid `client_type`. `None` if the connection ends first.
async fn await_client_type<S>(inbound: &mut S, outbound: &PeerSender) -> Option<PeerRole>
where
    S: Stream<Item = String> + Unpin + Send,
{
    while let Some(text) = inbound.next().await {
        let role = serde_json::from_str::<Value>(&text).ok().and_then(|message| {
            message
                .get("client_type")
                .and_then(Value::as_str)
                .and_then(PeerRole::from_client_type)
        });

        match role {
            Some(role) => return Some(role),
            None => {
                debug!(message = %text, "Invalid client type");
                send(outbound, json!({"message": "Invalid client type"}));
            }
        }
    }
    None
}

async fn forward_task_events(mut events: mpsc::UnboundedReceiver<TaskEvent>, outbound: PeerSender) {
    while let Some(event) = events.recv().await {
        let message = match event.kind {
            TaskEventKind::Response(response) => json!({
                "message": "task_response",
                "task_id": event.task_id,
                "response": response,
            }),
            TaskEventKind::Completed => json!({
                "message": "task_completed",
                "task_id": event.task_id,
            }),
            TaskEventKind::Failed(reason) => json!({
                "message": "task_failed",
                "task_id": event.task_id,
                "error": reason,
            }),
        };
        if outbound.send(Outbound::Text(message.to_string())).is_err() {
            break;
        }
    }
}

/// State of a registered frontend connection.
struct FrontendSession {
    hub: Arc<Hub>,
    peer_id: PeerId,
    outbound: PeerSender,
    /// Input device set by `new_camera`.
    feed_input: Option<String>,
    events: EventSink,
}

impl FrontendSession {
    async fn handle(&mut self, text: &str) {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(message)) => message,
            Ok(_) => return self.reply(error_reply("Unknown directive")),
            Err(_) => return self.reply(error_reply("Invalid JSON")),
        };

        let directives = FrontendDirective::parse_all(&message);
        if directives.is_empty() {
            return self.reply(error_reply("Unknown directive"));
        }

        for directive in directives {
            match directive {
                Ok(directive) => self.execute(directive).await,
                Err(e) => {
                    warn!(peer_id = self.peer_id, error = %e, "Rejected directive");
                    self.reply(error_reply(e));
                }
            }
        }
    }

    async fn execute(&mut self, directive: FrontendDirective) {
        let hub = self.hub.clone();

        match directive {
            FrontendDirective::Ping => self.reply(json!({"message": "pong"})),
            FrontendDirective::ShowClients => self.reply(json!({
                "message": "Connected clients",
                "clients": hub.peers().ids(),
            })),
            FrontendDirective::NewCamera { input_device } => {
                let input_device = input_device
                    .unwrap_or_else(|| hub.config().capture.default_input_device.clone());
                info!(peer_id = self.peer_id, input_device = %input_device, "Configured video feed");
                self.reply(json!({"message": "Camera configured", "input_device": input_device}));
                self.feed_input = Some(input_device);
            }
            FrontendDirective::GetVideoFeed => {
                let Some(input_device) = self.feed_input.clone() else {
                    warn!(peer_id = self.peer_id, "No camera configured for video feed");
                    return self.reply(error_reply("No camera configured"));
                };
                match hub
                    .start_feed(self.peer_id, Some(&input_device), self.outbound.clone())
                    .await
                {
                    Ok(stream_id) => {
                        self.reply(json!({"message": "Video feed started", "stream_id": stream_id}))
                    }
                    Err(e) => self.reply(error_reply(e)),
                }
            }
            FrontendDirective::StopVideoFeed => {
                if hub.stop_feed(self.peer_id).await {
                    self.feed_input = None;
                    self.reply(json!({"message": "Video feed stopped"}));
                } else {
                    self.reply(error_reply("No video feed running"));
                }
            }
            FrontendDirective::GetPerformanceMetrics => {
                self.to_cameras(json!({"message": "get_performance_metrics"}))
            }
            FrontendDirective::GetDetectionData => {
                self.to_cameras(json!({"message": "get_detection_data"}))
            }
            FrontendDirective::SetCameraParameters(params) => {
                for message in params.camera_messages() {
                    self.to_cameras(message);
                }
            }
            FrontendDirective::StartVideo => self.to_cameras(json!({"message": "start_video"})),
            FrontendDirective::StopVideo => self.to_cameras(json!({"message": "stop_video"})),
            FrontendDirective::AddClient(args) => {
                match hub.clients().add_client(&args.client_id, &args.address).await {
                    Ok(()) => self.reply(json!({
                        "message": "Client added",
                        "client_id": args.client_id,
                    })),
                    Err(e) => self.reply(error_reply(e)),
                }
            }
            FrontendDirective::RemoveClient(args) => {
                if hub.remove_client(&args.client_id).await {
                    self.reply(json!({"message": "Client removed", "client_id": args.client_id}));
                } else {
                    self.reply(error_reply(format!("Client {} does not exist", args.client_id)));
                }
            }
            FrontendDirective::ListClients => self.reply(json!({
                "message": "Clients",
                "clients": hub.clients().list_clients(),
            })),
            FrontendDirective::StartTask(args) => {
                let mut request = StartTask::new(TaskType::parse(&args.task_type), &args.client_id)
                    .with_payload(args.payload)
                    .with_events(self.events.clone());
                request.input_device = args.input_device;

                match hub.tasks().start(request).await {
                    Ok(task_id) => self.reply(json!({
                        "message": "Task started",
                        "task_id": task_id,
                        "task_type": args.task_type,
                        "client_id": args.client_id,
                    })),
                    Err(e) => self.reply(error_reply(e)),
                }
            }
            FrontendDirective::StopTask(args) => {
                if hub.tasks().task(&args.task_id).is_none() {
                    return self.reply(error_reply(format!("Unknown task: {}", args.task_id)));
                }
                let was_running = hub.tasks().stop_task(&args.task_id).await;
                self.reply(json!({
                    "message": "Task stopped",
                    "task_id": args.task_id,
                    "was_running": was_running,
                }));
            }
            FrontendDirective::UpdateSettings(args) => {
                match hub.tasks().update_task_settings(&args.task_id, args.settings) {
                    Ok(()) => self.reply(json!({
                        "message": "Settings updated",
                        "task_id": args.task_id,
                    })),
                    Err(e) => self.reply(error_reply(e)),
                }
            }
            FrontendDirective::RetrieveFrames(args) => match hub.retrieve_frames(&args.client_id).await {
                Ok(frames) => self.reply(json!({
                    "message": "Retrieved frames",
                    "client_id": args.client_id,
                    "frames": frames.len(),
                })),
                Err(e) => self.reply(error_reply(e)),
            },
            FrontendDirective::CloseClients => {
                info!(peer_id = self.peer_id, "Closing all connections");
                hub.peers().close_all(&json!({"message": "close"}).to_string());
            }
        }
    }

    fn reply(&self, message: Value) {
        send(&self.outbound, message);
    }

    fn to_cameras(&self, message: Value) {
        let delivered = self.hub.peers().broadcast(PeerRole::Camera, &message.to_string());
        debug!(peer_id = self.peer_id, cameras = delivered, message = %message, "Forwarded to cameras");
    }
}
