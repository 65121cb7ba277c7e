//! Clients for external processing devices.
//!
//! A device exposes the `VideoStreamer` and `TaskManager` gRPC services.
//! The registries only see the [`DeviceClient`] trait, so the transport
//! can be swapped in tests.

use crate::config::GrpcConfig;
use crate::proto::task_manager_client::TaskManagerClient;
use crate::proto::video_streamer_client::VideoStreamerClient;
use crate::proto::{TaskChunk, TaskRequest, VideoChunk};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, info, warn};

/// Payload size above which generic task payloads are uploaded in chunks.
pub const STREAM_TASK_CHUNK: usize = 64 * 1024;

/// Errors raised while talking to a processing device.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid device address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to connect to device at {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("Device call failed: {0}")]
    Status(#[from] tonic::Status),
}

/// Sequence of device responses for one bridged stream.
pub type ResponseStream = BoxStream<'static, Result<String, BridgeError>>;

/// A frame previously saved by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrame {
    pub image: Bytes,
    pub timestamp: String,
}

/// Operations the hub needs from a processing device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Address the client is connected to.
    fn address(&self) -> &str;

    /// Processing type announced at the start of the next video stream.
    fn processing_type(&self) -> String;

    /// Change the processing type. Takes effect on the next stream.
    fn set_processing_type(&self, processing_type: &str);

    /// Stream frames to the device and return its responses.
    ///
    /// The first unit sent carries only `processing_type`; each following
    /// unit carries one frame.
    async fn stream_video(
        &self,
        processing_type: String,
        frames: mpsc::Receiver<Bytes>,
    ) -> Result<ResponseStream, BridgeError>;

    /// Unary task submission.
    async fn send_task(
        &self,
        task_id: &str,
        task_type: &str,
        payload: &str,
    ) -> Result<String, BridgeError>;

    /// Chunked task payload upload.
    async fn stream_task(&self, task_id: &str, chunks: Vec<Bytes>) -> Result<String, BridgeError>;

    /// Fetch the frames the device has stored.
    async fn retrieve_frames(&self) -> Result<Vec<SavedFrame>, BridgeError>;
}

/// Opens device clients for registered addresses.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn DeviceClient>, BridgeError>;
}

/// Device client speaking gRPC over a shared tonic channel.
pub struct GrpcDeviceClient {
    address: String,
    channel: Channel,
    processing_type: RwLock<String>,
    request_timeout: Duration,
}

impl GrpcDeviceClient {
    /// Connect to `address`, retrying with exponential backoff.
    pub async fn connect(address: &str, config: &GrpcConfig) -> Result<Self, BridgeError> {
        let uri = endpoint_uri(address);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| BridgeError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(config.connection_timeout());

        let mut backoff = ExponentialBackoff {
            initial_interval: config.reconnect_base_delay(),
            max_interval: config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0u32;

        let channel = loop {
            match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) => {
                    attempts += 1;
                    if attempts >= config.max_connect_attempts {
                        return Err(BridgeError::Connection {
                            address: address.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            address = %address,
                            attempt = attempts,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Device connection failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        info!(address = %address, uri = %uri, attempts = attempts + 1, "Connected to device");

        Ok(Self {
            address: address.to_string(),
            channel,
            processing_type: RwLock::new(config.default_processing_type.clone()),
            request_timeout: config.request_timeout(),
        })
    }

    fn unary<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.request_timeout);
        request
    }
}

#[async_trait]
impl DeviceClient for GrpcDeviceClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn processing_type(&self) -> String {
        self.processing_type.read().clone()
    }

    fn set_processing_type(&self, processing_type: &str) {
        *self.processing_type.write() = processing_type.to_string();
        info!(
            address = %self.address,
            processing_type = %processing_type,
            "Updated device processing type"
        );
    }

    async fn stream_video(
        &self,
        processing_type: String,
        frames: mpsc::Receiver<Bytes>,
    ) -> Result<ResponseStream, BridgeError> {
        let handshake = VideoChunk {
            data: Bytes::new(),
            processing_type,
        };
        let outbound = stream::once(async move { handshake }).chain(
            ReceiverStream::new(frames).map(|frame| VideoChunk {
                data: frame,
                processing_type: String::new(),
            }),
        );

        let mut client = VideoStreamerClient::new(self.channel.clone());
        let responses = client.stream_video(outbound).await?.into_inner();

        Ok(responses
            .map(|response| {
                response
                    .map(|r| r.message)
                    .map_err(BridgeError::from)
            })
            .boxed())
    }

    async fn send_task(
        &self,
        task_id: &str,
        task_type: &str,
        payload: &str,
    ) -> Result<String, BridgeError> {
        let request = self.unary(TaskRequest {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            payload: payload.to_string(),
        });

        let mut client = TaskManagerClient::new(self.channel.clone());
        let response = client.send_task(request).await?.into_inner();
        debug!(task_id = %task_id, response = %response.message, "Task accepted by device");
        Ok(response.message)
    }

    async fn stream_task(&self, task_id: &str, chunks: Vec<Bytes>) -> Result<String, BridgeError> {
        let task_id = task_id.to_string();
        let outbound = stream::iter(chunks.into_iter().map({
            let task_id = task_id.clone();
            move |data| TaskChunk {
                task_id: task_id.clone(),
                data,
            }
        }));

        let mut client = TaskManagerClient::new(self.channel.clone());
        let response = client.stream_task(outbound).await?.into_inner();
        debug!(task_id = %task_id, response = %response.message, "Task stream accepted by device");
        Ok(response.message)
    }

    async fn retrieve_frames(&self) -> Result<Vec<SavedFrame>, BridgeError> {
        info!(address = %self.address, "Requesting saved frames from device");

        let request = self.unary(TaskRequest {
            task_id: "retrieve_frames".to_string(),
            task_type: "retrieve_frames".to_string(),
            payload: String::new(),
        });

        let mut client = TaskManagerClient::new(self.channel.clone());
        let response = client.retrieve_frames(request).await?.into_inner();

        Ok(response
            .frames
            .into_iter()
            .map(|frame| SavedFrame {
                image: frame.image,
                timestamp: frame.timestamp,
            })
            .collect())
    }
}

/// Connector producing [`GrpcDeviceClient`]s.
pub struct GrpcConnector {
    config: GrpcConfig,
}

impl GrpcConnector {
    pub fn new(config: GrpcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeviceConnector for GrpcConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn DeviceClient>, BridgeError> {
        let client = GrpcDeviceClient::connect(address, &self.config).await?;
        Ok(Arc::new(client))
    }
}

/// Device addresses are registered as `host:port`; tonic needs a scheme.
fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Split a payload into [`STREAM_TASK_CHUNK`]-sized pieces.
pub fn chunk_payload(payload: &[u8]) -> Vec<Bytes> {
    payload
        .chunks(STREAM_TASK_CHUNK)
        .map(Bytes::copy_from_slice)
        .collect()
}
