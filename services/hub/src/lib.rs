//! Camhub - camera task hub
//!
//! Accepts WebSocket connections from frontends and camera clients, manages
//! processing tasks bound to registered devices, and bridges capture
//! subprocess output to those devices as a stream of JPEG frames.
//!
//! # Architecture
//!
//! ```text
//! WebSocket -> ConnectionHandler -> TaskRegistry -> StreamProcessManager
//!                                                        |
//!                                 device <- StreamBridge <- FrameDemuxer
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use camhub::{GrpcConnector, Hub, HubConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HubConfig::load()?;
//!     let connector = Arc::new(GrpcConnector::new(config.grpc.clone()));
//!     let hub = Arc::new(Hub::new(config, connector));
//!
//!     camhub::server::start_server(hub.clone(), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod clients;
pub mod config;
pub mod connection;
pub mod demux;
pub mod device;
pub mod feed;
pub mod hub;
pub mod peers;
pub mod server;
pub mod stream_process;
pub mod tasks;

/// Generated types for the processing device services.
pub mod proto {
    tonic::include_proto!("workloads");
}

// Re-export main types
pub use bridge::{OpenBridge, StreamBridge, TaskEvent, TaskEventKind};
pub use clients::{Client, ClientError, ClientRegistry};
pub use config::{ConfigValidationError, HubConfig};
pub use connection::{ConnectionHandler, DirectiveError, FrontendDirective};
pub use demux::{DemuxTruncation, FrameDemuxer};
pub use device::{BridgeError, DeviceClient, DeviceConnector, GrpcConnector, GrpcDeviceClient};
pub use feed::CaptureFeed;
pub use hub::Hub;
pub use peers::{Outbound, PeerId, PeerRegistry, PeerRole};
pub use stream_process::{StreamError, StreamProcessManager};
pub use tasks::{StartTask, Task, TaskError, TaskRegistry, TaskState, TaskType};
