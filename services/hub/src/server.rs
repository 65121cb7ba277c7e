//! HTTP surface: WebSocket upgrade and health endpoint.

use crate::connection::ConnectionHandler;
use crate::hub::Hub;
use crate::peers::Outbound;
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Create the router serving the WebSocket and health routes.
pub fn create_router(hub: Arc<Hub>) -> Router {
    let ws_path = hub.config().server.ws_path.clone();

    Router::new()
        .route("/health", get(health_check))
        .route(&ws_path, get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn start_server<F>(hub: Arc<Hub>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = hub.config().server.bind_address.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    serve(listener, hub, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve<F>(listener: TcpListener, hub: Arc<Hub>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        address = %listener.local_addr().context("Listener has no local address")?,
        ws_path = %hub.config().server.ws_path,
        "Starting WebSocket server"
    );

    axum::serve(listener, create_router(hub))
        .with_graceful_shutdown(shutdown)
        .await
        .context("WebSocket server error")?;

    Ok(())
}

async fn health_check(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "camhub",
        "peers": hub.peers().count(),
        "clients": hub.clients().list_clients().len(),
        "streams": hub.streams().list_streams().len(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

/// Run the connection protocol over a WebSocket.
///
/// A writer task drains the peer's outbound queue into the socket; the
/// inbound side yields text frames until the peer closes.
async fn serve_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let close = message == Outbound::Close;
            let frame = match message {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Frame(frame) => Message::Binary(frame.to_vec()),
                Outbound::Close => Message::Close(None),
            };
            if sink.send(frame).await.is_err() || close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream
        .take_while(|message| ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });

    ConnectionHandler::new(hub).run(inbound, outbound_tx).await;

    if let Err(e) = writer.await {
        debug!(error = %e, "Socket writer ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, ServerConfig};
    use crate::device::testing::FakeConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn hub() -> Arc<Hub> {
        let config = HubConfig {
            server: ServerConfig {
                bind_address: "127.0.0.1:0".to_string(),
                ws_path: "/ws".to_string(),
            },
            ..HubConfig::default()
        };
        Arc::new(Hub::new(config, Arc::new(FakeConnector::default())))
    }

    #[tokio::test]
    async fn test_health_check_reports_counts() {
        let Json(body) = health_check(State(hub())).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "camhub");
        assert_eq!(body["peers"], 0);
    }

    #[tokio::test]
    async fn test_serves_health_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve(listener, hub(), async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"healthy\""));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = HubConfig {
            server: ServerConfig {
                bind_address: taken.local_addr().unwrap().to_string(),
                ws_path: "/ws".to_string(),
            },
            ..HubConfig::default()
        };
        let hub = Arc::new(Hub::new(config, Arc::new(FakeConnector::default())));

        let err = start_server(hub, async {}).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind"));
    }
}
