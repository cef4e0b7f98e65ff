//! Relay End-to-End Test Harness
//!
//! Provides:
//! - Embedded signaling server on a random port, backed by a `LoopbackEngine`
//! - WebSocket test clients speaking the signaling protocol
//! - Polling helpers for state that settles asynchronously
//!
//! Basic usage pattern:
//!
//! 1. Create a `RelayTestHarness` with a `RelayConfig`
//! 2. Create clients using `harness.create_client()`
//! 3. Exchange messages and assert on replies and `harness.engine` calls
//! 4. Call `harness.shutdown()` to clean up

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use rtp_relay::{LoopbackEngine, MediaEngine, RelayConfig, SignalingServer, SignalingServerHandle};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::info;

/// Browser-like SDP offer with one video m-line
pub const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtpmap:96 H264/90000\r\n";

/// Default reply timeout
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Initialize tracing for tests
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,rtp_relay=debug")
        .try_init();
}

/// Signaling server plus the loopback engine behind it
pub struct RelayTestHarness {
    /// Running server
    handle: SignalingServerHandle,

    /// Engine, for call inspection and event injection
    pub engine: Arc<LoopbackEngine>,
}

impl RelayTestHarness {
    /// Start a harness with the default configuration
    pub async fn new() -> HarnessResult<Self> {
        Self::with_config(RelayConfig::default(), LoopbackEngine::new()).await
    }

    /// Start a harness with a specific configuration and engine
    ///
    /// The listen address is always replaced with a random local port.
    pub async fn with_config(mut config: RelayConfig, engine: LoopbackEngine) -> HarnessResult<Self> {
        config.listen_addr = "127.0.0.1:0".to_string();

        let engine = Arc::new(engine);
        let server = SignalingServer::bind(config, engine.clone() as Arc<dyn MediaEngine>)
            .await
            .map_err(|e| HarnessError::ServerError(e.to_string()))?;
        let handle = server
            .start()
            .map_err(|e| HarnessError::ServerError(e.to_string()))?;

        info!("Test server started on {}", handle.local_addr());
        Ok(Self { handle, engine })
    }

    /// Server URL
    pub fn url(&self) -> String {
        format!("ws://{}", self.handle.local_addr())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.handle.registry().len()
    }

    /// Connect a new client
    pub async fn create_client(&self) -> HarnessResult<TestClient> {
        TestClient::connect(&self.url()).await
    }

    /// Poll until `condition` holds or `timeout` elapses
    pub async fn wait_for<F>(&self, what: &str, timeout: Duration, mut condition: F) -> HarnessResult<()>
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !condition(self) {
            if tokio::time::Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!("waiting for {}", what)));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Stop the server
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

/// WebSocket client speaking the signaling protocol
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to a signaling server
    pub async fn connect(url: &str) -> HarnessResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| HarnessError::ConnectionError(e.to_string()))?;
        Ok(Self { ws })
    }

    /// Send a raw text frame
    pub async fn send_text(&mut self, text: &str) -> HarnessResult<()> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| HarnessError::ConnectionError(e.to_string()))
    }

    /// Send a JSON message
    pub async fn send(&mut self, message: Value) -> HarnessResult<()> {
        self.send_text(&message.to_string()).await
    }

    /// Send an offer
    pub async fn offer(&mut self, sdp: &str) -> HarnessResult<()> {
        self.send(json!({"id": "offer", "offer": sdp})).await
    }

    /// Send a stop request
    pub async fn stop(&mut self) -> HarnessResult<()> {
        self.send(json!({"id": "stop"})).await
    }

    /// Next JSON message, or a timeout
    pub async fn recv(&mut self, timeout: Duration) -> HarnessResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .map_err(|_| HarnessError::Timeout("waiting for a message".to_string()))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| HarnessError::ValidationError(format!("bad JSON {}: {}", text, e)))
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(HarnessError::ConnectionError("connection closed".to_string()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(HarnessError::ConnectionError(e.to_string())),
            }
        }
    }

    /// Next message with the given id, skipping `ice-candidate` messages
    pub async fn expect(&mut self, id: &str) -> HarnessResult<Value> {
        loop {
            let message = self.recv(REPLY_TIMEOUT).await?;
            match message["id"].as_str() {
                Some(got) if got == id => return Ok(message),
                Some("ice-candidate") => continue,
                _ => {
                    return Err(HarnessError::ValidationError(format!(
                        "expected {}, got {}",
                        id, message
                    )))
                }
            }
        }
    }

    /// Collect every message that arrives within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(message) = self.recv(window).await {
            messages.push(message);
        }
        messages
    }

    /// Close the connection
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Messages in `messages` with the given id
pub fn with_id<'a>(messages: &'a [Value], id: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["id"] == id).collect()
}
