//! RTP relay with WebSocket signaling
//!
//! Relays an external media source (an RTSP/HTTP/file URI played by the media
//! server, or a raw RTP/SRTP sender) to browser peers over WebRTC, optionally
//! recording each session. Media never passes through this process: pipelines
//! and endpoints live inside Kurento Media Server, driven over its JSON-RPC
//! WebSocket API.
//!
//! # Features
//!
//! - **Signaling server**: one session per WebSocket connection
//! - **Sources**: `PlayerEndpoint` or `RtpEndpoint` with optional SDES-SRTP
//! - **Recording**: per-session `RecorderEndpoint` (MP4 or WebM)
//! - **Trickle ICE**: remote candidates buffered until the sink is live
//! - **Deterministic teardown**: every pipeline released exactly once
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Browser peer                                          │
//! │  ↓ (JSON over WebSocket)                               │
//! │  SignalingServer                                       │
//! │  ├─ per-connection reader / writer / processing tasks │
//! │  ├─ SignalingHandler (messages, engine events)        │
//! │  ├─ SessionRegistry (connection id -> session)        │
//! │  └─ LifecycleController (CREATED..STOPPED)            │
//! │     ↓                                                   │
//! │  MediaEngine (KurentoClient | LoopbackEngine)          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rtp_relay::{KurentoClient, RelayConfig, SignalingServer};
//! use std::sync::Arc;
//!
//! let config = RelayConfig::from_file("relay.yaml")?;
//! let engine = KurentoClient::connect(&config.kms_url, config.request_timeout()).await?;
//! let server = SignalingServer::bind(config, Arc::new(engine)).await?;
//! let handle = server.start()?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod sdp;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use config::{RecordingConfig, RelayConfig, SourceConfig, SrtpConfig};
pub use engine::{KurentoClient, LoopbackEngine, MediaEngine};
pub use error::{Error, Result};
pub use lifecycle::LifecycleController;
pub use session::{SessionPhase, SessionRegistry};
pub use signaling::{SignalingServer, SignalingServerHandle};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
