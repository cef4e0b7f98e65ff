//! Media engine client abstraction
//!
//! The relay never touches media itself. Pipelines and endpoints live inside an
//! external media server; this module defines the narrow slice of its object
//! model the session lifecycle needs, plus two implementations:
//!
//! - [`KurentoClient`]: JSON-RPC 2.0 over WebSocket to Kurento Media Server
//! - [`LoopbackEngine`]: in-process stand-in used by tests and demo runs
//!
//! Event listeners are registered through a single [`MediaEngine::subscribe`]
//! call per object, tagged by [`EngineEventKind`].

mod kurento;
mod loopback;
pub mod protocol;

pub use kurento::KurentoClient;
pub use loopback::{EngineCall, LoopbackEngine};

use crate::config::{BitrateConfig, CryptoSuite, MediaProfile};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Handle to a media pipeline owned by the media server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub String);

/// Handle to an endpoint (media element) living inside a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of endpoint to create
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointSpec {
    /// Plays a file or network stream
    Player {
        /// Media URI
        uri: String,
    },
    /// Receives RTP from a third-party sender
    Rtp {
        /// SDES crypto; `None` for plain RTP
        crypto: Option<SdesCrypto>,
    },
    /// Writes media to storage
    Recorder {
        /// Destination URI
        uri: String,
        /// Container profile
        profile: MediaProfile,
    },
    /// Relays media to a browser over WebRTC
    WebRtc,
}

impl EndpointSpec {
    /// Media server type name for this endpoint
    pub fn type_name(&self) -> &'static str {
        match self {
            EndpointSpec::Player { .. } => "PlayerEndpoint",
            EndpointSpec::Rtp { .. } => "RtpEndpoint",
            EndpointSpec::Recorder { .. } => "RecorderEndpoint",
            EndpointSpec::WebRtc => "WebRtcEndpoint",
        }
    }
}

/// SDES key material handed to an RTP endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct SdesCrypto {
    /// Cipher suite
    pub suite: CryptoSuite,
    /// Master key (plain ASCII)
    pub key: String,
}

/// Media type filter for element connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Video only
    Video,
}

impl MediaKind {
    /// Media server enum value
    pub fn as_kms(&self) -> &'static str {
        match self {
            MediaKind::Audio => "AUDIO",
            MediaKind::Video => "VIDEO",
        }
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line (`candidate:...`)
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Event categories the media server can notify about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEventKind {
    /// Element-level error
    Error,
    /// Media started/stopped flowing into an element
    MediaFlowInStateChange,
    /// Media started/stopped flowing out of an element
    MediaFlowOutStateChange,
    /// Media connectivity of an endpoint changed
    MediaStateChanged,
    /// Transport connectivity of an endpoint changed
    ConnectionStateChanged,
    /// Element started/stopped transcoding
    MediaTranscodingStateChange,
    /// Element got connected to another element
    ElementConnected,
    /// Local ICE candidate found (trickle ICE)
    IceCandidateFound,
    /// ICE component changed state
    IceComponentStateChange,
    /// ICE candidate gathering finished
    IceGatheringDone,
    /// ICE selected a new candidate pair
    NewCandidatePairSelected,
    /// Player reached the end of its stream
    EndOfStream,
    /// Recorder started recording
    Recording,
    /// Recorder paused
    Paused,
    /// Recorder stopped
    Stopped,
    /// SRTP key is about to expire
    OnKeySoftLimit,
}

/// Every event kind, in a stable order
const ALL_KINDS: &[EngineEventKind] = &[
    EngineEventKind::Error,
    EngineEventKind::MediaFlowInStateChange,
    EngineEventKind::MediaFlowOutStateChange,
    EngineEventKind::MediaStateChanged,
    EngineEventKind::ConnectionStateChanged,
    EngineEventKind::MediaTranscodingStateChange,
    EngineEventKind::ElementConnected,
    EngineEventKind::IceCandidateFound,
    EngineEventKind::IceComponentStateChange,
    EngineEventKind::IceGatheringDone,
    EngineEventKind::NewCandidatePairSelected,
    EngineEventKind::EndOfStream,
    EngineEventKind::Recording,
    EngineEventKind::Paused,
    EngineEventKind::Stopped,
    EngineEventKind::OnKeySoftLimit,
];

impl EngineEventKind {
    /// Event type name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineEventKind::Error => "Error",
            EngineEventKind::MediaFlowInStateChange => "MediaFlowInStateChange",
            EngineEventKind::MediaFlowOutStateChange => "MediaFlowOutStateChange",
            EngineEventKind::MediaStateChanged => "MediaStateChanged",
            EngineEventKind::ConnectionStateChanged => "ConnectionStateChanged",
            EngineEventKind::MediaTranscodingStateChange => "MediaTranscodingStateChange",
            EngineEventKind::ElementConnected => "ElementConnected",
            EngineEventKind::IceCandidateFound => "IceCandidateFound",
            EngineEventKind::IceComponentStateChange => "IceComponentStateChange",
            EngineEventKind::IceGatheringDone => "IceGatheringDone",
            EngineEventKind::NewCandidatePairSelected => "NewCandidatePairSelected",
            EngineEventKind::EndOfStream => "EndOfStream",
            EngineEventKind::Recording => "Recording",
            EngineEventKind::Paused => "Paused",
            EngineEventKind::Stopped => "Stopped",
            EngineEventKind::OnKeySoftLimit => "OnKeySoftLimit",
        }
    }

    /// Parse a wire event type name
    pub fn parse(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.as_str() == name)
    }

    /// Event kinds worth subscribing to for a given endpoint type
    pub fn for_endpoint(spec: &EndpointSpec) -> &'static [EngineEventKind] {
        use EngineEventKind::*;
        match spec {
            EndpointSpec::Player { .. } => &[
                Error,
                MediaFlowInStateChange,
                MediaFlowOutStateChange,
                ElementConnected,
                MediaTranscodingStateChange,
                EndOfStream,
            ],
            EndpointSpec::Rtp { .. } => &[
                Error,
                MediaFlowInStateChange,
                MediaFlowOutStateChange,
                ConnectionStateChanged,
                MediaStateChanged,
                MediaTranscodingStateChange,
                OnKeySoftLimit,
            ],
            EndpointSpec::Recorder { .. } => &[
                Error,
                Recording,
                Paused,
                Stopped,
                MediaTranscodingStateChange,
            ],
            EndpointSpec::WebRtc => &[
                Error,
                MediaFlowInStateChange,
                MediaFlowOutStateChange,
                ConnectionStateChanged,
                MediaStateChanged,
                MediaTranscodingStateChange,
                IceCandidateFound,
                IceComponentStateChange,
                IceGatheringDone,
                NewCandidatePairSelected,
            ],
        }
    }
}

impl fmt::Display for EngineEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous notification from the media server
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    /// Object the subscription was made on
    pub object: String,
    /// Event category
    pub kind: EngineEventKind,
    /// Raw event payload
    pub data: Value,
}

impl EngineEvent {
    /// Candidate carried by an `IceCandidateFound` event
    pub fn candidate(&self) -> Option<IceCandidate> {
        if self.kind != EngineEventKind::IceCandidateFound {
            return None;
        }
        serde_json::from_value(self.data.get("candidate")?.clone()).ok()
    }

    /// Payload field as a string, for log records
    pub fn field(&self, name: &str) -> Option<String> {
        self.data.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Where a subscription delivers its events
///
/// Unbounded so the engine's reader task never blocks on a slow connection.
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// Client for an external media server
///
/// Every method is one RPC round trip. Endpoint handles are children of the
/// pipeline they were created in; releasing the pipeline releases them all.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocate a new media pipeline
    async fn create_pipeline(&self) -> Result<PipelineId>;

    /// Create an endpoint inside a pipeline
    async fn create_endpoint(&self, pipeline: &PipelineId, spec: &EndpointSpec)
        -> Result<EndpointId>;

    /// Deliver events of the given kinds raised by `endpoint` to `sink`
    async fn subscribe(
        &self,
        endpoint: &EndpointId,
        kinds: &[EngineEventKind],
        sink: EventSink,
    ) -> Result<()>;

    /// Connect `source` output to `sink` input, optionally for one media type
    async fn connect(
        &self,
        source: &EndpointId,
        sink: &EndpointId,
        media: Option<MediaKind>,
    ) -> Result<()>;

    /// Submit an SDP offer and return the negotiated answer
    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> Result<String>;

    /// Add a remote ICE candidate to a WebRTC endpoint
    async fn add_ice_candidate(&self, endpoint: &EndpointId, candidate: &IceCandidate)
        -> Result<()>;

    /// Start ICE candidate gathering on a WebRTC endpoint
    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()>;

    /// Apply bitrate/bandwidth limits to an endpoint
    async fn set_bitrate_limits(&self, endpoint: &EndpointId, limits: &BitrateConfig)
        -> Result<()>;

    /// Start a player endpoint
    async fn play(&self, endpoint: &EndpointId) -> Result<()>;

    /// Start a recorder endpoint
    async fn record(&self, endpoint: &EndpointId) -> Result<()>;

    /// Stop a recorder endpoint
    async fn stop_recording(&self, endpoint: &EndpointId) -> Result<()>;

    /// Release a pipeline and every endpoint inside it
    async fn release(&self, pipeline: &PipelineId) -> Result<()>;
}
