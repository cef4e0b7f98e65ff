//! Configuration types for the relay

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration for the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the signaling WebSocket server binds to
    pub listen_addr: String,

    /// Kurento Media Server JSON-RPC URL (ws:// or wss://)
    pub kms_url: String,

    /// Where session media comes from
    pub source: SourceConfig,

    /// Recorder settings (recording is optional per deployment)
    pub recording: RecordingConfig,

    /// SDES keys for secure RTP sources (required when a client asks for secure transport)
    pub srtp: Option<SrtpConfig>,

    /// Bitrate and bandwidth limits applied to every created endpoint
    pub bitrate: BitrateConfig,

    /// Maximum number of concurrent sessions (0 = unlimited)
    pub max_sessions: usize,

    /// Timeout for a single media engine request in milliseconds (default: 10000)
    pub request_timeout_ms: u64,

    /// Consecutive outbound send failures before a connection is treated as closed
    pub max_send_failures: u32,
}

/// Media source selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Play a file or network stream (file://, http://, rtsp://)
    Player {
        /// Media URI handed to the player endpoint
        uri: String,
    },
    /// Receive plain or SRTP packets from a third-party RTP sender
    Rtp(RtpSenderProfile),
}

/// Highest usable RTP port; RTCP goes to the next port up
pub const MAX_RTP_PORT: u16 = 65534;

/// Description of the external RTP sender feeding an RTP source
///
/// Used to build the sender-side SDP offer; the engine's answer tells the
/// sender where to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpSenderProfile {
    /// Sender IP address
    pub sender_ip: String,
    /// Sender audio RTP port
    pub audio_port: u16,
    /// Sender video RTP port
    pub video_port: u16,
    /// Sender audio SSRC
    pub audio_ssrc: u32,
    /// Sender video SSRC
    pub video_ssrc: u32,
    /// RTCP CNAME announced by the sender
    pub cname: String,
    /// Video codec name as it appears in `a=rtpmap` (H264, VP8)
    pub video_codec: String,
    /// Let the engine discover the sender address from incoming packets (COMEDIA)
    pub use_comedia: bool,
    /// Include an Opus audio stream (ignored for SRTP, which is video only)
    pub with_audio: bool,
}

/// Recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Attach a recorder to every session
    pub enabled: bool,
    /// URI prefix recordings are written under (e.g. `file:///tmp/`)
    pub base_uri: String,
    /// Container profile
    pub media_profile: MediaProfile,
}

/// Recording container profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaProfile {
    /// MP4 container
    Mp4,
    /// WebM container
    Webm,
}

impl MediaProfile {
    /// Profile name understood by the media server
    pub fn as_kms(&self) -> &'static str {
        match self {
            MediaProfile::Mp4 => "MP4",
            MediaProfile::Webm => "WEBM",
        }
    }

    /// File extension for recordings in this profile
    pub fn extension(&self) -> &'static str {
        match self {
            MediaProfile::Mp4 => "mp4",
            MediaProfile::Webm => "webm",
        }
    }
}

/// SDES key material for SRTP sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrtpConfig {
    /// Cipher suite shared by sender and engine
    pub crypto_suite: CryptoSuite,
    /// Master key the engine uses to encrypt its own SRTP/SRTCP (plain ASCII)
    pub engine_key: String,
    /// Master key the sender encrypts with (plain ASCII, sent base64 in `a=crypto`)
    pub sender_key: String,
}

/// SRTP cipher suites supported by the media server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoSuite {
    /// AES-128 counter mode, 80-bit auth tag
    Aes128CmHmacSha1_80,
    /// AES-128 counter mode, 32-bit auth tag
    Aes128CmHmacSha1_32,
    /// AES-256 counter mode, 80-bit auth tag
    Aes256CmHmacSha1_80,
    /// AES-256 counter mode, 32-bit auth tag
    Aes256CmHmacSha1_32,
}

impl CryptoSuite {
    /// Suite name in the media server's object model
    pub fn as_kms(&self) -> &'static str {
        match self {
            CryptoSuite::Aes128CmHmacSha1_80 => "AES_128_CM_HMAC_SHA1_80",
            CryptoSuite::Aes128CmHmacSha1_32 => "AES_128_CM_HMAC_SHA1_32",
            CryptoSuite::Aes256CmHmacSha1_80 => "AES_256_CM_HMAC_SHA1_80",
            CryptoSuite::Aes256CmHmacSha1_32 => "AES_256_CM_HMAC_SHA1_32",
        }
    }

    /// Suite name as written in an SDP `a=crypto` attribute (RFC 4568)
    pub fn sdp_name(&self) -> &'static str {
        match self {
            CryptoSuite::Aes128CmHmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            CryptoSuite::Aes128CmHmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            CryptoSuite::Aes256CmHmacSha1_80 => "AES_256_CM_HMAC_SHA1_80",
            CryptoSuite::Aes256CmHmacSha1_32 => "AES_256_CM_HMAC_SHA1_32",
        }
    }

    /// Master key plus salt length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CryptoSuite::Aes128CmHmacSha1_80 | CryptoSuite::Aes128CmHmacSha1_32 => 30,
            CryptoSuite::Aes256CmHmacSha1_80 | CryptoSuite::Aes256CmHmacSha1_32 => 46,
        }
    }
}

/// Bitrate and bandwidth limits
///
/// `None` leaves the media server default in place; `Some(0)` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    /// Minimum output bitrate in bps
    pub min_output_bitrate: Option<u32>,
    /// Maximum output bitrate in bps
    pub max_output_bitrate: Option<u32>,
    /// Maximum audio receive bandwidth in kbps (WebRTC sink only)
    pub max_audio_recv_bandwidth: Option<u32>,
    /// Minimum video receive bandwidth in kbps (WebRTC sink only)
    pub min_video_recv_bandwidth: Option<u32>,
    /// Maximum video receive bandwidth in kbps (WebRTC sink only)
    pub max_video_recv_bandwidth: Option<u32>,
    /// Minimum video send bandwidth in kbps (WebRTC sink only)
    pub min_video_send_bandwidth: Option<u32>,
    /// Maximum video send bandwidth in kbps (WebRTC sink only)
    pub max_video_send_bandwidth: Option<u32>,
}

impl BitrateConfig {
    /// Limits that apply to any media element (output bitrate only)
    pub fn output_only(&self) -> BitrateConfig {
        BitrateConfig {
            min_output_bitrate: self.min_output_bitrate,
            max_output_bitrate: self.max_output_bitrate,
            max_audio_recv_bandwidth: None,
            min_video_recv_bandwidth: None,
            max_video_recv_bandwidth: None,
            min_video_send_bandwidth: None,
            max_video_send_bandwidth: None,
        }
    }

    /// Setter operations and their values, in application order
    pub fn operations(&self) -> Vec<(&'static str, &'static str, u32)> {
        [
            ("setMinOutputBitrate", "minOutputBitrate", self.min_output_bitrate),
            ("setMaxOutputBitrate", "maxOutputBitrate", self.max_output_bitrate),
            ("setMaxAudioRecvBandwidth", "maxAudioRecvBandwidth", self.max_audio_recv_bandwidth),
            ("setMinVideoRecvBandwidth", "minVideoRecvBandwidth", self.min_video_recv_bandwidth),
            ("setMaxVideoRecvBandwidth", "maxVideoRecvBandwidth", self.max_video_recv_bandwidth),
            ("setMinVideoSendBandwidth", "minVideoSendBandwidth", self.min_video_send_bandwidth),
            ("setMaxVideoSendBandwidth", "maxVideoSendBandwidth", self.max_video_send_bandwidth),
        ]
        .into_iter()
        .filter_map(|(op, param, value)| value.map(|v| (op, param, v)))
        .collect()
    }

    /// True when no limit is configured
    pub fn is_empty(&self) -> bool {
        self.operations().is_empty()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            kms_url: "ws://localhost:8888/kurento".to_string(),
            source: SourceConfig::default(),
            recording: RecordingConfig::default(),
            srtp: None,
            bitrate: BitrateConfig::default(),
            max_sessions: 0,
            request_timeout_ms: 10_000,
            max_send_failures: 3,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Player {
            uri: "rtsp://127.0.0.1:8554/live".to_string(),
        }
    }
}

impl Default for RtpSenderProfile {
    fn default() -> Self {
        Self {
            sender_ip: "127.0.0.1".to_string(),
            audio_port: 5006,
            video_port: 5004,
            audio_ssrc: 445566,
            video_ssrc: 112233,
            cname: "user@example.com".to_string(),
            video_codec: "H264".to_string(),
            use_comedia: false,
            with_audio: true,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_uri: "file:///tmp/".to_string(),
            media_profile: MediaProfile::Mp4,
        }
    }
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            min_output_bitrate: Some(300_000),
            max_output_bitrate: Some(0),
            max_audio_recv_bandwidth: Some(0),
            min_video_recv_bandwidth: Some(300_000),
            max_video_recv_bandwidth: Some(0),
            min_video_send_bandwidth: Some(300_000),
            max_video_send_bandwidth: Some(0),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        use crate::Error;

        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: RelayConfig = if is_json {
            serde_json::from_str(&text).map_err(|e| {
                Error::InvalidConfig(format!("{}: {}", path.display(), e))
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|e| {
                Error::InvalidConfig(format!("{}: {}", path.display(), e))
            })?
        };

        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `listen_addr` is not a socket address
    /// - `kms_url` is not a WebSocket URL
    /// - the player URI is empty, or an RTP sender port is zero
    /// - an SRTP key does not match its cipher suite length
    /// - `request_timeout_ms` or `max_send_failures` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            Error::InvalidConfig(format!(
                "listen_addr must be host:port, got {} ({})",
                self.listen_addr, e
            ))
        })?;

        if !self.kms_url.starts_with("ws://") && !self.kms_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "kms_url must start with ws:// or wss://, got {}",
                self.kms_url
            )));
        }

        match &self.source {
            SourceConfig::Player { uri } if uri.trim().is_empty() => {
                return Err(Error::InvalidConfig(
                    "player source requires a non-empty uri".to_string(),
                ));
            }
            SourceConfig::Rtp(profile) => {
                if profile.video_port == 0 || (profile.with_audio && profile.audio_port == 0) {
                    return Err(Error::InvalidConfig(
                        "RTP sender ports must be non-zero".to_string(),
                    ));
                }
                if profile.video_port > MAX_RTP_PORT
                    || (profile.with_audio && profile.audio_port > MAX_RTP_PORT)
                {
                    return Err(Error::InvalidConfig(format!(
                        "RTP sender ports must be at most {} to leave room for RTCP",
                        MAX_RTP_PORT
                    )));
                }
                if profile.video_codec.trim().is_empty() {
                    return Err(Error::InvalidConfig(
                        "RTP sender video_codec must not be empty".to_string(),
                    ));
                }
            }
            _ => {}
        }

        if let Some(srtp) = &self.srtp {
            let expected = srtp.crypto_suite.key_len();
            for (name, key) in [("engine_key", &srtp.engine_key), ("sender_key", &srtp.sender_key)] {
                if key.len() != expected {
                    return Err(Error::InvalidConfig(format!(
                        "srtp.{} must be {} bytes for {}, got {}",
                        name,
                        expected,
                        srtp.crypto_suite.as_kms(),
                        key.len()
                    )));
                }
            }
        }

        if self.recording.enabled && self.recording.base_uri.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "recording.base_uri must not be empty when recording is enabled".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_send_failures == 0 {
            return Err(Error::InvalidConfig(
                "max_send_failures must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Engine request timeout as a Duration
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn srtp_128() -> SrtpConfig {
        SrtpConfig {
            crypto_suite: CryptoSuite::Aes128CmHmacSha1_80,
            engine_key: "4321ZYXWVUTSRQPONMLKJIHGFEDCBA".to_string(),
            sender_key: "ABCDEFGHIJKLMNOPQRSTUVWXYZ1234".to_string(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_kms_url() {
        let config = RelayConfig {
            kms_url: "http://localhost:8888/kurento".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_invalid_listen_addr() {
        let config = RelayConfig {
            listen_addr: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_srtp_key_length_checked() {
        let mut srtp = srtp_128();
        let config = RelayConfig {
            srtp: Some(srtp.clone()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        srtp.crypto_suite = CryptoSuite::Aes256CmHmacSha1_80;
        let config = RelayConfig {
            srtp: Some(srtp),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("46 bytes"));
    }

    #[test]
    fn test_rtp_port_must_leave_room_for_rtcp() {
        let source = |video_port, audio_port| {
            SourceConfig::Rtp(RtpSenderProfile {
                video_port,
                audio_port,
                ..Default::default()
            })
        };

        let config = RelayConfig {
            source: source(65534, 5006),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = RelayConfig {
            source: source(65535, 5006),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("65534"));

        let config = RelayConfig {
            source: source(5004, 65535),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RelayConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bitrate_operations() {
        let bitrate = BitrateConfig::default();
        assert_eq!(bitrate.operations().len(), 7);
        assert_eq!(bitrate.output_only().operations().len(), 2);
        assert_eq!(
            bitrate.operations()[0],
            ("setMinOutputBitrate", "minOutputBitrate", 300_000)
        );

        let none = BitrateConfig {
            min_output_bitrate: None,
            max_output_bitrate: None,
            ..bitrate.output_only()
        };
        assert!(none.is_empty());
    }

    #[test]
    fn test_crypto_suite_names() {
        assert_eq!(CryptoSuite::Aes128CmHmacSha1_80.as_kms(), "AES_128_CM_HMAC_SHA1_80");
        assert_eq!(CryptoSuite::Aes128CmHmacSha1_80.sdp_name(), "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(CryptoSuite::Aes256CmHmacSha1_32.key_len(), 46);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "kms_url: ws://kms.internal:8888/kurento\nmax_sessions: 4\nsource:\n  kind: rtp\n  sender_ip: 10.0.0.5\n  use_comedia: true\nrecording:\n  enabled: false\n"
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.kms_url, "ws://kms.internal:8888/kurento");
        assert_eq!(config.max_sessions, 4);
        assert!(!config.recording.enabled);
        match &config.source {
            SourceConfig::Rtp(profile) => {
                assert_eq!(profile.sender_ip, "10.0.0.5");
                assert!(profile.use_comedia);
                assert_eq!(profile.video_port, 5004);
            }
            other => panic!("unexpected source: {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"source": {{"kind": "player", "uri": "file:///media/clip.mp4"}}, "recording": {{"media_profile": "webm"}}}}"#
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.source,
            SourceConfig::Player {
                uri: "file:///media/clip.mp4".to_string()
            }
        );
        assert_eq!(config.recording.media_profile, MediaProfile::Webm);
        assert_eq!(config.recording.media_profile.extension(), "webm");
    }
}
