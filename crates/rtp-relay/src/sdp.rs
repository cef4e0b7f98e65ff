//! Sender-side SDP for RTP sources
//!
//! A third-party RTP sender (e.g. a GStreamer pipeline) does not speak SDP, so
//! the relay writes an offer on its behalf from the configured
//! [`RtpSenderProfile`], submits it to the RTP endpoint and reads back where
//! the engine expects packets.

use crate::config::{RtpSenderProfile, SrtpConfig};
use crate::{Error, Result};
use base64::Engine as _;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// RTP payload type used for Opus audio
const AUDIO_PAYLOAD: u8 = 96;

/// RTP payload type used for video
const VIDEO_PAYLOAD: u8 = 103;

/// Discard port, announced when the engine should learn the sender address
const DISCARD_PORT: u16 = 9;

/// Whether the offer carries an audio stream
///
/// SRTP sessions are video only.
pub fn offers_audio(profile: &RtpSenderProfile, secure: bool) -> bool {
    profile.with_audio && !secure
}

/// Build the SDP offer describing the external RTP sender
///
/// With `srtp` set the video stream uses `RTP/SAVPF` and carries an
/// `a=crypto` attribute holding the sender key.
pub fn build_sender_offer(profile: &RtpSenderProfile, srtp: Option<&SrtpConfig>) -> String {
    let (audio_port, video_port, comedia_attr) = if profile.use_comedia {
        (DISCARD_PORT, DISCARD_PORT, "a=direction:active\r\n")
    } else {
        (profile.audio_port, profile.video_port, "")
    };

    let mut offer = String::new();
    let _ = write!(
        offer,
        "v=0\r\no=- 0 0 IN IP4 {ip}\r\ns=rtp-relay sender\r\nc=IN IP4 {ip}\r\nt=0 0\r\n",
        ip = profile.sender_ip
    );

    if offers_audio(profile, srtp.is_some()) {
        let _ = write!(
            offer,
            "m=audio {port} RTP/AVPF {pt}\r\na=rtpmap:{pt} opus/48000/2\r\na=sendonly\r\n{comedia}a=ssrc:{ssrc} cname:{cname}\r\n",
            port = audio_port,
            pt = AUDIO_PAYLOAD,
            comedia = comedia_attr,
            ssrc = profile.audio_ssrc,
            cname = profile.cname
        );
    }

    let (protocol, crypto_attr) = match srtp {
        Some(srtp) => (
            "RTP/SAVPF",
            format!(
                "a=crypto:2 {} inline:{}|2^31|1:1\r\n",
                srtp.crypto_suite.sdp_name(),
                base64::engine::general_purpose::STANDARD.encode(&srtp.sender_key)
            ),
        ),
        None => ("RTP/AVPF", String::new()),
    };

    let _ = write!(
        offer,
        "m=video {port} {proto} {pt}\r\n{crypto}a=rtpmap:{pt} {codec}/90000\r\na=rtcp-fb:{pt} goog-remb\r\na=sendonly\r\n{comedia}a=ssrc:{ssrc} cname:{cname}\r\n",
        port = video_port,
        proto = protocol,
        pt = VIDEO_PAYLOAD,
        crypto = crypto_attr,
        codec = profile.video_codec,
        comedia = comedia_attr,
        ssrc = profile.video_ssrc,
        cname = profile.cname
    );

    offer
}

/// Where the engine expects the sender's packets, read from its SDP answer
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Engine audio RTP port (`None` when no audio was offered)
    pub engine_audio_port: Option<u16>,
    /// Engine video RTP port
    pub engine_video_port: u16,
    /// SSRC the engine uses for its own video stream
    pub engine_video_ssrc: Option<u32>,
    /// Engine IP address
    pub engine_ip: String,
    /// Engine accepted COMEDIA port discovery
    pub comedia: bool,
    /// SRTP in use
    pub secure: bool,
    /// Sender side of the negotiation
    pub sender: RtpSenderProfile,
}

impl ConnectionInfo {
    /// Parse the engine's answer to [`build_sender_offer`]
    ///
    /// # Errors
    ///
    /// `NegotiationFailed` if a port for an offered stream or the connection
    /// address is missing.
    pub fn parse(answer: &str, sender: &RtpSenderProfile, secure: bool) -> Result<Self> {
        let patterns = patterns();

        let engine_audio_port = if offers_audio(sender, secure) {
            Some(capture::<u16>(answer, &patterns.audio_port).ok_or_else(|| {
                Error::NegotiationFailed("SDP answer has no audio port".to_string())
            })?)
        } else {
            None
        };

        let engine_video_port = capture::<u16>(answer, &patterns.video_port).ok_or_else(|| {
            Error::NegotiationFailed("SDP answer has no video port".to_string())
        })?;

        let engine_ip = capture::<String>(answer, &patterns.engine_ip)
            .ok_or_else(|| {
                Error::NegotiationFailed("SDP answer has no IPv4 connection address".to_string())
            })?;

        Ok(Self {
            engine_audio_port,
            engine_video_port,
            engine_video_ssrc: capture::<u32>(answer, &patterns.ssrc),
            engine_ip,
            comedia: answer.contains("a=direction:passive"),
            secure,
            sender: sender.clone(),
        })
    }

    /// Human-readable summary sent to the client
    pub fn summary(&self) -> String {
        let mut text = String::from("SDP negotiation finished\n");

        if let Some(port) = self.engine_audio_port {
            let _ = writeln!(text, "* Engine listens for audio RTP at port: {}", port);
        }
        let _ = writeln!(
            text,
            "* Engine listens for video RTP at port: {}",
            self.engine_video_port
        );

        if self.secure {
            if let Some(ssrc) = self.engine_video_ssrc {
                let _ = writeln!(text, "* Engine uses video SSRC: {}", ssrc);
            }
        }
        if self.engine_audio_port.is_some() {
            let _ = writeln!(
                text,
                "* Engine expects audio SSRC from sender: {}",
                self.sender.audio_ssrc
            );
        }
        let _ = writeln!(
            text,
            "* Engine expects video SSRC from sender: {}",
            self.sender.video_ssrc
        );
        let _ = writeln!(text, "* Engine local IP address: {}", self.engine_ip);

        if self.comedia {
            text.push_str("* Engine will discover remote IP and port to send RTCP\n");
        } else {
            if self.engine_audio_port.is_some() {
                let _ = writeln!(
                    text,
                    "* Engine sends audio RTCP to: {}:{}",
                    self.sender.sender_ip,
                    rtcp_port(self.sender.audio_port)
                );
            }
            let _ = writeln!(
                text,
                "* Engine sends video RTCP to: {}:{}",
                self.sender.sender_ip,
                rtcp_port(self.sender.video_port)
            );
        }

        text
    }
}

/// RTCP port paired with an RTP port, as text
fn rtcp_port(rtp_port: u16) -> String {
    match rtp_port.checked_add(1) {
        Some(port) => port.to_string(),
        None => "unavailable".to_string(),
    }
}

struct AnswerPatterns {
    audio_port: Option<Regex>,
    video_port: Option<Regex>,
    engine_ip: Option<Regex>,
    ssrc: Option<Regex>,
}

static ANSWER_PATTERNS: OnceLock<AnswerPatterns> = OnceLock::new();

fn patterns() -> &'static AnswerPatterns {
    ANSWER_PATTERNS.get_or_init(|| AnswerPatterns {
        audio_port: compile(r"m=audio (\d+) RTP"),
        video_port: compile(r"m=video (\d+) RTP"),
        engine_ip: compile(r"c=IN IP4 ((?:[0-9]{1,3}\.){3}[0-9]{1,3})"),
        ssrc: compile(r"a=ssrc:(\d+)"),
    })
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern).ok()
}

/// First capture group of `re` in `text`, parsed
fn capture<T: std::str::FromStr>(text: &str, re: &Option<Regex>) -> Option<T> {
    re.as_ref()?.captures(text)?.get(1)?.as_str().parse().ok()
}
