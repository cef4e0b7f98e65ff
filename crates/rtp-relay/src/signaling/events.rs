//! Engine event translation
//!
//! Every engine event ends up either as a message to the client or as a log
//! record. Nothing here calls back into the lifecycle controller; teardown is
//! requested by returning the matching [`EventAction`].

use super::protocol::ServerMessage;
use crate::engine::{EngineEvent, EngineEventKind};
use tracing::{debug, info, warn};

/// What the connection should do with an engine event
#[derive(Debug, Clone, PartialEq)]
pub enum EventAction {
    /// Forward a message to the client
    Notify(ServerMessage),
    /// Playback finished: send `end-playback` and tear down
    EndPlayback,
    /// Unrecoverable engine error: report it and tear down
    Fail(String),
    /// Nothing to tell the client
    Log,
}

/// Decide how an engine event is surfaced
pub fn translate(event: &EngineEvent) -> EventAction {
    match event.kind {
        EngineEventKind::IceCandidateFound => match event.candidate() {
            Some(candidate) => EventAction::Notify(ServerMessage::IceCandidate(candidate)),
            None => EventAction::Log,
        },
        EngineEventKind::EndOfStream => EventAction::EndPlayback,
        EngineEventKind::Error => {
            let description = event
                .field("description")
                .unwrap_or_else(|| "unknown error".to_string());
            let message = match event.field("errorCode") {
                Some(code) => format!("Media engine error: {} (code {})", description, code),
                None => format!("Media engine error: {}", description),
            };
            EventAction::Fail(message)
        }
        _ => EventAction::Log,
    }
}

/// Write an engine event to the log
pub fn log_event(conn_id: &str, event: &EngineEvent) {
    let source = event.field("source").unwrap_or_else(|| event.object.clone());

    match event.kind {
        EngineEventKind::Error => warn!(
            "[{}] {} on {}: {}",
            conn_id, event.kind, source, event.data
        ),
        EngineEventKind::MediaFlowInStateChange | EngineEventKind::MediaFlowOutStateChange => {
            info!(
                "[{}] {} on {}: state {}, media {}, pad {}",
                conn_id,
                event.kind,
                source,
                event.field("state").unwrap_or_default(),
                event.field("mediaType").unwrap_or_default(),
                event.field("padName").unwrap_or_default()
            )
        }
        EngineEventKind::MediaStateChanged | EngineEventKind::ConnectionStateChanged => info!(
            "[{}] {} on {}: {} -> {}",
            conn_id,
            event.kind,
            source,
            event.field("oldState").unwrap_or_default(),
            event.field("newState").unwrap_or_default()
        ),
        EngineEventKind::IceComponentStateChange => info!(
            "[{}] {} on {}: stream {}, component {}, state {}",
            conn_id,
            event.kind,
            source,
            event.field("streamId").unwrap_or_default(),
            event.field("componentId").unwrap_or_default(),
            event.field("state").unwrap_or_default()
        ),
        EngineEventKind::IceCandidateFound | EngineEventKind::IceGatheringDone => {
            debug!("[{}] {} on {}", conn_id, event.kind, source)
        }
        EngineEventKind::OnKeySoftLimit => warn!(
            "[{}] {} on {}: SRTP key about to expire, media {}",
            conn_id,
            event.kind,
            source,
            event.field("mediaType").unwrap_or_default()
        ),
        _ => info!("[{}] {} on {}: {}", conn_id, event.kind, source, event.data),
    }
}
