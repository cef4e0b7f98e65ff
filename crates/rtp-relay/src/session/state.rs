//! Session state machine
//!
//! `Created -> Negotiating -> Active -> Stopped`. `Stopped` is terminal; any
//! state may jump straight to it through a release.

use crate::engine::{EndpointId, EventSink, IceCandidate, PipelineId};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Kind of media source feeding a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Player endpoint reading a URI
    Player,
    /// RTP endpoint receiving from an external sender
    Rtp {
        /// SRTP negotiated
        secure: bool,
    },
}

/// Source endpoint of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEndpoint {
    /// Endpoint handle
    pub id: EndpointId,
    /// What kind of source it is
    pub kind: SourceKind,
}

/// Session state, carrying the handles valid in that state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Pipeline allocated, nothing attached yet
    Created {
        /// Session pipeline
        pipeline: PipelineId,
    },
    /// Endpoints being attached and the offer negotiated
    Negotiating {
        /// Session pipeline
        pipeline: PipelineId,
        /// Source, once attached
        source: Option<SourceEndpoint>,
        /// Recorder, once attached
        recorder: Option<EndpointId>,
        /// WebRTC sink, once the offer was answered
        sink: Option<EndpointId>,
        /// Source connected to sink and recorder
        wired: bool,
    },
    /// Media flowing to the peer
    Active {
        /// Session pipeline
        pipeline: PipelineId,
        /// Source
        source: SourceEndpoint,
        /// Recorder, if recording is configured
        recorder: Option<EndpointId>,
        /// WebRTC sink
        sink: EndpointId,
        /// Recorder currently running
        recording: bool,
    },
    /// Released; terminal
    Stopped,
}

/// State discriminant, for logs and checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// See [`SessionState::Created`]
    Created,
    /// See [`SessionState::Negotiating`]
    Negotiating,
    /// See [`SessionState::Active`]
    Active,
    /// See [`SessionState::Stopped`]
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Created => "CREATED",
            SessionPhase::Negotiating => "NEGOTIATING",
            SessionPhase::Active => "ACTIVE",
            SessionPhase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Created { .. } => SessionPhase::Created,
            SessionState::Negotiating { .. } => SessionPhase::Negotiating,
            SessionState::Active { .. } => SessionPhase::Active,
            SessionState::Stopped => SessionPhase::Stopped,
        }
    }

    /// Pipeline, unless stopped
    pub fn pipeline(&self) -> Option<&PipelineId> {
        match self {
            SessionState::Created { pipeline }
            | SessionState::Negotiating { pipeline, .. }
            | SessionState::Active { pipeline, .. } => Some(pipeline),
            SessionState::Stopped => None,
        }
    }

    /// Source endpoint, once attached
    pub fn source(&self) -> Option<&SourceEndpoint> {
        match self {
            SessionState::Negotiating { source, .. } => source.as_ref(),
            SessionState::Active { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Recorder endpoint, once attached
    pub fn recorder(&self) -> Option<&EndpointId> {
        match self {
            SessionState::Negotiating { recorder, .. } | SessionState::Active { recorder, .. } => {
                recorder.as_ref()
            }
            _ => None,
        }
    }

    /// WebRTC sink endpoint, once attached
    pub fn sink(&self) -> Option<&EndpointId> {
        match self {
            SessionState::Negotiating { sink, .. } => sink.as_ref(),
            SessionState::Active { sink, .. } => Some(sink),
            _ => None,
        }
    }
}

/// A relay session bound to one signaling connection
pub struct Session {
    /// Connection id the session belongs to
    id: String,

    /// Current state
    state: SessionState,

    /// Where engine events for this session's endpoints are delivered
    events: EventSink,

    /// Remote candidates received before the session went active
    pub(crate) pending_candidates: VecDeque<IceCandidate>,

    created_at: Instant,
}

impl Session {
    /// Create a session around a freshly allocated pipeline
    pub fn new(id: impl Into<String>, pipeline: PipelineId, events: EventSink) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Created { pipeline },
            events,
            pending_candidates: VecDeque::new(),
            created_at: Instant::now(),
        }
    }

    /// Connection id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Event sink for subscriptions made on behalf of this session
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Number of candidates waiting for the session to go active
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Time since the session was created
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Move to `next`
    ///
    /// Nothing leaves `Stopped`.
    pub(crate) fn transition(&mut self, next: SessionState) -> Result<()> {
        let from = self.state.phase();
        let to = next.phase();

        if from == SessionPhase::Stopped && to != SessionPhase::Stopped {
            return Err(Error::InvalidState(format!(
                "session {} is stopped, cannot move to {}",
                self.id, to
            )));
        }

        if from != to {
            debug!("Session {} state transition: {} -> {}", self.id, from, to);
        }
        self.state = next;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}
