//! Session lifecycle controller
//!
//! Drives one session through `Created -> Negotiating -> Active -> Stopped`
//! by issuing media engine calls. Every operation takes the session by
//! `&mut`, so callers must hold its lock; the controller itself keeps no
//! per-session state.

use crate::config::{BitrateConfig, RelayConfig, SourceConfig};
use crate::engine::{
    EndpointId, EndpointSpec, EngineEventKind, EventSink, IceCandidate, MediaEngine, MediaKind,
    PipelineId, SdesCrypto,
};
use crate::sdp::{build_sender_offer, ConnectionInfo};
use crate::session::{Session, SessionPhase, SessionState, SourceEndpoint, SourceKind};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issues media engine calls on behalf of sessions
pub struct LifecycleController {
    engine: Arc<dyn MediaEngine>,
    config: Arc<RelayConfig>,
}

impl LifecycleController {
    /// Create a controller over a media engine
    pub fn new(engine: Arc<dyn MediaEngine>, config: Arc<RelayConfig>) -> Self {
        Self { engine, config }
    }

    /// Media engine sessions are driven on
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Allocate a pipeline and wrap it in a new session
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the engine cannot allocate a pipeline.
    pub async fn create_session(&self, id: &str, events: EventSink) -> Result<Session> {
        let pipeline = self.engine.create_pipeline().await.map_err(|e| {
            Error::ResourceExhausted(format!("media pipeline unavailable: {}", e))
        })?;

        info!("[{}] Media pipeline created: {}", id, pipeline);
        Ok(Session::new(id, pipeline, events))
    }

    /// Create the configured media source
    ///
    /// For an RTP source this also negotiates with the engine on behalf of
    /// the external sender and returns where the sender must send.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` if `secure` is requested for an RTP source but no
    /// SRTP keys are configured; `NegotiationFailed` if the engine rejects or
    /// garbles the sender-side negotiation.
    pub async fn attach_source(
        &self,
        session: &mut Session,
        secure: bool,
    ) -> Result<Option<ConnectionInfo>> {
        let pipeline = begin_negotiation(session)?;
        if session.state().source().is_some() {
            return Err(Error::InvalidState(format!(
                "session {} already has a source",
                session.id()
            )));
        }

        let (spec, kind) = match &self.config.source {
            SourceConfig::Player { uri } => {
                if secure {
                    debug!(
                        "[{}] Secure transport does not apply to a player source, ignoring",
                        session.id()
                    );
                }
                (EndpointSpec::Player { uri: uri.clone() }, SourceKind::Player)
            }
            SourceConfig::Rtp(_) => {
                let crypto = if secure {
                    let srtp = self.config.srtp.as_ref().ok_or_else(|| {
                        Error::ConfigurationError(
                            "secure transport requested but no SRTP keys are configured"
                                .to_string(),
                        )
                    })?;
                    Some(SdesCrypto {
                        suite: srtp.crypto_suite,
                        key: srtp.engine_key.clone(),
                    })
                } else {
                    None
                };
                (EndpointSpec::Rtp { crypto }, SourceKind::Rtp { secure })
            }
        };

        let id = self
            .create_endpoint(session, &pipeline, &spec, &self.config.bitrate.output_only())
            .await?;

        if let SessionState::Negotiating { source, .. } = session.state_mut() {
            *source = Some(SourceEndpoint {
                id: id.clone(),
                kind,
            });
        }

        match &self.config.source {
            SourceConfig::Rtp(profile) => {
                let srtp = if secure { self.config.srtp.as_ref() } else { None };
                let offer = build_sender_offer(profile, srtp);
                debug!("[{}] Sender SDP offer:\n{}", session.id(), offer);

                let answer = self
                    .engine
                    .process_offer(&id, &offer)
                    .await
                    .map_err(|e| Error::NegotiationFailed(format!("RTP source: {}", e)))?;
                debug!("[{}] Engine SDP answer for sender:\n{}", session.id(), answer);

                let info = ConnectionInfo::parse(&answer, profile, secure)?;
                info!("[{}] {}", session.id(), info.summary());
                Ok(Some(info))
            }
            SourceConfig::Player { .. } => Ok(None),
        }
    }

    /// Recorder destination for a connection: `<base_uri><id>-<uuid>.<ext>`
    pub fn recording_destination(&self, id: &str) -> String {
        let recording = &self.config.recording;
        format!(
            "{}{}-{}.{}",
            recording.base_uri,
            id,
            uuid::Uuid::new_v4(),
            recording.media_profile.extension()
        )
    }

    /// Create a recorder writing to `destination`
    pub async fn attach_recorder(
        &self,
        session: &mut Session,
        destination: &str,
    ) -> Result<EndpointId> {
        let pipeline = begin_negotiation(session)?;
        if session.state().recorder().is_some() {
            return Err(Error::InvalidState(format!(
                "session {} already has a recorder",
                session.id()
            )));
        }

        let spec = EndpointSpec::Recorder {
            uri: destination.to_string(),
            profile: self.config.recording.media_profile,
        };
        let id = self
            .create_endpoint(session, &pipeline, &spec, &self.config.bitrate.output_only())
            .await?;
        info!("[{}] Recording to {}", session.id(), destination);

        if let SessionState::Negotiating { recorder, .. } = session.state_mut() {
            *recorder = Some(id.clone());
        }
        Ok(id)
    }

    /// Create the WebRTC sink and negotiate the peer's offer
    ///
    /// This is the one long engine round trip of the offer flow.
    ///
    /// # Errors
    ///
    /// `NegotiationFailed` if the engine rejects the offer.
    pub async fn attach_sink(&self, session: &mut Session, offer: &str) -> Result<String> {
        let pipeline = begin_negotiation(session)?;
        if session.state().sink().is_some() {
            return Err(Error::InvalidState(format!(
                "session {} already has a sink",
                session.id()
            )));
        }

        let id = self
            .create_endpoint(session, &pipeline, &EndpointSpec::WebRtc, &self.config.bitrate)
            .await?;

        if let SessionState::Negotiating { sink, .. } = session.state_mut() {
            *sink = Some(id.clone());
        }

        let answer = self
            .engine
            .process_offer(&id, offer)
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))?;

        debug!("[{}] SDP answer ready ({} bytes)", session.id(), answer.len());
        Ok(answer)
    }

    /// Connect source to recorder (video and audio) and source to sink
    pub async fn wire(&self, session: &mut Session) -> Result<()> {
        let (source, recorder, sink) = match session.state() {
            SessionState::Negotiating {
                source: Some(source),
                recorder,
                sink: Some(sink),
                wired: false,
                ..
            } => (source.id.clone(), recorder.clone(), sink.clone()),
            other => {
                return Err(Error::InvalidState(format!(
                    "session {} cannot be wired in {}",
                    session.id(),
                    other.phase()
                )))
            }
        };

        if let Some(recorder) = &recorder {
            self.engine
                .connect(&source, recorder, Some(MediaKind::Video))
                .await?;
            self.engine
                .connect(&source, recorder, Some(MediaKind::Audio))
                .await?;
        }
        self.engine.connect(&source, &sink, None).await?;

        if let SessionState::Negotiating { wired, .. } = session.state_mut() {
            *wired = true;
        }
        debug!("[{}] Source wired to sink", session.id());
        Ok(())
    }

    /// Start media flow
    ///
    /// Applies candidates buffered during negotiation, starts candidate
    /// gathering on the sink and starts the player. Call only after the
    /// answer went out to the peer.
    pub async fn start(&self, session: &mut Session) -> Result<()> {
        let (next, source, sink) = match session.state() {
            SessionState::Negotiating {
                pipeline,
                source: Some(source),
                recorder,
                sink: Some(sink),
                wired: true,
            } => (
                SessionState::Active {
                    pipeline: pipeline.clone(),
                    source: source.clone(),
                    recorder: recorder.clone(),
                    sink: sink.clone(),
                    recording: false,
                },
                source.clone(),
                sink.clone(),
            ),
            other => {
                return Err(Error::InvalidState(format!(
                    "session {} cannot start in {} before it is wired",
                    session.id(),
                    other.phase()
                )))
            }
        };
        session.transition(next)?;

        let buffered: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
        if !buffered.is_empty() {
            debug!(
                "[{}] Applying {} buffered ICE candidates",
                session.id(),
                buffered.len()
            );
        }
        for candidate in &buffered {
            self.engine.add_ice_candidate(&sink, candidate).await?;
        }

        self.engine.gather_candidates(&sink).await?;

        if source.kind == SourceKind::Player {
            self.engine.play(&source.id).await?;
        }

        info!("[{}] Session active", session.id());
        Ok(())
    }

    /// Hand a remote candidate to the sink
    ///
    /// Buffered until the session is active; dropped once it is stopped.
    pub async fn add_ice_candidate(
        &self,
        session: &mut Session,
        candidate: IceCandidate,
    ) -> Result<()> {
        match session.state() {
            SessionState::Active { sink, .. } => {
                let sink = sink.clone();
                self.engine.add_ice_candidate(&sink, &candidate).await
            }
            SessionState::Stopped => {
                debug!("[{}] Dropping ICE candidate for stopped session", session.id());
                Ok(())
            }
            _ => {
                session.pending_candidates.push_back(candidate);
                Ok(())
            }
        }
    }

    /// Start the session's recorder
    pub async fn start_recording(&self, session: &mut Session) -> Result<()> {
        let recorder = active_recorder(session)?;
        self.engine.record(&recorder).await?;

        if let SessionState::Active { recording, .. } = session.state_mut() {
            *recording = true;
        }
        info!("[{}] Recording started", session.id());
        Ok(())
    }

    /// Stop the session's recorder
    pub async fn stop_recording(&self, session: &mut Session) -> Result<()> {
        let recorder = active_recorder(session)?;
        self.engine.stop_recording(&recorder).await?;

        if let SessionState::Active { recording, .. } = session.state_mut() {
            *recording = false;
        }
        info!("[{}] Recording stopped", session.id());
        Ok(())
    }

    /// Release the session's pipeline and every endpoint in it
    ///
    /// Returns `false` if the session was already stopped. The session ends
    /// up `Stopped` even when the engine call fails.
    pub async fn release(&self, session: &mut Session) -> bool {
        let Some(pipeline) = session.state().pipeline().cloned() else {
            return false;
        };

        session.pending_candidates.clear();
        // Stopped is reachable from every state
        let _ = session.transition(SessionState::Stopped);

        match self.engine.release(&pipeline).await {
            Ok(()) => info!("[{}] Media pipeline released: {}", session.id(), pipeline),
            Err(e) => warn!(
                "[{}] Failed to release media pipeline {}: {}",
                session.id(),
                pipeline,
                e
            ),
        }
        true
    }

    /// Create an endpoint, subscribe the session to its events and apply limits
    async fn create_endpoint(
        &self,
        session: &Session,
        pipeline: &PipelineId,
        spec: &EndpointSpec,
        limits: &BitrateConfig,
    ) -> Result<EndpointId> {
        let id = self.engine.create_endpoint(pipeline, spec).await?;
        debug!("[{}] {} created: {}", session.id(), spec.type_name(), id);

        self.engine
            .subscribe(
                &id,
                EngineEventKind::for_endpoint(spec),
                session.events().clone(),
            )
            .await?;

        if !limits.is_empty() {
            self.engine.set_bitrate_limits(&id, limits).await?;
        }
        Ok(id)
    }
}

/// Move a `Created` session to `Negotiating` and return its pipeline
fn begin_negotiation(session: &mut Session) -> Result<PipelineId> {
    if let SessionState::Created { pipeline } = session.state() {
        let pipeline = pipeline.clone();
        session.transition(SessionState::Negotiating {
            pipeline,
            source: None,
            recorder: None,
            sink: None,
            wired: false,
        })?;
    }

    match session.state() {
        SessionState::Negotiating { pipeline, .. } => Ok(pipeline.clone()),
        other => Err(Error::InvalidState(format!(
            "session {} is {}, not negotiating",
            session.id(),
            other.phase()
        ))),
    }
}

fn active_recorder(session: &Session) -> Result<EndpointId> {
    match session.state() {
        SessionState::Active {
            recorder: Some(recorder),
            ..
        } => Ok(recorder.clone()),
        SessionState::Active { recorder: None, .. } => Err(Error::InvalidState(format!(
            "session {} has no recorder",
            session.id()
        ))),
        other => Err(Error::InvalidState(format!(
            "recording needs an {} session, session {} is {}",
            SessionPhase::Active,
            session.id(),
            other.phase()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CryptoSuite, RtpSenderProfile, SrtpConfig};
    use crate::engine::{EngineCall, LoopbackEngine};
    use tokio::sync::mpsc;

    const OFFER: &str = "v=0\r\no=- 1 0 IN IP4 10.0.0.2\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

    fn controller(config: RelayConfig) -> (Arc<LoopbackEngine>, LifecycleController) {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = LifecycleController::new(engine.clone(), Arc::new(config));
        (engine, controller)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 UDP 2122260223 10.0.0.2 5000{} typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn negotiate(controller: &LifecycleController, session: &mut Session) {
        controller.attach_source(session, false).await.unwrap();
        let destination = controller.recording_destination(session.id());
        controller.attach_recorder(session, &destination).await.unwrap();
        controller.attach_sink(session, OFFER).await.unwrap();
        controller.wire(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_flow_reaches_active() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        negotiate(&controller, &mut session).await;
        assert_eq!(session.phase(), SessionPhase::Negotiating);

        controller.start(&mut session).await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Active);

        let calls = engine.calls();
        let connects = calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Connect { .. }))
            .count();
        assert_eq!(connects, 3);
        assert!(calls.iter().any(|c| matches!(c, EngineCall::Play(_))));

        // Gathering comes after wiring
        let gather = calls
            .iter()
            .position(|c| matches!(c, EngineCall::GatherCandidates(_)))
            .unwrap();
        let last_connect = calls
            .iter()
            .rposition(|c| matches!(c, EngineCall::Connect { .. }))
            .unwrap();
        assert!(gather > last_connect);
    }

    #[tokio::test]
    async fn test_start_requires_wiring() {
        let (_engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        controller.attach_source(&mut session, false).await.unwrap();
        controller.attach_sink(&mut session, OFFER).await.unwrap();

        let err = controller.start(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_active() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        controller.add_ice_candidate(&mut session, candidate(1)).await.unwrap();
        negotiate(&controller, &mut session).await;
        controller.add_ice_candidate(&mut session, candidate(2)).await.unwrap();
        assert_eq!(session.pending_candidate_count(), 2);
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::AddIceCandidate { .. })));

        controller.start(&mut session).await.unwrap();
        assert_eq!(session.pending_candidate_count(), 0);

        let applied: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::AddIceCandidate { candidate, .. } => Some(candidate),
                _ => None,
            })
            .collect();
        assert_eq!(applied, vec![candidate(1).candidate, candidate(2).candidate]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();
        let pipeline = session.state().pipeline().cloned().unwrap();

        assert!(controller.release(&mut session).await);
        assert!(!controller.release(&mut session).await);
        assert_eq!(engine.release_count(&pipeline), 1);
        assert_eq!(session.phase(), SessionPhase::Stopped);

        // Candidates after stop are dropped without error
        controller.add_ice_candidate(&mut session, candidate(3)).await.unwrap();
        assert_eq!(session.pending_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_release_marks_stopped_when_engine_fails() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        engine.set_fail_release(true);
        assert!(controller.release(&mut session).await);
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn test_recording_requires_active_session() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        let err = controller.start_recording(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        negotiate(&controller, &mut session).await;
        controller.start(&mut session).await.unwrap();
        controller.start_recording(&mut session).await.unwrap();
        controller.stop_recording(&mut session).await.unwrap();

        let calls = engine.calls();
        assert!(calls.iter().any(|c| matches!(c, EngineCall::Record(_))));
        assert!(calls.iter().any(|c| matches!(c, EngineCall::StopRecording(_))));
    }

    #[tokio::test]
    async fn test_rejected_offer_is_negotiation_failure() {
        let (engine, controller) = controller(RelayConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        engine.set_reject_offers(true);
        controller.attach_source(&mut session, false).await.unwrap();
        let err = controller.attach_sink(&mut session, OFFER).await.unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn test_capacity_maps_to_resource_exhausted() {
        let engine = Arc::new(LoopbackEngine::new().with_pipeline_capacity(0));
        let controller = LifecycleController::new(engine, Arc::new(RelayConfig::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = controller.create_session("c1", tx).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_rtp_source_negotiates_sender() {
        let config = RelayConfig {
            source: SourceConfig::Rtp(RtpSenderProfile::default()),
            ..Default::default()
        };
        let (engine, controller) = controller(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        let info = controller
            .attach_source(&mut session, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.engine_audio_port, Some(40000));
        assert_eq!(info.engine_video_port, 40002);
        assert!(engine
            .endpoints_of_type("RtpEndpoint")
            .iter()
            .all(|id| engine.endpoint_spec(id) == Some(EndpointSpec::Rtp { crypto: None })));
    }

    #[tokio::test]
    async fn test_secure_rtp_without_keys_is_configuration_error() {
        let config = RelayConfig {
            source: SourceConfig::Rtp(RtpSenderProfile::default()),
            ..Default::default()
        };
        let (_engine, controller) = controller(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        let err = controller.attach_source(&mut session, true).await.unwrap_err();
        assert!(matches!(err, Error::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_secure_rtp_uses_engine_key() {
        let config = RelayConfig {
            source: SourceConfig::Rtp(RtpSenderProfile::default()),
            srtp: Some(SrtpConfig {
                crypto_suite: CryptoSuite::Aes128CmHmacSha1_80,
                engine_key: "4321ZYXWVUTSRQPONMLKJIHGFEDCBA".to_string(),
                sender_key: "ABCDEFGHIJKLMNOPQRSTUVWXYZ1234".to_string(),
            }),
            ..Default::default()
        };
        let (engine, controller) = controller(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session("c1", tx).await.unwrap();

        let info = controller
            .attach_source(&mut session, true)
            .await
            .unwrap()
            .unwrap();
        assert!(info.secure);
        assert_eq!(info.engine_audio_port, None);

        let rtp = engine.endpoints_of_type("RtpEndpoint");
        match engine.endpoint_spec(&rtp[0]) {
            Some(EndpointSpec::Rtp { crypto: Some(crypto) }) => {
                assert_eq!(crypto.key, "4321ZYXWVUTSRQPONMLKJIHGFEDCBA");
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn test_recording_destination() {
        let (_engine, controller) = controller(RelayConfig::default());
        let uri = controller.recording_destination("conn-7");
        assert!(uri.starts_with("file:///tmp/conn-7-"));
        assert!(uri.ends_with(".mp4"));
    }
}
