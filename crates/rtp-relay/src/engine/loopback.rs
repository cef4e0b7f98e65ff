//! In-process media engine
//!
//! Keeps the pipeline/endpoint object tree in memory and answers offers with
//! a synthetic SDP. No media flows. Used by the test suite and by
//! `--engine loopback` demo runs of the server.

use super::{
    EndpointId, EndpointSpec, EngineEvent, EngineEventKind, EventSink, IceCandidate,
    MediaEngine, MediaKind, PipelineId,
};
use crate::config::BitrateConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// One call made against the loopback engine, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    /// `create_pipeline` returned this id
    CreatePipeline(PipelineId),
    /// `create_endpoint` returned `endpoint`
    CreateEndpoint {
        /// Owning pipeline
        pipeline: PipelineId,
        /// New endpoint
        endpoint: EndpointId,
        /// Media server type name
        type_name: &'static str,
    },
    /// Event subscription
    Subscribe {
        /// Subscribed endpoint
        endpoint: EndpointId,
        /// Event kinds
        kinds: Vec<EngineEventKind>,
    },
    /// Element connection
    Connect {
        /// Upstream element
        source: EndpointId,
        /// Downstream element
        sink: EndpointId,
        /// Media type filter
        media: Option<MediaKind>,
    },
    /// SDP offer submitted
    ProcessOffer(EndpointId),
    /// Remote candidate added
    AddIceCandidate {
        /// WebRTC endpoint
        endpoint: EndpointId,
        /// Candidate line
        candidate: String,
    },
    /// Candidate gathering started
    GatherCandidates(EndpointId),
    /// Bitrate limits applied
    SetBitrateLimits(EndpointId),
    /// Player started
    Play(EndpointId),
    /// Recorder started
    Record(EndpointId),
    /// Recorder stopped
    StopRecording(EndpointId),
    /// Pipeline release attempted
    Release(PipelineId),
}

#[derive(Debug)]
struct Object {
    spec: Option<EndpointSpec>,
    /// Owning pipeline for endpoints, `None` for pipelines
    pipeline: Option<String>,
    released: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    objects: HashMap<String, Object>,
    subscriptions: HashMap<String, Vec<(EngineEventKind, EventSink)>>,
    calls: VecDeque<EngineCall>,
    /// Released pipelines, oldest first
    retired: VecDeque<String>,
    history_limit: Option<usize>,
    live_pipelines: usize,
    reject_offers: bool,
    fail_release: bool,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn log_call(&mut self, call: EngineCall) {
        self.calls.push_back(call);
        if let Some(limit) = self.history_limit {
            while self.calls.len() > limit {
                self.calls.pop_front();
            }
        }
    }

    /// Drop the children of a released pipeline and forget the oldest
    /// released pipelines beyond the history limit
    fn retire(&mut self, pipeline: &str) {
        let prefix = format!("{}/", pipeline);
        self.objects.retain(|id, _| !id.starts_with(&prefix));
        self.subscriptions.retain(|id, _| !id.starts_with(&prefix));

        self.retired.push_back(pipeline.to_string());
        if let Some(limit) = self.history_limit {
            while self.retired.len() > limit {
                if let Some(oldest) = self.retired.pop_front() {
                    self.objects.remove(&oldest);
                }
            }
        }
    }

    /// Look up an object that is still usable
    fn live(&self, id: &str) -> Result<&Object> {
        let Some(object) = self.objects.get(id) else {
            // Endpoints are dropped with their pipeline; report the release
            // while the pipeline is still remembered
            let parent_released = id
                .split_once('/')
                .and_then(|(pipeline, _)| self.objects.get(pipeline))
                .map(|p| p.released)
                .unwrap_or(false);
            if parent_released {
                return Err(Error::EngineError(format!("Object {} has been released", id)));
            }
            return Err(Error::EngineError(format!("Object {} not found", id)));
        };

        let parent_released = object
            .pipeline
            .as_ref()
            .and_then(|p| self.objects.get(p))
            .map(|p| p.released)
            .unwrap_or(false);

        if object.released || parent_released {
            return Err(Error::EngineError(format!("Object {} has been released", id)));
        }
        Ok(object)
    }

    fn live_endpoint(&self, id: &EndpointId, type_name: Option<&str>) -> Result<&EndpointSpec> {
        let spec = self
            .live(&id.0)?
            .spec
            .as_ref()
            .ok_or_else(|| Error::EngineError(format!("{} is not an endpoint", id)))?;

        match type_name {
            Some(expected) if spec.type_name() != expected => Err(Error::EngineError(format!(
                "{} is a {}, not a {}",
                id,
                spec.type_name(),
                expected
            ))),
            _ => Ok(spec),
        }
    }

    fn emit(&mut self, object: &str, kind: EngineEventKind, data: Value) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(object) else {
            return false;
        };

        let mut delivered = false;
        subscribers.retain(|(k, sink)| {
            if *k != kind {
                return true;
            }
            let sent = sink
                .send(EngineEvent {
                    object: object.to_string(),
                    kind,
                    data: data.clone(),
                })
                .is_ok();
            delivered |= sent;
            sent
        });
        delivered
    }
}

/// Media engine that lives entirely in memory
///
/// # Example
///
/// ```
/// use rtp_relay::engine::{EndpointSpec, LoopbackEngine, MediaEngine};
///
/// # tokio_test::block_on(async {
/// let engine = LoopbackEngine::new();
/// let pipeline = engine.create_pipeline().await?;
/// let sink = engine.create_endpoint(&pipeline, &EndpointSpec::WebRtc).await?;
/// assert!(sink.0.starts_with(&pipeline.0));
///
/// engine.release(&pipeline).await?;
/// assert_eq!(engine.live_pipelines(), 0);
/// # Ok::<(), rtp_relay::Error>(())
/// # }).unwrap();
/// ```
pub struct LoopbackEngine {
    state: Mutex<State>,
    max_pipelines: Option<usize>,
    offer_delay: Option<Duration>,
}

impl LoopbackEngine {
    /// Create an engine with unlimited capacity
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_pipelines: None,
            offer_delay: None,
        }
    }

    /// Refuse to create more than `max` live pipelines
    pub fn with_pipeline_capacity(mut self, max: usize) -> Self {
        self.max_pipelines = Some(max);
        self
    }

    /// Keep at most `limit` call journal entries and released pipelines
    ///
    /// Older entries are forgotten; a forgotten pipeline reports "not
    /// found" instead of "has been released".
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = Some(limit);
        self
    }

    /// Hold every `process_offer` call for `delay` before answering
    pub fn with_offer_delay(mut self, delay: Duration) -> Self {
        self.offer_delay = Some(delay);
        self
    }

    /// Make subsequent offers fail
    pub fn set_reject_offers(&self, reject: bool) {
        self.state.lock().reject_offers = reject;
    }

    /// Make subsequent releases fail (the object tree is left untouched)
    pub fn set_fail_release(&self, fail: bool) {
        self.state.lock().fail_release = fail;
    }

    /// Every call made so far, or the most recent ones under a history limit
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.iter().cloned().collect()
    }

    /// Number of pipelines created and not yet released
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().live_pipelines
    }

    /// How many times `pipeline` was successfully released
    pub fn release_count(&self, pipeline: &PipelineId) -> usize {
        self.state
            .lock()
            .objects
            .get(&pipeline.0)
            .map(|o| usize::from(o.released))
            .unwrap_or(0)
    }

    /// Live endpoints of the given media server type
    pub fn endpoints_of_type(&self, type_name: &str) -> Vec<EndpointId> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state
            .objects
            .iter()
            .filter(|(id, o)| {
                o.spec.as_ref().map(|s| s.type_name()) == Some(type_name)
                    && state.live(id).is_ok()
            })
            .map(|(id, _)| EndpointId(id.clone()))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }

    /// Spec an endpoint was created with
    pub fn endpoint_spec(&self, endpoint: &EndpointId) -> Option<EndpointSpec> {
        self.state
            .lock()
            .objects
            .get(&endpoint.0)
            .and_then(|o| o.spec.clone())
    }

    /// Raise an event on an endpoint, as the media server would
    ///
    /// Returns whether any subscriber received it.
    pub fn emit(&self, endpoint: &EndpointId, kind: EngineEventKind, data: Value) -> bool {
        self.state.lock().emit(&endpoint.0, kind, data)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an answer that mirrors the offer's media lines
fn synthetic_answer(session: u64, offer: &str, spec: &EndpointSpec) -> String {
    let direction = match spec {
        EndpointSpec::Rtp { .. } => "recvonly",
        _ => "sendonly",
    };

    let mut answer = format!(
        "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=loopback\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n",
        session
    );

    let media_lines = offer.lines().filter(|l| l.starts_with("m="));
    for (index, line) in media_lines.enumerate() {
        let mut parts = line.trim_start_matches("m=").split_whitespace();
        let media = parts.next().unwrap_or("video");
        let _offered_port = parts.next();
        let rest: Vec<&str> = parts.collect();

        answer.push_str(&format!(
            "m={} {} {}\r\n",
            media,
            40_000 + 2 * index,
            rest.join(" ")
        ));
        answer.push_str(&format!("a=mid:{}\r\na={}\r\n", index, direction));
        if offer.contains("a=direction:active") {
            answer.push_str("a=direction:passive\r\n");
        }

        if let EndpointSpec::Rtp {
            crypto: Some(crypto),
        } = spec
        {
            answer.push_str(&format!(
                "a=crypto:1 {} inline:{}\r\n",
                crypto.suite.sdp_name(),
                base64::engine::general_purpose::STANDARD.encode(&crypto.key)
            ));
        }
        answer.push_str(&format!("a=ssrc:{} cname:loopback\r\n", 1000 + index));
    }

    answer
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_pipeline(&self) -> Result<PipelineId> {
        let mut state = self.state.lock();

        if let Some(max) = self.max_pipelines {
            if state.live_pipelines >= max {
                return Err(Error::EngineError(format!(
                    "Pipeline capacity reached ({} live)",
                    max
                )));
            }
        }

        let id = PipelineId(format!("loopback-{}_kurento.MediaPipeline", state.next()));
        state.objects.insert(
            id.0.clone(),
            Object {
                spec: None,
                pipeline: None,
                released: false,
            },
        );
        state.live_pipelines += 1;
        state.log_call(EngineCall::CreatePipeline(id.clone()));

        debug!("Loopback pipeline created: {}", id);
        Ok(id)
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineId,
        spec: &EndpointSpec,
    ) -> Result<EndpointId> {
        let mut state = self.state.lock();
        state.live(&pipeline.0)?;

        let id = EndpointId(format!(
            "{}/{}_kurento.{}",
            pipeline,
            state.next(),
            spec.type_name()
        ));
        state.objects.insert(
            id.0.clone(),
            Object {
                spec: Some(spec.clone()),
                pipeline: Some(pipeline.0.clone()),
                released: false,
            },
        );
        state.log_call(EngineCall::CreateEndpoint {
            pipeline: pipeline.clone(),
            endpoint: id.clone(),
            type_name: spec.type_name(),
        });
        Ok(id)
    }

    async fn subscribe(
        &self,
        endpoint: &EndpointId,
        kinds: &[EngineEventKind],
        sink: EventSink,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.live(&endpoint.0)?;

        let entry = state.subscriptions.entry(endpoint.0.clone()).or_default();
        for kind in kinds {
            entry.push((*kind, sink.clone()));
        }
        state.log_call(EngineCall::Subscribe {
            endpoint: endpoint.clone(),
            kinds: kinds.to_vec(),
        });
        Ok(())
    }

    async fn connect(
        &self,
        source: &EndpointId,
        sink: &EndpointId,
        media: Option<MediaKind>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let source_pipeline = state.live(&source.0)?.pipeline.clone();
        let sink_pipeline = state.live(&sink.0)?.pipeline.clone();
        if source_pipeline != sink_pipeline {
            return Err(Error::EngineError(format!(
                "{} and {} belong to different pipelines",
                source, sink
            )));
        }

        state.log_call(EngineCall::Connect {
            source: source.clone(),
            sink: sink.clone(),
            media,
        });
        Ok(())
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> Result<String> {
        {
            let mut state = self.state.lock();
            state.live_endpoint(endpoint, None)?;
            state.log_call(EngineCall::ProcessOffer(endpoint.clone()));
        }

        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let spec = state.live_endpoint(endpoint, None)?.clone();

        if state.reject_offers {
            return Err(Error::EngineError("SDP offer rejected (code 40208)".to_string()));
        }
        if !offer.trim_start().starts_with("v=0") {
            return Err(Error::EngineError(
                "SDP offer is not a session description (code 40208)".to_string(),
            ));
        }

        Ok(synthetic_answer(state.next(), offer, &spec))
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, Some("WebRtcEndpoint"))?;
        state.log_call(EngineCall::AddIceCandidate {
            endpoint: endpoint.clone(),
            candidate: candidate.candidate.clone(),
        });
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, Some("WebRtcEndpoint"))?;
        state.log_call(EngineCall::GatherCandidates(endpoint.clone()));

        state.emit(
            &endpoint.0,
            EngineEventKind::IceCandidateFound,
            json!({
                "candidate": {
                    "candidate": "candidate:1 1 UDP 2122260223 127.0.0.1 40000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }),
        );
        state.emit(&endpoint.0, EngineEventKind::IceGatheringDone, json!({}));
        Ok(())
    }

    async fn set_bitrate_limits(
        &self,
        endpoint: &EndpointId,
        _limits: &BitrateConfig,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, None)?;
        state.log_call(EngineCall::SetBitrateLimits(endpoint.clone()));
        Ok(())
    }

    async fn play(&self, endpoint: &EndpointId) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, Some("PlayerEndpoint"))?;
        state.log_call(EngineCall::Play(endpoint.clone()));
        Ok(())
    }

    async fn record(&self, endpoint: &EndpointId) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, Some("RecorderEndpoint"))?;
        state.log_call(EngineCall::Record(endpoint.clone()));
        state.emit(&endpoint.0, EngineEventKind::Recording, json!({}));
        Ok(())
    }

    async fn stop_recording(&self, endpoint: &EndpointId) -> Result<()> {
        let mut state = self.state.lock();
        state.live_endpoint(endpoint, Some("RecorderEndpoint"))?;
        state.log_call(EngineCall::StopRecording(endpoint.clone()));
        state.emit(&endpoint.0, EngineEventKind::Stopped, json!({}));
        Ok(())
    }

    async fn release(&self, pipeline: &PipelineId) -> Result<()> {
        let mut state = self.state.lock();
        state.log_call(EngineCall::Release(pipeline.clone()));

        if state.fail_release {
            return Err(Error::EngineError(format!("Release of {} failed", pipeline)));
        }

        let object = state
            .objects
            .get_mut(&pipeline.0)
            .ok_or_else(|| Error::EngineError(format!("Object {} not found", pipeline)))?;
        if object.released {
            return Err(Error::EngineError(format!(
                "Object {} has been released",
                pipeline
            )));
        }
        object.released = true;

        state.retire(&pipeline.0);
        state.live_pipelines -= 1;

        debug!("Loopback pipeline released: {}", pipeline);
        Ok(())
    }
}
