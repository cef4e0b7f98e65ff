//! Kurento Media Server client (JSON-RPC 2.0 over WebSocket)

use super::protocol::{Incoming, JsonRpcRequest};
use super::{
    EndpointId, EndpointSpec, EngineEvent, EngineEventKind, EventSink, IceCandidate,
    MediaEngine, MediaKind, PipelineId,
};
use crate::config::BitrateConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

type SubscriptionMap = HashMap<(String, EngineEventKind), EventSink>;

/// Keepalive interval announced to the media server, in milliseconds
const PING_INTERVAL_MS: u64 = 240_000;

/// Client for a Kurento Media Server
///
/// Holds one WebSocket connection. Requests are correlated with replies by
/// numeric id; `onEvent` notifications are routed to subscribers by
/// `(object, event type)`.
pub struct KurentoClient {
    /// Media server URL
    url: String,

    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,

    /// Next request id
    next_id: AtomicU64,

    /// Requests awaiting a reply
    pending: Arc<Mutex<PendingMap>>,

    /// Media server session, learned from the first reply
    session_id: Arc<RwLock<Option<String>>>,

    /// Event subscribers
    subscriptions: Arc<Mutex<SubscriptionMap>>,

    /// Per-request timeout
    request_timeout: Duration,
}

impl KurentoClient {
    /// Connect to a media server and verify it answers a ping
    ///
    /// # Arguments
    ///
    /// * `url` - JSON-RPC endpoint (e.g. `ws://localhost:8888/kurento`)
    /// * `request_timeout` - How long to wait for each reply
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
        info!("Connecting to media server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::EngineError(format!("Failed to connect to {}: {}", url, e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let session_id = Arc::new(RwLock::new(None));
        let subscriptions: Arc<Mutex<SubscriptionMap>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(
            read,
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
        ));

        let client = Self {
            url: url.to_string(),
            tx,
            next_id: AtomicU64::new(1),
            pending,
            session_id,
            subscriptions,
            request_timeout,
        };

        client.ping().await?;
        info!("Connected to media server: {}", client.url);

        Ok(client)
    }

    /// Sender task: sends frames from channel to WebSocket
    async fn sender_task(
        mut write: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send to media server: {}", e);
                break;
            }
        }

        debug!("Media server sender task terminated");
    }

    /// Receiver task: resolves pending requests and routes events
    async fn receiver_task(
        mut read: futures_util::stream::SplitStream<WsStream>,
        pending: Arc<Mutex<PendingMap>>,
        subscriptions: Arc<Mutex<SubscriptionMap>>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match Incoming::parse(&text) {
                    Ok(incoming) => Self::dispatch(incoming, &pending, &subscriptions),
                    Err(e) => warn!("Ignoring unreadable media server frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Media server closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Media server connection error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        // Nobody will answer the in-flight requests any more
        let orphaned: Vec<_> = pending.lock().drain().collect();
        for (_, waiter) in orphaned {
            let _ = waiter.send(Err(Error::EngineError(
                "media server connection closed".to_string(),
            )));
        }
        subscriptions.lock().clear();

        debug!("Media server receiver task terminated");
    }

    fn dispatch(
        incoming: Incoming,
        pending: &Mutex<PendingMap>,
        subscriptions: &Mutex<SubscriptionMap>,
    ) {
        match incoming {
            Incoming::Response { id, result } => match pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(result));
                }
                None => debug!("Reply for unknown request {}", id),
            },
            Incoming::Error { id: Some(id), error } => match pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Err(Error::EngineError(format!(
                        "{} (code {})",
                        error.message, error.code
                    ))));
                }
                None => debug!("Error reply for unknown request {}: {}", id, error.message),
            },
            Incoming::Error { id: None, error } => {
                warn!("Media server error without request id: {}", error.message);
            }
            Incoming::Notification { method, params } if method == "onEvent" => {
                route_event(subscriptions, &params);
            }
            Incoming::Notification { method, .. } => {
                debug!("Ignoring media server notification: {}", method);
            }
        }
    }

    /// Send a request and wait for its reply
    async fn request(&self, method: &str, mut params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let (Some(session), Value::Object(map)) = (self.session_id.read().clone(), &mut params)
        {
            map.insert("sessionId".to_string(), Value::String(session));
        }

        let frame = JsonRpcRequest::new(method, params, Some(id)).to_json()?;

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().insert(id, waiter_tx);
        let _pending = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        debug!("Media server request {} {}", id, method);
        if self.tx.send(Message::Text(frame)).is_err() {
            return Err(Error::EngineError(
                "media server connection closed".to_string(),
            ));
        }

        let result = match tokio::time::timeout(self.request_timeout, waiter_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::EngineError(
                    "media server connection closed".to_string(),
                ))
            }
            Err(_) => {
                return Err(Error::OperationTimeout(format!(
                    "{} got no reply within {:?}",
                    method, self.request_timeout
                )));
            }
        };

        if let Some(session) = result.get("sessionId").and_then(Value::as_str) {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session) {
                debug!("Media server session: {}", session);
                *current = Some(session.to_string());
            }
        }

        Ok(result)
    }

    /// Create a media object and return its id
    async fn create(&self, type_name: &str, constructor_params: Value) -> Result<String> {
        let result = self
            .request(
                "create",
                json!({
                    "type": type_name,
                    "constructorParams": constructor_params,
                    "properties": {}
                }),
            )
            .await?;

        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::EngineError(format!("create {} returned no object id", type_name)))
    }

    /// Invoke an operation on a media object and return its value
    async fn invoke(&self, object: &str, operation: &str, params: Value) -> Result<Value> {
        let result = self
            .request(
                "invoke",
                json!({
                    "object": object,
                    "operation": operation,
                    "operationParams": params
                }),
            )
            .await?;

        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    /// Keepalive round trip
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", json!({ "interval": PING_INTERVAL_MS }))
            .await
            .map(|_| ())
    }

    /// Media server URL this client is connected to
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Removes a request from the pending map when its caller goes away,
/// whether by reply, error, timeout or cancellation
struct PendingGuard {
    pending: Arc<Mutex<PendingMap>>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Constructor parameters for an endpoint type
fn constructor_params(pipeline: &PipelineId, spec: &EndpointSpec) -> Value {
    let mut params = Map::new();
    params.insert("mediaPipeline".to_string(), Value::String(pipeline.0.clone()));

    match spec {
        EndpointSpec::Player { uri } => {
            params.insert("uri".to_string(), Value::String(uri.clone()));
        }
        EndpointSpec::Rtp { crypto: Some(crypto) } => {
            params.insert(
                "crypto".to_string(),
                json!({
                    "crypto": crypto.suite.as_kms(),
                    "key": crypto.key
                }),
            );
        }
        EndpointSpec::Rtp { crypto: None } | EndpointSpec::WebRtc => {}
        EndpointSpec::Recorder { uri, profile } => {
            params.insert("uri".to_string(), Value::String(uri.clone()));
            params.insert(
                "mediaProfile".to_string(),
                Value::String(profile.as_kms().to_string()),
            );
        }
    }

    Value::Object(params)
}

/// Deliver an `onEvent` notification to its subscriber
fn route_event(subscriptions: &Mutex<SubscriptionMap>, params: &Value) {
    let value = params.get("value").unwrap_or(params);

    let object = match value.get("object").and_then(Value::as_str) {
        Some(o) => o.to_string(),
        None => {
            debug!("Event without object: {}", value);
            return;
        }
    };
    let kind = match value
        .get("type")
        .and_then(Value::as_str)
        .and_then(EngineEventKind::parse)
    {
        Some(k) => k,
        None => {
            debug!("Event of unknown type on {}: {}", object, value);
            return;
        }
    };

    let key = (object, kind);
    let mut subscriptions = subscriptions.lock();
    let Some(sink) = subscriptions.get(&key) else {
        debug!("No subscriber for {} on {}", kind, key.0);
        return;
    };

    let event = EngineEvent {
        object: key.0.clone(),
        kind,
        data: value.get("data").cloned().unwrap_or(Value::Null),
    };
    if sink.send(event).is_err() {
        // Subscriber went away with its connection
        subscriptions.remove(&key);
    }
}

#[async_trait]
impl MediaEngine for KurentoClient {
    async fn create_pipeline(&self) -> Result<PipelineId> {
        self.create("MediaPipeline", json!({})).await.map(PipelineId)
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineId,
        spec: &EndpointSpec,
    ) -> Result<EndpointId> {
        self.create(spec.type_name(), constructor_params(pipeline, spec))
            .await
            .map(EndpointId)
    }

    async fn subscribe(
        &self,
        endpoint: &EndpointId,
        kinds: &[EngineEventKind],
        sink: EventSink,
    ) -> Result<()> {
        for kind in kinds {
            // Register before asking, so an event racing the reply is not lost
            self.subscriptions
                .lock()
                .insert((endpoint.0.clone(), *kind), sink.clone());

            if let Err(e) = self
                .request(
                    "subscribe",
                    json!({ "type": kind.as_str(), "object": endpoint.0 }),
                )
                .await
            {
                self.subscriptions.lock().remove(&(endpoint.0.clone(), *kind));
                return Err(e);
            }
        }
        Ok(())
    }

    async fn connect(
        &self,
        source: &EndpointId,
        sink: &EndpointId,
        media: Option<MediaKind>,
    ) -> Result<()> {
        let mut params = json!({ "sink": sink.0 });
        if let Some(media) = media {
            params["mediaType"] = Value::String(media.as_kms().to_string());
        }
        self.invoke(&source.0, "connect", params).await.map(|_| ())
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> Result<String> {
        let answer = self
            .invoke(&endpoint.0, "processOffer", json!({ "offer": offer }))
            .await?;
        answer
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::EngineError("processOffer returned no SDP answer".to_string()))
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.invoke(
            &endpoint.0,
            "addIceCandidate",
            json!({
                "candidate": {
                    "__module__": "kurento",
                    "__type__": "IceCandidate",
                    "candidate": candidate.candidate,
                    "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
                    "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or(0)
                }
            }),
        )
        .await
        .map(|_| ())
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()> {
        self.invoke(&endpoint.0, "gatherCandidates", json!({}))
            .await
            .map(|_| ())
    }

    async fn set_bitrate_limits(
        &self,
        endpoint: &EndpointId,
        limits: &BitrateConfig,
    ) -> Result<()> {
        for (operation, param, value) in limits.operations() {
            self.invoke(&endpoint.0, operation, json!({ param: value }))
                .await?;
        }
        Ok(())
    }

    async fn play(&self, endpoint: &EndpointId) -> Result<()> {
        self.invoke(&endpoint.0, "play", json!({})).await.map(|_| ())
    }

    async fn record(&self, endpoint: &EndpointId) -> Result<()> {
        self.invoke(&endpoint.0, "record", json!({})).await.map(|_| ())
    }

    async fn stop_recording(&self, endpoint: &EndpointId) -> Result<()> {
        self.invoke(&endpoint.0, "stop", json!({})).await.map(|_| ())
    }

    async fn release(&self, pipeline: &PipelineId) -> Result<()> {
        let result = self
            .request("release", json!({ "object": pipeline.0 }))
            .await
            .map(|_| ());

        // Child object ids are prefixed with their pipeline id. A failed
        // release is never retried, so its subscribers go either way.
        self.subscriptions
            .lock()
            .retain(|(object, _), _| !object.starts_with(&pipeline.0));
        result
    }
}
