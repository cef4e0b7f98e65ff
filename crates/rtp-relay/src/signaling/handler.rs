//! Signaling message handler
//!
//! Dispatches client messages and engine events for one connection at a
//! time. Callers feed it from a single task per connection, so messages and
//! events of a connection are never handled concurrently.

use super::events::{log_event, translate, EventAction};
use super::protocol::{ClientMessage, ServerMessage};
use crate::config::RelayConfig;
use crate::engine::{EngineEvent, EventSink, IceCandidate};
use crate::lifecycle::LifecycleController;
use crate::session::{Session, SessionRegistry, SessionState};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why pending work on a connection is being abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Client sent `stop`
    Stop,
    /// Transport closed
    Close,
}

/// Per-connection state the handler works with
pub struct ConnectionContext {
    /// Connection id (also the session key)
    pub id: String,

    /// Messages to the client
    pub outbound: mpsc::UnboundedSender<ServerMessage>,

    /// Where engine events for this connection's session are delivered
    pub events: EventSink,

    /// Raised by the transport reader on `stop` or close
    pub cancel: watch::Receiver<Option<Interrupt>>,
}

enum Negotiation {
    Answered(Result<String>),
    Interrupted(Interrupt),
}

/// Routes signaling messages to the registry and lifecycle controller
pub struct SignalingHandler {
    registry: Arc<SessionRegistry>,
    lifecycle: Arc<LifecycleController>,
    config: Arc<RelayConfig>,
}

impl SignalingHandler {
    /// Create a handler
    pub fn new(
        registry: Arc<SessionRegistry>,
        lifecycle: Arc<LifecycleController>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            config,
        }
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Relay configuration
    pub fn config(&self) -> &Arc<RelayConfig> {
        &self.config
    }

    /// Handle one text frame from the client
    ///
    /// Failures are logged with the connection id and, unless they are
    /// transport failures, reported to the client as `error`.
    pub async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(message) => {
                debug!("[{}] Received {}", ctx.id, message.name());
                self.dispatch(ctx, message).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.report(ctx, &e);
        }
    }

    async fn dispatch(&self, ctx: &mut ConnectionContext, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Offer {
                offer,
                use_secure_transport,
            } => self.handle_offer(ctx, &offer, use_secure_transport).await,
            ClientMessage::IceCandidate(candidate) => {
                self.handle_ice_candidate(ctx, candidate).await
            }
            ClientMessage::Stop => {
                self.teardown(ctx, true).await;
                Ok(())
            }
            ClientMessage::StartRecording => {
                let handle = self.require_session(ctx)?;
                let mut session = handle.lock().await;
                self.lifecycle.start_recording(&mut session).await
            }
            ClientMessage::StopRecording => {
                let handle = self.require_session(ctx)?;
                let mut session = handle.lock().await;
                self.lifecycle.stop_recording(&mut session).await
            }
        }
    }

    /// Create and negotiate a session for this connection
    async fn handle_offer(
        &self,
        ctx: &mut ConnectionContext,
        offer: &str,
        secure: bool,
    ) -> Result<()> {
        if self.registry.contains(&ctx.id) {
            return Err(Error::InvalidState(format!(
                "connection {} already has a session, send stop first",
                ctx.id
            )));
        }
        if !self.registry.has_capacity() {
            return Err(Error::ResourceExhausted(format!(
                "maximum number of sessions reached ({})",
                self.config.max_sessions
            )));
        }

        // Interrupts raised before this offer belong to earlier work
        ctx.cancel.borrow_and_update();

        info!(
            "[{}] Starting session (secure transport: {}, sessions: {})",
            ctx.id,
            secure,
            self.registry.len()
        );

        let session = self
            .lifecycle
            .create_session(&ctx.id, ctx.events.clone())
            .await?;
        let pipeline = session.state().pipeline().cloned();

        let handle = match self.registry.register(session) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(pipeline) = pipeline {
                    if let Err(release_err) = self.lifecycle.engine().release(&pipeline).await {
                        warn!(
                            "[{}] Failed to release unregistered pipeline {}: {}",
                            ctx.id, pipeline, release_err
                        );
                    }
                }
                return Err(e);
            }
        };

        let mut session = handle.lock().await;
        let outcome = self.negotiate(ctx, &mut session, offer, secure).await;

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(interrupt)) => {
                info!(
                    "[{}] Negotiation abandoned ({:?}), discarding answer",
                    ctx.id, interrupt
                );
                drop(session);
                self.teardown(ctx, interrupt == Interrupt::Stop).await;
                Ok(())
            }
            Err(e) => {
                self.lifecycle.release(&mut session).await;
                drop(session);
                self.registry.remove(&ctx.id);
                Err(e)
            }
        }
    }

    /// Run the offer flow on a registered session
    ///
    /// Returns the interrupt if the connection gave up while the sink was
    /// negotiating.
    async fn negotiate(
        &self,
        ctx: &mut ConnectionContext,
        session: &mut Session,
        offer: &str,
        secure: bool,
    ) -> Result<Option<Interrupt>> {
        if let Some(info) = self.lifecycle.attach_source(session, secure).await? {
            self.send(
                ctx,
                ServerMessage::ConnectionInfo {
                    text: info.summary(),
                },
            )?;
        }

        if self.config.recording.enabled {
            let destination = self.lifecycle.recording_destination(&ctx.id);
            self.lifecycle.attach_recorder(session, &destination).await?;
        }

        let negotiation = tokio::select! {
            result = self.lifecycle.attach_sink(session, offer) => Negotiation::Answered(result),
            _ = ctx.cancel.changed() => {
                Negotiation::Interrupted((*ctx.cancel.borrow()).unwrap_or(Interrupt::Close))
            }
        };

        let answer = match negotiation {
            Negotiation::Answered(result) => result?,
            Negotiation::Interrupted(interrupt) => return Ok(Some(interrupt)),
        };

        self.lifecycle.wire(session).await?;
        self.send(ctx, ServerMessage::Answer { answer })?;
        self.lifecycle.start(session).await?;

        Ok(None)
    }

    async fn handle_ice_candidate(
        &self,
        ctx: &mut ConnectionContext,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(handle) = self.registry.lookup(&ctx.id) else {
            debug!("[{}] ICE candidate without a session, ignoring", ctx.id);
            return Ok(());
        };

        let mut session = handle.lock().await;
        self.lifecycle.add_ice_candidate(&mut session, candidate).await
    }

    /// Handle an event raised by one of the connection's endpoints
    pub async fn handle_engine_event(&self, ctx: &mut ConnectionContext, event: EngineEvent) {
        let owned = match self.registry.lookup(&ctx.id) {
            Some(handle) => owns(handle.lock().await.state(), &event.object),
            None => false,
        };
        if !owned {
            debug!(
                "[{}] Dropping {} from {}: not part of the current session",
                ctx.id, event.kind, event.object
            );
            return;
        }

        match translate(&event) {
            EventAction::Notify(message) => {
                if let Err(e) = self.send(ctx, message) {
                    self.report(ctx, &e);
                }
            }
            EventAction::EndPlayback => {
                info!("[{}] End of stream on {}", ctx.id, event.object);
                self.teardown(ctx, true).await;
            }
            EventAction::Fail(message) => {
                error!("[{}] {}", ctx.id, message);
                if let Err(e) = self.send(ctx, ServerMessage::Error { message }) {
                    self.report(ctx, &e);
                }
                self.teardown(ctx, false).await;
            }
            EventAction::Log => log_event(&ctx.id, &event),
        }
    }

    /// Remove and release the connection's session
    ///
    /// Returns whether there was a session. With `notify`, the client gets
    /// `end-playback`.
    pub async fn teardown(&self, ctx: &mut ConnectionContext, notify: bool) -> bool {
        let Some(handle) = self.registry.remove(&ctx.id) else {
            debug!("[{}] No session to tear down", ctx.id);
            return false;
        };

        let (released, age) = {
            let mut session = handle.lock().await;
            let released = self.lifecycle.release(&mut session).await;
            (released, session.age())
        };

        if notify && released {
            if let Err(e) = self.send(ctx, ServerMessage::EndPlayback) {
                self.report(ctx, &e);
            }
        }

        info!("[{}] Session torn down after {:?}", ctx.id, age);
        released
    }

    fn require_session(&self, ctx: &ConnectionContext) -> Result<crate::session::SessionHandle> {
        self.registry.lookup(&ctx.id).ok_or_else(|| {
            Error::InvalidState(format!("connection {} has no session", ctx.id))
        })
    }

    fn send(&self, ctx: &ConnectionContext, message: ServerMessage) -> Result<()> {
        ctx.outbound
            .send(message)
            .map_err(|_| Error::TransportError(format!("connection {} is closed", ctx.id)))
    }

    fn report(&self, ctx: &ConnectionContext, err: &Error) {
        if err.is_reported() {
            warn!("[{}] {} error: {}", ctx.id, err.kind(), err);
            if ctx.outbound.send(ServerMessage::from(err)).is_err() {
                debug!("[{}] Could not report error, connection closed", ctx.id);
            }
        } else {
            error!("[{}] {} error: {}", ctx.id, err.kind(), err);
        }
    }
}

/// Whether `object` is one of the session's endpoints
fn owns(state: &SessionState, object: &str) -> bool {
    state.source().map(|s| s.id.0.as_str()) == Some(object)
        || state.sink().map(|s| s.0.as_str()) == Some(object)
        || state.recorder().map(|s| s.0.as_str()) == Some(object)
}
