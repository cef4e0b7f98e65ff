//! Per-connection tasks
//!
//! Each WebSocket connection runs three tasks: a reader that queues text
//! frames, a writer that serializes outbound messages, and the processing
//! loop that hands frames and engine events to the [`SignalingHandler`] one
//! at a time.

use super::handler::{ConnectionContext, Interrupt, SignalingHandler};
use super::protocol::{ClientMessage, ServerMessage};
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Serve one client connection until it closes or the server shuts down
///
/// Whatever session the connection owns is released before returning.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: String,
    handler: Arc<SignalingHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| Error::TransportError(format!("WebSocket handshake with {} failed: {}", peer, e)))?;

    info!("[{}] Connection opened from {}", conn_id, peer);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Inbound frames and interrupts
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
    let (cancel_tx, cancel_rx) = watch::channel(None);

    let reader_id = conn_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if ClientMessage::is_stop(&text) {
                        let _ = cancel_tx.send(Some(Interrupt::Stop));
                    }
                    if input_tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    debug!("[{}] Ignoring binary frame ({} bytes)", reader_id, data.len());
                }
                Ok(Message::Close(_)) => {
                    info!("[{}] Connection closed by client", reader_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[{}] WebSocket error: {}", reader_id, e);
                    break;
                }
            }
        }
        let _ = cancel_tx.send(Some(Interrupt::Close));
    });

    // Outbound messages
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let max_failures = handler.config().max_send_failures.max(1);
    let writer_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut failures = 0u32;
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("[{}] {}", writer_id, e);
                    continue;
                }
            };

            match ws_tx.send(Message::Text(text)).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(
                        "[{}] Failed to send message ({}/{}): {}",
                        writer_id, failures, max_failures, e
                    );
                    if failures >= max_failures {
                        error!("[{}] Too many send failures, closing", writer_id);
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut ctx = ConnectionContext {
        id: conn_id,
        outbound: out_tx,
        events: events_tx,
        cancel: cancel_rx,
    };

    loop {
        tokio::select! {
            text = input_rx.recv() => match text {
                Some(text) => handler.handle_text(&mut ctx, &text).await,
                None => break,
            },
            Some(event) = events_rx.recv() => {
                handler.handle_engine_event(&mut ctx, event).await;
            }
            _ = ctx.outbound.closed() => {
                debug!("[{}] Writer gone, stopping", ctx.id);
                break;
            }
            _ = shutdown.recv() => {
                info!("[{}] Server shutting down", ctx.id);
                break;
            }
        }
    }

    handler.teardown(&mut ctx, false).await;
    reader.abort();

    let conn_id = ctx.id.clone();
    drop(ctx);
    if let Err(e) = writer.await {
        debug!("[{}] Writer task ended abnormally: {}", conn_id, e);
    }

    info!("[{}] Connection closed", conn_id);
    Ok(())
}
