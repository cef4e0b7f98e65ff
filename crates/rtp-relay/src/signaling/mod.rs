//! WebSocket signaling for relay clients
//!
//! JSON text frames discriminated by `id`: `offer`, `ice-candidate`, `stop`,
//! `start-recording` and `stop-recording` in; `answer`, `ice-candidate`,
//! `error`, `end-playback` and `connection-info` out.

mod connection;
mod events;
mod handler;
pub mod protocol;
mod server;

pub use events::{translate, EventAction};
pub use handler::{ConnectionContext, Interrupt, SignalingHandler};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{SignalingServer, SignalingServerHandle};
