//! Relay sessions and the table that owns them
//!
//! One session per signaling connection, keyed by connection id.

pub mod registry;
pub mod state;

pub use registry::{SessionHandle, SessionRegistry};
pub use state::{Session, SessionPhase, SessionState, SourceEndpoint, SourceKind};
