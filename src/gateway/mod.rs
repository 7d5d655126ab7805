//! Gateway: sessions that aggregate several backend links behind one
//! client-facing JSON-RPC surface.
//!
//! A `SessionRegistry` creates sessions on demand; each `Session` owns one
//! link per enabled provider, a merged tool catalog, and the set of
//! streaming endpoints its replies are broadcast to.

pub mod dispatch;
pub mod errors;
pub mod registry;
pub mod session;

pub use errors::GatewayError;
pub use registry::SessionRegistry;
pub use session::{Session, SessionOptions, SessionPhase, SessionStatus};
