//! Server side: policy-enforcing filesystem and per-channel sessions.

mod safe;
mod session;

pub use safe::{SafeFs, MAX_HANDLES};
pub use session::{run_session, serve_channel, SessionConfig};
