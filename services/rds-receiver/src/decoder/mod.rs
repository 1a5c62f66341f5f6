//! RDS decoding via redsea
//!
//! redsea emits one JSON object per RDS group; the core treats each object as
//! opaque apart from the identifying fields.

mod message;
mod session;

pub use message::{pty_name, DecodedMessage};
pub use session::{ListenReport, ListenSession, SessionEnd};
