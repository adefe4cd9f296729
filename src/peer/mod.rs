//! Peer module
//!
//! Piece ownership bitfields, the per-connection wire session state
//! machine, and the session manager that owns all of them.

pub mod bitfield;
pub mod manager;
pub mod session;

pub use bitfield::Bitfield;
pub use manager::{ConnectionSlots, SessionManager};
pub use session::{PeerWireSession, SessionFlags, SessionRole, SessionState};
