//! Shared Session Types

mod peer;
mod state;

pub use peer::{is_private_addr, only_private, PeerRecord, PeerState};
pub use state::{PeerStateTable, SessionState, SessionStateCell, TransitionDecision};
