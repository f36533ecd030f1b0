//! Application layer - session group, listeners and registration upkeep
//!
//! This layer wires the session state machine to a transport and a timer:
//! - Routing transport events to the owning session
//! - Delivering listener callbacks outside the group lock
//! - Keeping the endpoint registered, with backoff and NAT keepalive

pub mod group;
pub mod keepalive;
pub mod listener;
pub mod registration;

pub use group::{SipSession, SipSessionGroup};
pub use keepalive::is_behind_nat;
pub use listener::{NullListener, SessionListener};
pub use registration::Backoff;
