//! Session aggregate - per-dialog SIP state machine

pub mod event;
pub mod fsm;
pub mod state;

pub use event::{ErrorCode, ListenerEvent, SessionEvent};
pub use fsm::{Effects, KeyChange, Notice, Session};
pub use state::SessionState;
