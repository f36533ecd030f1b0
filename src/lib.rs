//! sipua - SIP user-agent session core
//!
//! Call setup, modification and teardown plus endpoint registration for one
//! local identity, multiplexed over a single transport:
//! - `domain`: the per-dialog session state machine and its registry
//! - `application`: the session group, listeners, auto-registration, keepalive
//! - `infrastructure`: wakeup timer, in-memory transport, rsip message adapter

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{NullListener, SessionListener, SipSession, SipSessionGroup};
pub use domain::shared::error::UaError;
pub use domain::shared::result::Result;
