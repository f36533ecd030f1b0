//! SIP message adapter built on rsip

pub mod message;

pub use message::{SipMessage, SipRequest, SipResponse};
