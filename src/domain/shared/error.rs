//! User-agent errors

use crate::domain::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UaError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Session group is closed")]
    GroupClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Wakeup timer has been stopped")]
    TimerStopped,

    #[error("Invalid SIP URI: {0}")]
    InvalidUri(String),

    #[error("Invalid SIP message: {0}")]
    Message(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}
