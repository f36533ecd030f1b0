//! Domain layer - the SIP session core
//!
//! This layer contains:
//! - Shared value objects and errors
//! - The transport port the core drives
//! - The per-dialog session state machine
//! - The session registry

pub mod registry;
pub mod session;
pub mod shared;
pub mod transport;

// Re-export commonly used types
pub use shared::{Result, UaError};
