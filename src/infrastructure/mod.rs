//! Infrastructure layer - timers, transports and message adapters

pub mod sip;
pub mod timer;
pub mod transport;
