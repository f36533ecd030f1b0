//! Transport implementations

pub mod memory;

pub use memory::{RecordingTransport, TransportCommand};
