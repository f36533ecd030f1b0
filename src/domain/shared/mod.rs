//! Shared kernel - identifiers, addresses and errors used by every component

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::UaError;
pub use result::Result;
pub use value_objects::*;
