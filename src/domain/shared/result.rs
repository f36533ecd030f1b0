//! User-agent result type

use super::error::UaError;

/// Standard result type for user-agent operations
pub type Result<T> = std::result::Result<T, UaError>;
