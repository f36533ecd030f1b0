//! Wakeup timer - refresh, backoff and keepalive scheduling

pub mod alarm;
pub mod wakeup;

pub use alarm::{TokioAlarm, WakeAlarm};
pub use wakeup::{WakeupCallback, WakeupTimer};
