//! Session inputs and outputs
//!
//! `SessionEvent` is everything a session state machine consumes: commands
//! from the application and events from the transport. `ListenerEvent` is
//! everything it reports back.

use crate::domain::shared::value_objects::{PeerProfile, SipUri};
use crate::domain::transport::{
    Dialog, RequestEvent, ResponseEvent, TimeoutEvent, TransactionTerminatedEvent, TransportEvent,
};
use bytes::Bytes;
use std::fmt;

/// Input of the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Place a call, or change an established one
    MakeCall { peer: SipUri, offer: Bytes },
    /// Accept the ringing inbound call
    AnswerCall { answer: Bytes },
    /// Re-negotiate an established call (hold/resume)
    ChangeCall { offer: Bytes },
    /// Hang up, reject or cancel, depending on state
    EndCall,
    Register { expiry: u32 },
    Deregister,
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    DialogTerminated(Dialog),
    TransactionTerminated(TransactionTerminatedEvent),
    /// The data connection went away
    ConnectionLost,
}

impl SessionEvent {
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            SessionEvent::MakeCall { .. }
                | SessionEvent::AnswerCall { .. }
                | SessionEvent::ChangeCall { .. }
                | SessionEvent::EndCall
                | SessionEvent::Register { .. }
                | SessionEvent::Deregister
        )
    }

    pub fn name(&self) -> String {
        match self {
            SessionEvent::MakeCall { peer, .. } => format!("MakeCall({})", peer),
            SessionEvent::AnswerCall { .. } => "AnswerCall".to_string(),
            SessionEvent::ChangeCall { .. } => "ChangeCall".to_string(),
            SessionEvent::EndCall => "EndCall".to_string(),
            SessionEvent::Register { expiry } => format!("Register({})", expiry),
            SessionEvent::Deregister => "Deregister".to_string(),
            SessionEvent::Request(e) => format!("{} request", e.method),
            SessionEvent::Response(e) => format!("{} {} response", e.status, e.method),
            SessionEvent::Timeout(e) => format!("timeout of {}", e.transaction),
            SessionEvent::DialogTerminated(_) => "dialog terminated".to_string(),
            SessionEvent::TransactionTerminated(e) => {
                format!("transaction {} terminated", e.transaction)
            }
            SessionEvent::ConnectionLost => "connection lost".to_string(),
        }
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Request(e) => SessionEvent::Request(e),
            TransportEvent::Response(e) => SessionEvent::Response(e),
            TransportEvent::Timeout(e) => SessionEvent::Timeout(e),
            TransportEvent::DialogTerminated(d) => SessionEvent::DialogTerminated(d),
            TransportEvent::TransactionTerminated(e) => SessionEvent::TransactionTerminated(e),
        }
    }
}

/// Failure categories reported through `on_error` / `on_registration_failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The transport could not send
    SocketError,
    /// 5xx from the server
    ServerError,
    /// A transaction ended before its final response
    TransactionTerminated,
    /// 4xx we do not otherwise classify
    ClientError,
    TimeOut,
    InvalidRemoteUri,
    PeerNotReachable,
    InvalidCredentials,
    InProgress,
    DataConnectionLost,
    CrossDomainAuthentication,
    ServerUnreachable,
}

impl ErrorCode {
    /// Classify a final error response
    pub fn from_status(status: u16) -> Self {
        match status {
            403 | 404 | 406 | 410 | 480 | 488 => ErrorCode::PeerNotReachable,
            414 | 484 | 485 => ErrorCode::InvalidRemoteUri,
            408 => ErrorCode::TimeOut,
            s if s < 500 => ErrorCode::ClientError,
            _ => ErrorCode::ServerError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::SocketError => "SOCKET_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::TransactionTerminated => "TRANSACTION_TERMINATED",
            ErrorCode::ClientError => "CLIENT_ERROR",
            ErrorCode::TimeOut => "TIME_OUT",
            ErrorCode::InvalidRemoteUri => "INVALID_REMOTE_URI",
            ErrorCode::PeerNotReachable => "PEER_NOT_REACHABLE",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::InProgress => "IN_PROGRESS",
            ErrorCode::DataConnectionLost => "DATA_CONNECTION_LOST",
            ErrorCode::CrossDomainAuthentication => "CROSS_DOMAIN_AUTHENTICATION",
            ErrorCode::ServerUnreachable => "SERVER_UNREACHABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output of the session state machine, one per listener callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Calling,
    Ringing { peer: PeerProfile, offer: Bytes },
    RingingBack,
    CallEstablished { sdp: Bytes },
    CallEnded,
    CallBusy,
    CallChanged { sdp: Bytes },
    Error { code: ErrorCode, message: String },
    Registering,
    /// Seconds granted, or -1 after a deregistration
    RegistrationDone { duration: i32 },
    RegistrationFailed { code: ErrorCode, message: String },
    RegistrationTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::CallId;
    use crate::domain::transport::Dialog;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from_status(404), ErrorCode::PeerNotReachable);
        assert_eq!(ErrorCode::from_status(484), ErrorCode::InvalidRemoteUri);
        assert_eq!(ErrorCode::from_status(408), ErrorCode::TimeOut);
        assert_eq!(ErrorCode::from_status(302), ErrorCode::ClientError);
        assert_eq!(ErrorCode::from_status(415), ErrorCode::ClientError);
        assert_eq!(ErrorCode::from_status(503), ErrorCode::ServerError);
    }

    #[test]
    fn test_transport_event_conversion() {
        let dialog = Dialog::new(CallId::from("abc"), "tag");
        let event = SessionEvent::from(TransportEvent::DialogTerminated(dialog.clone()));
        assert_eq!(event, SessionEvent::DialogTerminated(dialog));
        assert!(!event.is_command());
        assert!(SessionEvent::EndCall.is_command());
    }
}
