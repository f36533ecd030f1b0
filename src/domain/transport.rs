//! Transport port
//!
//! The transaction/dialog layer is an external collaborator: the session core
//! hands it commands and consumes the events it emits. Everything here is the
//! boundary contract; implementations live in the infrastructure layer.

use crate::domain::shared::value_objects::{
    CallId, Credentials, PeerProfile, SipProfile, SipUri, TransactionId,
};
use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No route to the server, or its name does not resolve
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("No usable transaction: {0}")]
    NoTransaction(String),

    #[error("Transport closed")]
    Closed,
}

/// SIP method types the session core reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    /// Parse a method token as it appears in a request line or CSeq
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque dialog handle owned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dialog {
    pub call_id: CallId,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl Dialog {
    pub fn new(call_id: CallId, local_tag: impl Into<String>) -> Self {
        Self {
            call_id,
            local_tag: local_tag.into(),
            remote_tag: None,
        }
    }
}

/// An outstanding request we sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTransaction {
    pub id: TransactionId,
    pub method: SipMethod,
    pub call_id: CallId,
}

/// An inbound request we are (or will be) responding to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTransaction {
    pub id: TransactionId,
    pub method: SipMethod,
    pub call_id: CallId,
}

/// Inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub method: SipMethod,
    pub call_id: CallId,
    /// Server transaction the request belongs to (top Via branch)
    pub transaction: TransactionId,
    /// Originator, from the From header
    pub from: PeerProfile,
    pub body: Bytes,
    pub dialog: Option<Dialog>,
}

impl RequestEvent {
    pub fn is(&self, method: SipMethod) -> bool {
        self.method == method
    }
}

/// Inbound response to a request we sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEvent {
    pub status: u16,
    pub reason: String,
    /// Method of the request this response answers (from CSeq)
    pub method: SipMethod,
    pub call_id: CallId,
    pub transaction: TransactionId,
    pub body: Bytes,
    pub dialog: Option<Dialog>,
    /// `Expires` header
    pub expires: Option<u32>,
    /// `expires` parameter of the Contact header
    pub contact_expires: Option<u32>,
    /// `Min-Expires` header
    pub min_expires: Option<u32>,
    /// Realm of the digest challenge in a 401/407
    pub realm: Option<String>,
}

/// Registration lifetime used when the registrar does not state one
pub const DEFAULT_EXPIRY_SECONDS: u32 = 3600;

impl ResponseEvent {
    pub fn new(status: u16, reason: impl Into<String>, method: SipMethod, call_id: CallId) -> Self {
        Self {
            status,
            reason: reason.into(),
            method,
            call_id,
            transaction: TransactionId::generate(),
            body: Bytes::new(),
            dialog: None,
            expires: None,
            contact_expires: None,
            min_expires: None,
            realm: None,
        }
    }

    pub fn with_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn is_response_to(&self, method: SipMethod) -> bool {
        self.method == method
    }

    /// Registration lifetime granted by the registrar.
    ///
    /// The Contact `expires` parameter wins unless the `Expires` header is
    /// shorter; a missing or zero value falls back to one hour, and
    /// `Min-Expires` acts as a floor.
    pub fn negotiated_expiry(&self) -> u32 {
        let mut time = self.contact_expires;
        if let Some(expires) = self.expires {
            if time.map_or(true, |t| t > expires) {
                time = Some(expires);
            }
        }
        let mut time = match time {
            Some(t) if t > 0 => t,
            _ => DEFAULT_EXPIRY_SECONDS,
        };
        if let Some(min) = self.min_expires {
            time = time.max(min);
        }
        time
    }
}

/// A client or server transaction timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub transaction: TransactionId,
    pub call_id: CallId,
    pub is_server: bool,
}

/// A transaction reached its terminated state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTerminatedEvent {
    pub transaction: TransactionId,
    pub call_id: CallId,
    pub is_server: bool,
}

/// Everything the transport delivers to the session core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    DialogTerminated(Dialog),
    TransactionTerminated(TransactionTerminatedEvent),
}

impl TransportEvent {
    /// Dialog-matching key of the event
    pub fn key(&self) -> &CallId {
        match self {
            TransportEvent::Request(e) => &e.call_id,
            TransportEvent::Response(e) => &e.call_id,
            TransportEvent::Timeout(e) => &e.call_id,
            TransportEvent::DialogTerminated(d) => &d.call_id,
            TransportEvent::TransactionTerminated(e) => &e.call_id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            TransportEvent::Request(e) => format!("{} request", e.method),
            TransportEvent::Response(e) => format!("{} {} response", e.status, e.method),
            TransportEvent::Timeout(e) => format!("timeout of {}", e.transaction),
            TransportEvent::DialogTerminated(_) => "dialog terminated".to_string(),
            TransportEvent::TransactionTerminated(e) => {
                format!("transaction {} terminated", e.transaction)
            }
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Command sink of the transaction/dialog layer.
///
/// Every command is fire-and-forget: it hands back the handles the core needs
/// for correlation and never waits for the peer.
#[cfg_attr(test, mockall::automock)]
pub trait SipTransport: Send + Sync {
    /// REGISTER the profile's address-of-record for `expiry` seconds
    fn send_register(
        &self,
        profile: &SipProfile,
        tag: &str,
        expiry: u32,
    ) -> TransportResult<ClientTransaction>;

    /// Start a new dialog with an INVITE
    fn send_invite(
        &self,
        caller: &SipProfile,
        callee: &SipUri,
        offer: &Bytes,
        tag: &str,
    ) -> TransportResult<(ClientTransaction, Dialog)>;

    /// INVITE within an established dialog
    fn send_reinvite(&self, dialog: &Dialog, offer: &Bytes) -> TransportResult<ClientTransaction>;

    fn send_cancel(&self, transaction: &ClientTransaction) -> TransportResult<()>;

    fn send_bye(&self, dialog: &Dialog) -> TransportResult<()>;

    /// Answer `request` with a bodiless final or provisional response
    fn send_response(&self, request: &RequestEvent, status: u16) -> TransportResult<()>;

    /// 180 Ringing for an inbound INVITE
    fn send_ringing(&self, request: &RequestEvent, tag: &str) -> TransportResult<ServerTransaction>;

    /// 200 OK with an answer for an inbound INVITE
    fn send_invite_ok(
        &self,
        request: &RequestEvent,
        profile: &SipProfile,
        answer: &Bytes,
        tag: &str,
        transaction: &ServerTransaction,
    ) -> TransportResult<Dialog>;

    fn send_invite_ack(&self, response: &ResponseEvent, dialog: &Dialog) -> TransportResult<()>;

    /// Re-send the challenged request with credentials
    fn handle_challenge(
        &self,
        response: &ResponseEvent,
        credentials: &Credentials,
    ) -> TransportResult<ClientTransaction>;

    /// Out-of-dialog no-op (OPTIONS) that refreshes the NAT binding
    fn send_keepalive(&self, profile: &SipProfile) -> TransportResult<()>;

    fn terminate_dialog(&self, dialog: &Dialog) -> TransportResult<()>;

    /// Address the transport is bound to
    fn local_address(&self) -> IpAddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_ok() -> ResponseEvent {
        ResponseEvent::new(200, "OK", SipMethod::Register, CallId::from("reg-1"))
    }

    #[test]
    fn test_negotiated_expiry_defaults_to_one_hour() {
        assert_eq!(register_ok().negotiated_expiry(), 3600);

        let mut zero = register_ok();
        zero.expires = Some(0);
        assert_eq!(zero.negotiated_expiry(), 3600);
    }

    #[test]
    fn test_negotiated_expiry_prefers_shorter_header() {
        let mut response = register_ok();
        response.contact_expires = Some(1800);
        response.expires = Some(600);
        assert_eq!(response.negotiated_expiry(), 600);

        response.expires = Some(3600);
        assert_eq!(response.negotiated_expiry(), 1800);
    }

    #[test]
    fn test_negotiated_expiry_respects_min_expires() {
        let mut response = register_ok().with_expires(30);
        response.min_expires = Some(120);
        assert_eq!(response.negotiated_expiry(), 120);
    }

    #[test]
    fn test_event_key() {
        let event = TransportEvent::Response(register_ok());
        assert_eq!(event.key().as_str(), "reg-1");
    }

    #[test]
    fn test_method_tokens() {
        assert_eq!(SipMethod::from_token("invite"), Some(SipMethod::Invite));
        assert_eq!(SipMethod::from_token(" BYE "), Some(SipMethod::Bye));
        assert_eq!(SipMethod::from_token("SUBSCRIBE"), None);
        assert_eq!(SipMethod::Cancel.to_string(), "CANCEL");
    }
}
