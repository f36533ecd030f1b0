//! SIP message types and conversion into transport events

use crate::domain::shared::value_objects::{CallId, PeerProfile, SipUri, TransactionId};
use crate::domain::shared::{Result, UaError};
use crate::domain::transport::{Dialog, RequestEvent, ResponseEvent, SipMethod, TransportEvent};
use bytes::Bytes;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Headers, Request, Response};

fn malformed(e: rsip::Error) -> UaError {
    UaError::Message(e.to_string())
}

/// Call-ID shared by requests and responses
fn call_id_of(message: &impl HeadersExt) -> Result<CallId> {
    Ok(CallId::new(message.call_id_header().map_err(malformed)?.value()))
}

/// Top Via branch
fn transaction_of(message: &impl HeadersExt) -> Result<TransactionId> {
    message
        .transaction_id()
        .map_err(malformed)?
        .map(|branch| TransactionId::from_branch(branch.value()))
        .ok_or_else(|| UaError::Message("missing Via branch".to_string()))
}

fn from_tag_of(message: &impl HeadersExt) -> Result<Option<String>> {
    let from = message.from_header().map_err(malformed)?.typed().map_err(malformed)?;
    Ok(from.tag().map(|tag| tag.value().to_string()))
}

fn to_tag_of(message: &impl HeadersExt) -> Result<Option<String>> {
    let to = message.to_header().map_err(malformed)?.typed().map_err(malformed)?;
    Ok(to.tag().map(|tag| tag.value().to_string()))
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let request = rsip::Request::try_from(data).map_err(malformed)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_token(&self.inner.method.to_string())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Result<CallId> {
        call_id_of(&self.inner)
    }

    pub fn transaction(&self) -> Result<TransactionId> {
        transaction_of(&self.inner)
    }

    pub fn from_tag(&self) -> Result<Option<String>> {
        from_tag_of(&self.inner)
    }

    pub fn to_tag(&self) -> Result<Option<String>> {
        to_tag_of(&self.inner)
    }

    /// Originator as a peer profile
    pub fn from_peer(&self) -> Result<PeerProfile> {
        let from = self
            .inner
            .from_header()
            .map_err(malformed)?
            .typed()
            .map_err(malformed)?;
        let display_name = from
            .display_name
            .as_deref()
            .map(|name| name.trim_matches('"').trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Ok(PeerProfile::new(SipUri::try_from(&from.uri)?, display_name))
    }

    /// Convert into the event the session core consumes
    pub fn into_event(self) -> Result<TransportEvent> {
        let method = self.method().ok_or_else(|| {
            UaError::Message(format!("unsupported method {}", self.inner.method))
        })?;
        let call_id = self.call_id()?;
        let transaction = self.transaction()?;

        // In-dialog requests carry our tag in To
        let dialog = match self.to_tag()? {
            Some(local_tag) => Some(Dialog {
                call_id: call_id.clone(),
                local_tag,
                remote_tag: self.from_tag()?,
            }),
            None => None,
        };

        Ok(TransportEvent::Request(RequestEvent {
            method,
            from: self.from_peer()?,
            call_id,
            transaction,
            body: Bytes::from(self.inner.body),
            dialog,
        }))
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let response = rsip::Response::try_from(data).map_err(malformed)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    /// Reason phrase from the status line
    pub fn reason(&self) -> String {
        let rendered = self.inner.to_string();
        rendered
            .lines()
            .next()
            .and_then(|line| line.splitn(3, ' ').nth(2))
            .map(|r| r.trim().to_string())
            .unwrap_or_default()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Result<CallId> {
        call_id_of(&self.inner)
    }

    pub fn transaction(&self) -> Result<TransactionId> {
        transaction_of(&self.inner)
    }

    /// Method named in CSeq
    pub fn cseq_method(&self) -> Result<SipMethod> {
        let cseq = self
            .inner
            .cseq_header()
            .map_err(malformed)?
            .typed()
            .map_err(malformed)?;
        SipMethod::from_token(&cseq.method.to_string())
            .ok_or_else(|| UaError::Message(format!("unsupported CSeq method {}", cseq.method)))
    }

    pub fn expires(&self) -> Option<u32> {
        self.inner.expires_header().and_then(|h| h.seconds().ok())
    }

    pub fn min_expires(&self) -> Option<u32> {
        self.inner.min_expires_header().and_then(|h| h.seconds().ok())
    }

    /// `expires` parameter of the Contact header
    pub fn contact_expires(&self) -> Option<u32> {
        let contact = self.inner.contact_header().ok()?.typed().ok()?;
        contact.expires().and_then(|e| e.seconds().ok())
    }

    /// Realm of a WWW-Authenticate or Proxy-Authenticate challenge
    pub fn realm(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|header| match header {
            Header::WwwAuthenticate(h) => h.typed().ok().map(|w| w.realm),
            Header::ProxyAuthenticate(h) => h.typed().ok().map(|p| p.0.realm),
            _ => None,
        })
    }

    pub fn into_event(self) -> Result<TransportEvent> {
        let method = self.cseq_method()?;
        let call_id = self.call_id()?;
        let transaction = self.transaction()?;

        let dialog = match (from_tag_of(&self.inner)?, to_tag_of(&self.inner)?) {
            (Some(local_tag), Some(remote_tag)) => Some(Dialog {
                call_id: call_id.clone(),
                local_tag,
                remote_tag: Some(remote_tag),
            }),
            _ => None,
        };

        let mut event = ResponseEvent::new(self.status_code(), self.reason(), method, call_id)
            .with_transaction(transaction);
        event.expires = self.expires();
        event.min_expires = self.min_expires();
        event.contact_expires = self.contact_expires();
        event.realm = self.realm();
        event.dialog = dialog;
        event.body = Bytes::from(self.inner.body);
        Ok(TransportEvent::Response(event))
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(UaError::Message(
            "could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn into_event(self) -> Result<TransportEvent> {
        match self {
            SipMessage::Request(req) => req.into_event(),
            SipMessage::Response(resp) => resp.into_event(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER_OK: &[u8] = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 REGISTER\r\n\
        Contact: <sip:alice@192.168.1.100:5060>;expires=600\r\n\
        Expires: 1800\r\n\
        Content-Length: 0\r\n\r\n";

    const INVITE: &[u8] = b"INVITE sip:alice@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKnashds8\r\n\
        From: \"Bob\" <sip:bob@biloxi.example.com>;tag=8321234356\r\n\
        To: <sip:alice@example.com>\r\n\
        Call-ID: 3848276298220188511@biloxi.example.com\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:bob@203.0.113.9>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 5\r\n\r\n\
        v=0\r\n";

    #[test]
    fn test_register_response_event() {
        let msg = SipMessage::parse(REGISTER_OK).unwrap();
        assert!(msg.is_response());

        let TransportEvent::Response(event) = msg.into_event().unwrap() else {
            panic!("expected a response event");
        };
        assert_eq!(event.status, 200);
        assert_eq!(event.method, SipMethod::Register);
        assert_eq!(event.call_id.as_str(), "a84b4c76e66710@pc33.example.com");
        assert_eq!(event.transaction, TransactionId::from_branch("z9hG4bK776asdhds"));
        assert_eq!(event.expires, Some(1800));
        assert_eq!(event.contact_expires, Some(600));
        assert_eq!(event.negotiated_expiry(), 600);

        let dialog = event.dialog.unwrap();
        assert_eq!(dialog.local_tag, "1928301774");
        assert_eq!(dialog.remote_tag.as_deref(), Some("a6c85cf"));
    }

    #[test]
    fn test_invite_request_event() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert!(msg.is_request());

        let TransportEvent::Request(event) = msg.into_event().unwrap() else {
            panic!("expected a request event");
        };
        assert_eq!(event.method, SipMethod::Invite);
        assert_eq!(event.from.uri().user(), Some("bob"));
        assert_eq!(event.from.display_name(), Some("Bob"));
        assert_eq!(event.body.as_ref(), b"v=0\r\n");
        assert!(event.dialog.is_none(), "initial INVITE has no To tag");
    }

    #[test]
    fn test_from_without_user_part() {
        let invite = String::from_utf8_lossy(INVITE).replace(
            "From: \"Bob\" <sip:bob@biloxi.example.com>;tag=8321234356",
            "From: <sip:203.0.113.9>;tag=1",
        );

        let TransportEvent::Request(event) =
            SipMessage::parse(invite.as_bytes()).unwrap().into_event().unwrap()
        else {
            panic!("expected a request event");
        };
        assert_eq!(event.from.uri().user(), None);
        assert_eq!(event.from.uri().host(), "203.0.113.9");
        assert_eq!(event.from.display_name(), None);
    }

    #[test]
    fn test_in_dialog_request_carries_tags() {
        let bye = b"BYE sip:alice@192.168.1.100 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKbye1\r\n\
            From: <sip:bob.smith@biloxi.example.com>;tag=8321234356\r\n\
            To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
            Call-ID: 3848276298220188511@biloxi.example.com\r\n\
            CSeq: 2 BYE\r\n\
            Content-Length: 0\r\n\r\n";

        let TransportEvent::Request(event) = SipMessage::parse(bye).unwrap().into_event().unwrap() else {
            panic!("expected a request event");
        };
        assert_eq!(event.method, SipMethod::Bye);
        assert_eq!(event.transaction, TransactionId::from_branch("z9hG4bKbye1"));
        assert_eq!(event.from.uri().user(), Some("bob.smith"));
        let dialog = event.dialog.unwrap();
        assert_eq!(dialog.local_tag, "a6c85cf");
        assert_eq!(dialog.remote_tag.as_deref(), Some("8321234356"));
    }

    #[test]
    fn test_challenge_realm() {
        let challenge = b"SIP/2.0 407 Proxy Authentication Required\r\n\
            Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKinv1\r\n\
            From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
            To: <sip:bob@example.com>;tag=b77\r\n\
            Call-ID: c1@pc33.example.com\r\n\
            CSeq: 1 INVITE\r\n\
            Proxy-Authenticate: Digest realm=\"example.com\", nonce=\"f84f1cec41e6cbe5aea9c8e88d359\"\r\n\
            Content-Length: 0\r\n\r\n";

        let TransportEvent::Response(event) =
            SipMessage::parse(challenge).unwrap().into_event().unwrap()
        else {
            panic!("expected a response event");
        };
        assert_eq!(event.status, 407);
        assert_eq!(event.method, SipMethod::Invite);
        assert_eq!(event.realm.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            SipMessage::parse(b"hello world"),
            Err(UaError::Message(_))
        ));
    }
}
