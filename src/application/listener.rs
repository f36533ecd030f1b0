//! Session listener
//!
//! Callbacks a session reports through. Every method has an empty default,
//! so implementors only override what they care about; `NullListener` keeps
//! all of them. A closure taking `(&SipSession, &ListenerEvent)` is a
//! listener too.

use super::group::SipSession;
use crate::domain::session::{ErrorCode, ListenerEvent};
use crate::domain::shared::value_objects::PeerProfile;
use bytes::Bytes;

pub trait SessionListener: Send + Sync {
    /// INVITE sent
    fn on_calling(&self, _session: &SipSession) {}

    /// Inbound call offered
    fn on_ringing(&self, _session: &SipSession, _peer: &PeerProfile, _offer: &Bytes) {}

    /// Peer is alerting
    fn on_ringing_back(&self, _session: &SipSession) {}

    fn on_call_established(&self, _session: &SipSession, _sdp: &Bytes) {}

    fn on_call_ended(&self, _session: &SipSession) {}

    /// Peer answered 486 before the call was up
    fn on_call_busy(&self, _session: &SipSession) {}

    /// Peer re-negotiated the call
    fn on_call_changed(&self, _session: &SipSession, _sdp: &Bytes) {}

    fn on_error(&self, _session: &SipSession, _code: ErrorCode, _message: &str) {}

    fn on_registering(&self, _session: &SipSession) {}

    /// `duration` is the granted expiry in seconds, or -1 after deregistering
    fn on_registration_done(&self, _session: &SipSession, _duration: i32) {}

    fn on_registration_failed(&self, _session: &SipSession, _code: ErrorCode, _message: &str) {}

    fn on_registration_timeout(&self, _session: &SipSession) {}
}

/// Listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl SessionListener for NullListener {}

impl<F> SessionListener for F
where
    F: Fn(&SipSession, &ListenerEvent) + Send + Sync,
{
    fn on_calling(&self, session: &SipSession) {
        self(session, &ListenerEvent::Calling)
    }

    fn on_ringing(&self, session: &SipSession, peer: &PeerProfile, offer: &Bytes) {
        self(
            session,
            &ListenerEvent::Ringing {
                peer: peer.clone(),
                offer: offer.clone(),
            },
        )
    }

    fn on_ringing_back(&self, session: &SipSession) {
        self(session, &ListenerEvent::RingingBack)
    }

    fn on_call_established(&self, session: &SipSession, sdp: &Bytes) {
        self(session, &ListenerEvent::CallEstablished { sdp: sdp.clone() })
    }

    fn on_call_ended(&self, session: &SipSession) {
        self(session, &ListenerEvent::CallEnded)
    }

    fn on_call_busy(&self, session: &SipSession) {
        self(session, &ListenerEvent::CallBusy)
    }

    fn on_call_changed(&self, session: &SipSession, sdp: &Bytes) {
        self(session, &ListenerEvent::CallChanged { sdp: sdp.clone() })
    }

    fn on_error(&self, session: &SipSession, code: ErrorCode, message: &str) {
        self(
            session,
            &ListenerEvent::Error {
                code,
                message: message.to_string(),
            },
        )
    }

    fn on_registering(&self, session: &SipSession) {
        self(session, &ListenerEvent::Registering)
    }

    fn on_registration_done(&self, session: &SipSession, duration: i32) {
        self(session, &ListenerEvent::RegistrationDone { duration })
    }

    fn on_registration_failed(&self, session: &SipSession, code: ErrorCode, message: &str) {
        self(
            session,
            &ListenerEvent::RegistrationFailed {
                code,
                message: message.to_string(),
            },
        )
    }

    fn on_registration_timeout(&self, session: &SipSession) {
        self(session, &ListenerEvent::RegistrationTimeout)
    }
}

impl ListenerEvent {
    /// Invoke the matching callback on `listener`
    pub fn deliver(&self, listener: &dyn SessionListener, session: &SipSession) {
        match self {
            ListenerEvent::Calling => listener.on_calling(session),
            ListenerEvent::Ringing { peer, offer } => listener.on_ringing(session, peer, offer),
            ListenerEvent::RingingBack => listener.on_ringing_back(session),
            ListenerEvent::CallEstablished { sdp } => listener.on_call_established(session, sdp),
            ListenerEvent::CallEnded => listener.on_call_ended(session),
            ListenerEvent::CallBusy => listener.on_call_busy(session),
            ListenerEvent::CallChanged { sdp } => listener.on_call_changed(session, sdp),
            ListenerEvent::Error { code, message } => listener.on_error(session, *code, message),
            ListenerEvent::Registering => listener.on_registering(session),
            ListenerEvent::RegistrationDone { duration } => {
                listener.on_registration_done(session, *duration)
            }
            ListenerEvent::RegistrationFailed { code, message } => {
                listener.on_registration_failed(session, *code, message)
            }
            ListenerEvent::RegistrationTimeout => listener.on_registration_timeout(session),
        }
    }
}
