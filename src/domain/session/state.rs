//! Session states

use std::fmt;

/// Session State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Idle; ready to call or register
    Ready,
    /// REGISTER sent
    Registering,
    /// REGISTER with zero expiry sent
    Deregistering,
    /// INVITE sent, no ringing yet
    OutgoingCall,
    /// Peer is alerting
    OutgoingCallRingBack,
    /// CANCEL sent for our INVITE
    OutgoingCallCanceling,
    /// INVITE received, 180 sent
    IncomingCall,
    /// 200 OK sent, waiting for ACK
    IncomingCallAnswering,
    /// Dialog confirmed, media may flow
    InCall,
    /// Peer re-INVITE accepted, waiting for ACK
    InCallAnswering,
    /// Our re-INVITE sent
    InCallChanging,
    /// CANCEL sent for our re-INVITE
    InCallChangingCanceling,
}

impl SessionState {
    /// Check if state is part of a registration exchange
    pub fn is_registration(&self) -> bool {
        matches!(self, SessionState::Registering | SessionState::Deregistering)
    }

    /// Check if a call is being set up, is up, or is being torn down
    pub fn is_call(&self) -> bool {
        !matches!(
            self,
            SessionState::Ready | SessionState::Registering | SessionState::Deregistering
        )
    }

    /// Check if state is an outbound setup state
    pub fn is_outgoing(&self) -> bool {
        matches!(
            self,
            SessionState::OutgoingCall
                | SessionState::OutgoingCallRingBack
                | SessionState::OutgoingCallCanceling
        )
    }

    /// Check if the dialog has been confirmed
    pub fn is_in_call(&self) -> bool {
        matches!(
            self,
            SessionState::InCall
                | SessionState::InCallAnswering
                | SessionState::InCallChanging
                | SessionState::InCallChangingCanceling
        )
    }

    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Ready => "Ready",
            SessionState::Registering => "Registering",
            SessionState::Deregistering => "Deregistering",
            SessionState::OutgoingCall => "OutgoingCall",
            SessionState::OutgoingCallRingBack => "OutgoingCallRingBack",
            SessionState::OutgoingCallCanceling => "OutgoingCallCanceling",
            SessionState::IncomingCall => "IncomingCall",
            SessionState::IncomingCallAnswering => "IncomingCallAnswering",
            SessionState::InCall => "InCall",
            SessionState::InCallAnswering => "InCallAnswering",
            SessionState::InCallChanging => "InCallChanging",
            SessionState::InCallChangingCanceling => "InCallChangingCanceling",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Ready
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        assert!(!SessionState::Ready.is_call());
        assert!(!SessionState::Registering.is_call());
        assert!(SessionState::Registering.is_registration());

        assert!(SessionState::OutgoingCallRingBack.is_outgoing());
        assert!(SessionState::OutgoingCallRingBack.is_call());
        assert!(!SessionState::OutgoingCallRingBack.is_in_call());

        assert!(SessionState::InCallChanging.is_in_call());
        assert!(!SessionState::IncomingCallAnswering.is_in_call());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::default(), SessionState::Ready);
        assert_eq!(SessionState::InCallChangingCanceling.to_string(), "InCallChangingCanceling");
    }
}
