//! Session state machine
//!
//! One `Session` per dialog. `process` consumes a `SessionEvent`, issues
//! transport commands and records what happened in an `Effects` buffer:
//! listener notifications, registry key changes and sessions spawned for
//! inbound calls. The caller applies the effects once the event is done, so
//! the state machine itself never touches shared state.

use super::event::{ErrorCode, ListenerEvent, SessionEvent};
use super::state::SessionState;
use crate::domain::shared::value_objects::{
    generate_tag, CallId, PeerProfile, SessionId, SipProfile, TransactionId,
};
use crate::domain::transport::{
    ClientTransaction, Dialog, RequestEvent, ResponseEvent, ServerTransaction, SipMethod,
    SipTransport, TransportError, TransportResult,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Challenges answered per request before giving up
const MAX_AUTH_RETRIES: u32 = 2;

/// Listener notification produced by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub session: SessionId,
    pub event: ListenerEvent,
}

/// Registry edit requested by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    Bind { session: SessionId, key: CallId },
    Unbind { session: SessionId, key: CallId },
}

/// Side effects of processing one event
#[derive(Debug, Default)]
pub struct Effects {
    notices: Vec<Notice>,
    key_changes: Vec<KeyChange>,
    spawned: Vec<Session>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&mut self, session: SessionId, event: ListenerEvent) {
        self.notices.push(Notice { session, event });
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn key_changes(&self) -> &[KeyChange] {
        &self.key_changes
    }

    pub fn spawned(&self) -> &[Session] {
        &self.spawned
    }

    /// Notifications addressed to one session, in order
    pub fn events_for(&self, session: SessionId) -> Vec<&ListenerEvent> {
        self.notices
            .iter()
            .filter(|n| n.session == session)
            .map(|n| &n.event)
            .collect()
    }

    pub fn into_parts(self) -> (Vec<Notice>, Vec<KeyChange>, Vec<Session>) {
        (self.notices, self.key_changes, self.spawned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Owns at most one dialog at a time
    Dialog,
    /// Unkeyed catch-all that turns new INVITEs into sessions
    Receiver,
}

/// Per-dialog SIP session
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    state: SessionState,
    local_profile: Arc<SipProfile>,
    /// Registry key while a transaction or dialog exists
    key: Option<CallId>,
    peer_profile: Option<PeerProfile>,
    dialog: Option<Dialog>,
    client_transaction: Option<ClientTransaction>,
    server_transaction: Option<ServerTransaction>,
    invite_received: Option<RequestEvent>,
    peer_session_description: Option<Bytes>,
    local_session_description: Option<Bytes>,
    auth_retry_count: u32,
}

impl Session {
    pub fn new(local_profile: Arc<SipProfile>) -> Self {
        Self {
            id: SessionId::new(),
            role: Role::Dialog,
            state: SessionState::Ready,
            local_profile,
            key: None,
            peer_profile: None,
            dialog: None,
            client_transaction: None,
            server_transaction: None,
            invite_received: None,
            peer_session_description: None,
            local_session_description: None,
            auth_retry_count: 0,
        }
    }

    /// Session that accepts unmatched inbound calls
    pub fn receiver(local_profile: Arc<SipProfile>) -> Self {
        Self {
            role: Role::Receiver,
            ..Self::new(local_profile)
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_receiver(&self) -> bool {
        self.role == Role::Receiver
    }

    /// Call-ID the session is currently registered under
    pub fn call_id(&self) -> Option<&CallId> {
        self.key.as_ref()
    }

    pub fn local_profile(&self) -> &Arc<SipProfile> {
        &self.local_profile
    }

    pub fn peer_profile(&self) -> Option<&PeerProfile> {
        self.peer_profile.as_ref()
    }

    pub fn dialog(&self) -> Option<&Dialog> {
        self.dialog.as_ref()
    }

    pub fn client_transaction(&self) -> Option<&ClientTransaction> {
        self.client_transaction.as_ref()
    }

    pub fn server_transaction(&self) -> Option<&ServerTransaction> {
        self.server_transaction.as_ref()
    }

    pub fn peer_session_description(&self) -> Option<&Bytes> {
        self.peer_session_description.as_ref()
    }

    /// Feed one event through the state machine.
    ///
    /// Returns whether the event was consumed. Transport failures are
    /// terminal for the session: it is reset and the failure reported once.
    pub fn process(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> bool {
        let before = self.state;
        let result = match self.role {
            Role::Receiver => self.process_as_receiver(event, transport, fx),
            Role::Dialog => self.process_in_dialog(event, transport, fx),
        };

        let processed = match result {
            Ok(processed) => processed,
            Err(e) => {
                self.on_transport_failure(event, e, fx);
                true
            }
        };

        if before != self.state {
            debug!("Session {}: {} -> {} on {}", self.id, before, self.state, event.name());
        } else if !processed && event.is_command() {
            warn!("Session {}: {} ignored in {}", self.id, event.name(), self.state);
        } else if !processed {
            debug!("Session {}: {} not processed in {}", self.id, event.name(), self.state);
        }
        processed
    }

    fn process_as_receiver(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        let SessionEvent::Request(request) = event else {
            return Ok(false);
        };

        match request.method {
            SipMethod::Invite => {
                let mut incoming = Session::new(self.local_profile.clone());
                incoming.accept_invite(request, transport, fx)?;
                info!(
                    "Incoming call {} from {}",
                    request.call_id,
                    request.from.uri()
                );
                fx.spawned.push(incoming);
                Ok(true)
            }
            SipMethod::Options => {
                transport.send_response(request, 200)?;
                Ok(true)
            }
            SipMethod::Cancel | SipMethod::Bye => {
                // No dialog owns it
                transport.send_response(request, 481)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Take ownership of a new inbound INVITE
    fn accept_invite(
        &mut self,
        request: &RequestEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<()> {
        let tag = generate_tag();
        let transaction = transport.send_ringing(request, &tag)?;

        self.dialog = Some(
            request
                .dialog
                .clone()
                .unwrap_or_else(|| Dialog::new(request.call_id.clone(), tag)),
        );
        self.server_transaction = Some(transaction);
        self.invite_received = Some(request.clone());
        self.peer_profile = Some(request.from.clone());
        if !request.body.is_empty() {
            self.peer_session_description = Some(request.body.clone());
        }
        self.bind(request.call_id.clone(), fx);
        self.state = SessionState::IncomingCall;

        fx.notify(
            self.id,
            ListenerEvent::Ringing {
                peer: request.from.clone(),
                offer: request.body.clone(),
            },
        );
        Ok(())
    }

    fn process_in_dialog(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Request(RequestEvent { dialog: Some(d), .. })
            | SessionEvent::Response(ResponseEvent { dialog: Some(d), .. }) => {
                self.dialog = Some(d.clone());
            }
            _ => {}
        }

        let processed = match self.state {
            SessionState::Ready => self.ready(event, transport, fx)?,
            SessionState::Registering | SessionState::Deregistering => {
                self.registering(event, transport, fx)?
            }
            SessionState::IncomingCall => self.incoming_call(event, transport, fx)?,
            SessionState::IncomingCallAnswering => {
                self.incoming_call_answering(event, transport, fx)?
            }
            SessionState::OutgoingCall | SessionState::OutgoingCallRingBack => {
                self.outgoing_call(event, transport, fx)?
            }
            SessionState::OutgoingCallCanceling => {
                self.outgoing_call_canceling(event, transport, fx)?
            }
            SessionState::InCall => self.in_call(event, transport, fx)?,
            SessionState::InCallAnswering => self.in_call_answering(event, transport, fx)?,
            SessionState::InCallChanging => self.in_call_changing(event, transport, fx)?,
            SessionState::InCallChangingCanceling => {
                self.in_call_changing_canceling(event, transport, fx)?
            }
        };

        if processed {
            Ok(true)
        } else {
            self.process_exceptions(event, transport, fx)
        }
    }

    fn ready(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::MakeCall { peer, offer } => {
                let (transaction, dialog) =
                    transport.send_invite(&self.local_profile, peer, offer, &generate_tag())?;
                self.peer_profile = Some(PeerProfile::from(peer.clone()));
                self.local_session_description = Some(offer.clone());
                self.bind(transaction.call_id.clone(), fx);
                self.dialog = Some(dialog);
                self.client_transaction = Some(transaction);
                self.auth_retry_count = 0;
                self.state = SessionState::OutgoingCall;
                fx.notify(self.id, ListenerEvent::Calling);
                Ok(true)
            }
            SessionEvent::Register { expiry } => {
                self.start_registration(*expiry, SessionState::Registering, transport, fx)?;
                Ok(true)
            }
            SessionEvent::Deregister => {
                self.start_registration(0, SessionState::Deregistering, transport, fx)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn start_registration(
        &mut self,
        expiry: u32,
        next: SessionState,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<()> {
        let transaction = transport.send_register(&self.local_profile, &generate_tag(), expiry)?;
        self.bind(transaction.call_id.clone(), fx);
        self.client_transaction = Some(transaction);
        self.auth_retry_count = 0;
        self.state = next;
        fx.notify(self.id, ListenerEvent::Registering);
        Ok(())
    }

    fn registering(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        let SessionEvent::Response(response) = event else {
            return Ok(false);
        };
        if !response.is_response_to(SipMethod::Register) {
            return Ok(false);
        }

        match response.status {
            100..=199 => {}
            200..=299 => {
                let duration = if self.state == SessionState::Registering {
                    i32::try_from(response.negotiated_expiry()).unwrap_or(i32::MAX)
                } else {
                    -1
                };
                self.reset(fx);
                fx.notify(self.id, ListenerEvent::RegistrationDone { duration });
            }
            401 | 407 => self.handle_authentication(response, transport, fx)?,
            status => {
                let code = if status >= 500 {
                    ErrorCode::ServerError
                } else {
                    ErrorCode::from_status(status)
                };
                self.on_error(code, error_message(response), fx);
            }
        }
        Ok(true)
    }

    fn incoming_call(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        let Some(invite) = self.invite_received.clone() else {
            return Ok(false);
        };

        match event {
            SessionEvent::AnswerCall { answer } => {
                let transaction = self
                    .server_transaction
                    .clone()
                    .unwrap_or_else(|| invite.server_transaction());
                let dialog = transport.send_invite_ok(
                    &invite,
                    &self.local_profile,
                    answer,
                    &self.local_tag(),
                    &transaction,
                )?;
                self.dialog = Some(dialog);
                self.server_transaction = Some(transaction);
                self.local_session_description = Some(answer.clone());
                self.state = SessionState::IncomingCallAnswering;
                Ok(true)
            }
            SessionEvent::EndCall => {
                transport.send_response(&invite, 486)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            SessionEvent::Request(request) if request.is(SipMethod::Cancel) => {
                transport.send_response(request, 200)?;
                transport.send_response(&invite, 487)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn incoming_call_answering(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Request(request) if request.is(SipMethod::Ack) => {
                self.capture_peer_sdp(&request.body);
                if self.peer_session_description.is_none() {
                    self.on_error(ErrorCode::ClientError, "peer sdp is empty".to_string(), fx);
                } else {
                    self.establish_call(fx);
                }
                Ok(true)
            }
            SessionEvent::Request(request) if request.is(SipMethod::Cancel) => {
                // Final response already sent; the CANCEL changes nothing
                transport.send_response(request, 200)?;
                Ok(true)
            }
            SessionEvent::EndCall => {
                self.send_bye(transport)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn outgoing_call(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Response(response) if response.is_response_to(SipMethod::Invite) => {
                match response.status {
                    // Any alerting-type provisional counts as ring back
                    180..=183 => {
                        if self.state == SessionState::OutgoingCall {
                            self.state = SessionState::OutgoingCallRingBack;
                            fx.notify(self.id, ListenerEvent::RingingBack);
                        }
                    }
                    100..=199 => {}
                    200..=299 => {
                        self.send_ack(response, transport)?;
                        self.peer_session_description = Some(response.body.clone());
                        self.establish_call(fx);
                    }
                    401 | 407 => self.handle_authentication(response, transport, fx)?,
                    // Request pending; the peer will settle the glare
                    491 => {}
                    _ => self.on_error_response(response, fx),
                }
                Ok(true)
            }
            SessionEvent::EndCall => {
                if let Some(transaction) = &self.client_transaction {
                    transport.send_cancel(transaction)?;
                }
                self.state = SessionState::OutgoingCallCanceling;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn outgoing_call_canceling(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        let SessionEvent::Response(response) = event else {
            return Ok(false);
        };

        match response.method {
            SipMethod::Cancel => {
                if response.status >= 400 {
                    self.on_error_response(response, fx);
                }
                // otherwise wait for 487 on the INVITE
                Ok(true)
            }
            SipMethod::Invite => {
                match response.status {
                    100..=199 => {}
                    200..=299 => {
                        // Answered before the CANCEL landed; hang up right away
                        self.send_ack(response, transport)?;
                        self.send_bye(transport)?;
                        self.end_call_normally(fx);
                    }
                    487 => self.end_call_normally(fx),
                    _ => self.on_error_response(response, fx),
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn in_call(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::EndCall => {
                self.send_bye(transport)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            SessionEvent::Request(request) if request.is(SipMethod::Invite) => {
                // Peer re-INVITE: accepted without asking the user
                let transaction = request.server_transaction();
                let answer = self.local_session_description.clone().unwrap_or_default();
                let dialog = transport.send_invite_ok(
                    request,
                    &self.local_profile,
                    &answer,
                    &self.local_tag(),
                    &transaction,
                )?;
                self.capture_peer_sdp(&request.body);
                self.dialog = Some(dialog);
                self.invite_received = Some(request.clone());
                self.server_transaction = Some(transaction);
                self.state = SessionState::InCallAnswering;
                fx.notify(
                    self.id,
                    ListenerEvent::CallChanged {
                        sdp: request.body.clone(),
                    },
                );
                Ok(true)
            }
            SessionEvent::Request(request) if request.is(SipMethod::Bye) => {
                transport.send_response(request, 200)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            SessionEvent::MakeCall { offer, .. } | SessionEvent::ChangeCall { offer } => {
                let Some(dialog) = self.dialog.clone() else {
                    return Ok(false);
                };
                let transaction = transport.send_reinvite(&dialog, offer)?;
                self.client_transaction = Some(transaction);
                self.auth_retry_count = 0;
                self.local_session_description = Some(offer.clone());
                self.state = SessionState::InCallChanging;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn in_call_answering(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Request(request) if request.is(SipMethod::Ack) => {
                self.capture_peer_sdp(&request.body);
                self.invite_received = None;
                self.state = SessionState::InCall;
                Ok(true)
            }
            SessionEvent::EndCall => {
                self.send_bye(transport)?;
                self.end_call_normally(fx);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn in_call_changing(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Response(response) if response.is_response_to(SipMethod::Invite) => {
                match response.status {
                    100..=199 => {}
                    200..=299 => self.complete_change(response, transport, fx)?,
                    401 | 407 => self.handle_authentication(response, transport, fx)?,
                    408 | 481 => self.terminate_on_error(response, transport, fx),
                    _ => self.on_error_response(response, fx),
                }
                Ok(true)
            }
            SessionEvent::EndCall => {
                if let Some(transaction) = &self.client_transaction {
                    transport.send_cancel(transaction)?;
                }
                self.state = SessionState::InCallChangingCanceling;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn in_call_changing_canceling(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        let SessionEvent::Response(response) = event else {
            return Ok(false);
        };

        match response.method {
            SipMethod::Cancel => {
                if response.status >= 300 {
                    debug!("CANCEL of re-INVITE refused with {}; awaiting final response", response.status);
                }
                Ok(true)
            }
            SipMethod::Invite => {
                match response.status {
                    100..=199 => {}
                    200..=299 => self.complete_change(response, transport, fx)?,
                    408 | 481 => self.terminate_on_error(response, transport, fx),
                    // 487 and any other refusal leave the call as it was
                    _ => self.state = SessionState::InCall,
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Rules that apply in every state once the state's own rules pass
    fn process_exceptions(
        &mut self,
        event: &SessionEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<bool> {
        match event {
            SessionEvent::Request(request) => match request.method {
                SipMethod::Bye if self.state.is_call() => {
                    transport.send_response(request, 200)?;
                    self.end_call_normally(fx);
                    Ok(true)
                }
                SipMethod::Bye | SipMethod::Cancel => {
                    transport.send_response(request, 481)?;
                    Ok(true)
                }
                SipMethod::Options => {
                    transport.send_response(request, 200)?;
                    Ok(true)
                }
                SipMethod::Invite if self.state != SessionState::Ready => {
                    transport.send_response(request, 486)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            SessionEvent::Timeout(timeout) if self.is_current_transaction(&timeout.transaction) => {
                self.process_timeout(transport, fx);
                Ok(true)
            }
            SessionEvent::TransactionTerminated(terminated)
                if !terminated.is_server && self.is_current_client(&terminated.transaction) =>
            {
                if self.awaits_final_response() {
                    warn!("Session {}: transaction terminated early in {}", self.id, self.state);
                    self.on_error(
                        ErrorCode::TransactionTerminated,
                        "transaction terminated".to_string(),
                        fx,
                    );
                }
                Ok(true)
            }
            SessionEvent::DialogTerminated(dialog) => {
                let current = self
                    .dialog
                    .as_ref()
                    .is_some_and(|d| d.call_id == dialog.call_id && d.local_tag == dialog.local_tag);
                if current && self.state != SessionState::Ready {
                    self.on_error(ErrorCode::ClientError, "dialog terminated".to_string(), fx);
                } else {
                    debug!(
                        "Session {}: ignoring termination of dialog {} (not current)",
                        self.id, dialog.call_id
                    );
                }
                Ok(true)
            }
            SessionEvent::ConnectionLost if self.state != SessionState::Ready => {
                self.on_error(
                    ErrorCode::DataConnectionLost,
                    "data connection lost".to_string(),
                    fx,
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn process_timeout(&mut self, transport: &dyn SipTransport, fx: &mut Effects) {
        if let Some(dialog) = &self.dialog {
            if let Err(e) = transport.terminate_dialog(dialog) {
                warn!("Session {}: failed to terminate dialog: {}", self.id, e);
            }
        }

        if self.state.is_registration() {
            self.reset(fx);
            fx.notify(self.id, ListenerEvent::RegistrationTimeout);
        } else if self.state != SessionState::Ready {
            self.on_error(ErrorCode::TimeOut, "timed out".to_string(), fx);
        }
    }

    fn handle_authentication(
        &mut self,
        response: &ResponseEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<()> {
        if self.auth_retry_count >= MAX_AUTH_RETRIES {
            self.on_error(
                ErrorCode::InvalidCredentials,
                "incorrect username or password".to_string(),
                fx,
            );
            return Ok(());
        }
        if let Some(realm) = response.realm.as_deref() {
            let domain = self.local_profile.uri().host();
            if !realm.trim().eq_ignore_ascii_case(domain) {
                self.on_error(ErrorCode::CrossDomainAuthentication, realm.to_string(), fx);
                return Ok(());
            }
        }

        let transaction =
            transport.handle_challenge(response, self.local_profile.credentials())?;
        self.auth_retry_count += 1;
        debug!(
            "Session {}: answered {} challenge (retry {})",
            self.id, response.status, self.auth_retry_count
        );
        self.bind(transaction.call_id.clone(), fx);
        self.client_transaction = Some(transaction);
        Ok(())
    }

    fn complete_change(
        &mut self,
        response: &ResponseEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) -> TransportResult<()> {
        self.send_ack(response, transport)?;
        self.capture_peer_sdp(&response.body);
        self.auth_retry_count = 0;
        self.state = SessionState::InCall;
        fx.notify(
            self.id,
            ListenerEvent::CallEstablished {
                sdp: self.peer_session_description.clone().unwrap_or_default(),
            },
        );
        Ok(())
    }

    fn terminate_on_error(
        &mut self,
        response: &ResponseEvent,
        transport: &dyn SipTransport,
        fx: &mut Effects,
    ) {
        if let Some(dialog) = &self.dialog {
            if let Err(e) = transport.terminate_dialog(dialog) {
                warn!("Session {}: failed to terminate dialog: {}", self.id, e);
            }
        }
        self.on_error_response(response, fx);
    }

    fn send_ack(&self, response: &ResponseEvent, transport: &dyn SipTransport) -> TransportResult<()> {
        let dialog = self
            .dialog
            .as_ref()
            .ok_or_else(|| TransportError::NoTransaction("no dialog to ACK in".to_string()))?;
        transport.send_invite_ack(response, dialog)
    }

    fn send_bye(&self, transport: &dyn SipTransport) -> TransportResult<()> {
        match &self.dialog {
            Some(dialog) => transport.send_bye(dialog),
            None => {
                warn!("Session {}: no dialog to send BYE in", self.id);
                Ok(())
            }
        }
    }

    fn capture_peer_sdp(&mut self, body: &Bytes) {
        if !body.is_empty() {
            self.peer_session_description = Some(body.clone());
        }
    }

    fn local_tag(&self) -> String {
        self.dialog
            .as_ref()
            .map(|d| d.local_tag.clone())
            .unwrap_or_else(generate_tag)
    }

    fn is_current_client(&self, transaction: &TransactionId) -> bool {
        self.client_transaction
            .as_ref()
            .is_some_and(|t| &t.id == transaction)
    }

    fn is_current_transaction(&self, transaction: &TransactionId) -> bool {
        self.is_current_client(transaction)
            || self
                .server_transaction
                .as_ref()
                .is_some_and(|t| &t.id == transaction)
    }

    fn awaits_final_response(&self) -> bool {
        self.state.is_registration()
            || self.state.is_outgoing()
            || matches!(
                self.state,
                SessionState::InCallChanging | SessionState::InCallChangingCanceling
            )
    }

    fn bind(&mut self, key: CallId, fx: &mut Effects) {
        if self.key.as_ref() == Some(&key) {
            return;
        }
        if let Some(old) = self.key.take() {
            fx.key_changes.push(KeyChange::Unbind {
                session: self.id,
                key: old,
            });
        }
        fx.key_changes.push(KeyChange::Bind {
            session: self.id,
            key: key.clone(),
        });
        self.key = Some(key);
    }

    /// Clear every per-call field and return to `Ready`
    pub fn reset(&mut self, fx: &mut Effects) {
        if let Some(key) = self.key.take() {
            fx.key_changes.push(KeyChange::Unbind {
                session: self.id,
                key,
            });
        }
        self.state = SessionState::Ready;
        self.peer_profile = None;
        self.dialog = None;
        self.client_transaction = None;
        self.server_transaction = None;
        self.invite_received = None;
        self.peer_session_description = None;
        self.local_session_description = None;
        self.auth_retry_count = 0;
    }

    fn establish_call(&mut self, fx: &mut Effects) {
        self.state = SessionState::InCall;
        self.auth_retry_count = 0;
        fx.notify(
            self.id,
            ListenerEvent::CallEstablished {
                sdp: self.peer_session_description.clone().unwrap_or_default(),
            },
        );
    }

    fn end_call_normally(&mut self, fx: &mut Effects) {
        self.reset(fx);
        fx.notify(self.id, ListenerEvent::CallEnded);
    }

    fn on_error(&mut self, code: ErrorCode, message: String, fx: &mut Effects) {
        let registration = self.state.is_registration();
        warn!("Session {}: {} in {}: {}", self.id, code, self.state, message);
        self.reset(fx);
        let event = if registration {
            ListenerEvent::RegistrationFailed { code, message }
        } else {
            ListenerEvent::Error { code, message }
        };
        fx.notify(self.id, event);
    }

    fn on_error_response(&mut self, response: &ResponseEvent, fx: &mut Effects) {
        if !self.state.is_in_call() && response.status == 486 {
            self.reset(fx);
            fx.notify(self.id, ListenerEvent::CallBusy);
        } else {
            self.on_error(ErrorCode::from_status(response.status), error_message(response), fx);
        }
    }

    fn on_transport_failure(&mut self, event: &SessionEvent, error: TransportError, fx: &mut Effects) {
        warn!("Session {}: transport failed on {}: {}", self.id, event.name(), error);
        let registration = self.state.is_registration()
            || matches!(event, SessionEvent::Register { .. } | SessionEvent::Deregister);
        self.reset(fx);
        let code = match &error {
            TransportError::Unreachable(_) => ErrorCode::ServerUnreachable,
            _ => ErrorCode::SocketError,
        };
        let message = error.to_string();
        let event = if registration {
            ListenerEvent::RegistrationFailed { code, message }
        } else {
            ListenerEvent::Error { code, message }
        };
        fx.notify(self.id, event);
    }
}

fn error_message(response: &ResponseEvent) -> String {
    format!("{} ({})", response.reason, response.status)
}

impl RequestEvent {
    /// Server transaction handle for this request
    pub fn server_transaction(&self) -> ServerTransaction {
        ServerTransaction {
            id: self.transaction.clone(),
            method: self.method,
            call_id: self.call_id.clone(),
        }
    }
}
