//! In-memory transport
//!
//! Allocates Call-IDs, tags and branches like a real transport would, records
//! every command instead of sending it, and can be switched into a failing
//! or unreachable mode. Peers are simulated by feeding events back into the group.

use crate::domain::shared::value_objects::{
    CallId, Credentials, SipProfile, SipUri, TransactionId,
};
use crate::domain::transport::{
    ClientTransaction, Dialog, RequestEvent, ResponseEvent, ServerTransaction, SipMethod,
    SipTransport, TransportError, TransportResult,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// What the core asked the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Register { call_id: CallId, expiry: u32 },
    Invite { call_id: CallId, callee: SipUri, offer: Bytes },
    Reinvite { call_id: CallId, offer: Bytes },
    Cancel { call_id: CallId },
    Bye { call_id: CallId },
    Response { call_id: CallId, method: SipMethod, status: u16 },
    Ringing { call_id: CallId },
    InviteOk { call_id: CallId, answer: Bytes },
    Ack { call_id: CallId },
    Challenge { call_id: CallId, username: String },
    Keepalive,
    TerminateDialog { call_id: CallId },
}

impl TransportCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TransportCommand::Register { .. } => "REGISTER",
            TransportCommand::Invite { .. } => "INVITE",
            TransportCommand::Reinvite { .. } => "re-INVITE",
            TransportCommand::Cancel { .. } => "CANCEL",
            TransportCommand::Bye { .. } => "BYE",
            TransportCommand::Response { .. } => "response",
            TransportCommand::Ringing { .. } => "180 Ringing",
            TransportCommand::InviteOk { .. } => "200 OK",
            TransportCommand::Ack { .. } => "ACK",
            TransportCommand::Challenge { .. } => "challenge",
            TransportCommand::Keepalive => "keepalive",
            TransportCommand::TerminateDialog { .. } => "terminate dialog",
        }
    }
}

pub struct RecordingTransport {
    host: String,
    local_address: Mutex<IpAddr>,
    commands: Mutex<Vec<TransportCommand>>,
    last_transaction: Mutex<Option<ClientTransaction>>,
    /// Registrations reuse one Call-ID
    registration_call_id: Mutex<Option<CallId>>,
    failing: AtomicBool,
    unreachable: AtomicBool,
}

impl RecordingTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            local_address: Mutex::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            commands: Mutex::new(Vec::new()),
            last_transaction: Mutex::new(None),
            registration_call_id: Mutex::new(None),
            failing: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_local_address(self, address: IpAddr) -> Self {
        *self.local_address.lock() = address;
        self
    }

    /// Make every later command fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every later command fail as if the server had no route
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands.lock().clone()
    }

    pub fn take_commands(&self) -> Vec<TransportCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Most recent client transaction handed out
    pub fn last_transaction(&self) -> Option<ClientTransaction> {
        self.last_transaction.lock().clone()
    }

    /// Response event answering `transaction`
    pub fn response_to(
        transaction: &ClientTransaction,
        status: u16,
        reason: &str,
    ) -> ResponseEvent {
        ResponseEvent::new(status, reason, transaction.method, transaction.call_id.clone())
            .with_transaction(transaction.id.clone())
    }

    fn record(&self, command: TransportCommand) -> TransportResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(format!(
                "{} refused: no route to {}",
                command.name(),
                self.host
            )));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "{} refused: transport down",
                command.name()
            )));
        }
        debug!("Transport: {:?}", command);
        self.commands.lock().push(command);
        Ok(())
    }

    fn client_transaction(&self, method: SipMethod, call_id: CallId) -> ClientTransaction {
        let transaction = ClientTransaction {
            id: TransactionId::generate(),
            method,
            call_id,
        };
        *self.last_transaction.lock() = Some(transaction.clone());
        transaction
    }
}

impl SipTransport for RecordingTransport {
    fn send_register(
        &self,
        _profile: &SipProfile,
        _tag: &str,
        expiry: u32,
    ) -> TransportResult<ClientTransaction> {
        let call_id = self
            .registration_call_id
            .lock()
            .get_or_insert_with(|| CallId::generate(&self.host))
            .clone();
        self.record(TransportCommand::Register {
            call_id: call_id.clone(),
            expiry,
        })?;
        Ok(self.client_transaction(SipMethod::Register, call_id))
    }

    fn send_invite(
        &self,
        _caller: &SipProfile,
        callee: &SipUri,
        offer: &Bytes,
        tag: &str,
    ) -> TransportResult<(ClientTransaction, Dialog)> {
        let call_id = CallId::generate(&self.host);
        self.record(TransportCommand::Invite {
            call_id: call_id.clone(),
            callee: callee.clone(),
            offer: offer.clone(),
        })?;
        let dialog = Dialog::new(call_id.clone(), tag);
        Ok((self.client_transaction(SipMethod::Invite, call_id), dialog))
    }

    fn send_reinvite(&self, dialog: &Dialog, offer: &Bytes) -> TransportResult<ClientTransaction> {
        self.record(TransportCommand::Reinvite {
            call_id: dialog.call_id.clone(),
            offer: offer.clone(),
        })?;
        Ok(self.client_transaction(SipMethod::Invite, dialog.call_id.clone()))
    }

    fn send_cancel(&self, transaction: &ClientTransaction) -> TransportResult<()> {
        self.record(TransportCommand::Cancel {
            call_id: transaction.call_id.clone(),
        })
    }

    fn send_bye(&self, dialog: &Dialog) -> TransportResult<()> {
        self.record(TransportCommand::Bye {
            call_id: dialog.call_id.clone(),
        })
    }

    fn send_response(&self, request: &RequestEvent, status: u16) -> TransportResult<()> {
        self.record(TransportCommand::Response {
            call_id: request.call_id.clone(),
            method: request.method,
            status,
        })
    }

    fn send_ringing(&self, request: &RequestEvent, _tag: &str) -> TransportResult<ServerTransaction> {
        self.record(TransportCommand::Ringing {
            call_id: request.call_id.clone(),
        })?;
        Ok(ServerTransaction {
            id: request.transaction.clone(),
            method: request.method,
            call_id: request.call_id.clone(),
        })
    }

    fn send_invite_ok(
        &self,
        request: &RequestEvent,
        _profile: &SipProfile,
        answer: &Bytes,
        tag: &str,
        _transaction: &ServerTransaction,
    ) -> TransportResult<Dialog> {
        self.record(TransportCommand::InviteOk {
            call_id: request.call_id.clone(),
            answer: answer.clone(),
        })?;
        let mut dialog = Dialog::new(request.call_id.clone(), tag);
        dialog.remote_tag = request.dialog.as_ref().and_then(|d| d.remote_tag.clone());
        Ok(dialog)
    }

    fn send_invite_ack(&self, response: &ResponseEvent, _dialog: &Dialog) -> TransportResult<()> {
        self.record(TransportCommand::Ack {
            call_id: response.call_id.clone(),
        })
    }

    fn handle_challenge(
        &self,
        response: &ResponseEvent,
        credentials: &Credentials,
    ) -> TransportResult<ClientTransaction> {
        self.record(TransportCommand::Challenge {
            call_id: response.call_id.clone(),
            username: credentials.username.clone(),
        })?;
        Ok(self.client_transaction(response.method, response.call_id.clone()))
    }

    fn send_keepalive(&self, _profile: &SipProfile) -> TransportResult<()> {
        self.record(TransportCommand::Keepalive)
    }

    fn terminate_dialog(&self, dialog: &Dialog) -> TransportResult<()> {
        self.record(TransportCommand::TerminateDialog {
            call_id: dialog.call_id.clone(),
        })
    }

    fn local_address(&self) -> IpAddr {
        *self.local_address.lock()
    }
}
