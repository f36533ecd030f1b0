//! Call flow integration tests

use bytes::Bytes;
use parking_lot::Mutex;
use sipua::application::{SessionListener, SipSession, SipSessionGroup};
use sipua::config::RegistrationConfig;
use sipua::domain::session::{ErrorCode, ListenerEvent, SessionState};
use sipua::domain::shared::value_objects::{CallId, PeerProfile, SipProfile, SipUri, TransactionId};
use sipua::domain::transport::{RequestEvent, SipMethod, TransportEvent};
use sipua::infrastructure::timer::WakeupTimer;
use sipua::infrastructure::transport::{RecordingTransport, TransportCommand};
use sipua::UaError;
use std::sync::Arc;

fn recorder() -> (Arc<dyn SessionListener>, Arc<Mutex<Vec<ListenerEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener = move |_: &SipSession, event: &ListenerEvent| sink.lock().push(event.clone());
    (Arc::new(listener), events)
}

fn setup() -> (SipSessionGroup, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new("example.com"));
    let profile = SipProfile::new(SipUri::parse("sip:alice@example.com").unwrap(), "secret");
    let group = SipSessionGroup::new(
        profile,
        transport.clone(),
        WakeupTimer::new().unwrap(),
        RegistrationConfig::default(),
    );
    (group, transport)
}

fn respond(group: &SipSessionGroup, transport: &RecordingTransport, status: u16, reason: &str) -> bool {
    let transaction = transport.last_transaction().expect("no client transaction");
    group.process_event(TransportEvent::Response(RecordingTransport::response_to(
        &transaction,
        status,
        reason,
    )))
}

fn inbound(call_id: &CallId, method: SipMethod, body: &'static [u8]) -> TransportEvent {
    TransportEvent::Request(RequestEvent {
        method,
        call_id: call_id.clone(),
        transaction: TransactionId::generate(),
        from: PeerProfile::new(SipUri::parse("sip:carol@example.org").unwrap(), Some("Carol".to_string())),
        body: Bytes::from_static(body),
        dialog: None,
    })
}

fn count(transport: &RecordingTransport, pred: impl Fn(&TransportCommand) -> bool) -> usize {
    transport.commands().iter().filter(|c| pred(c)).count()
}

#[tokio::test]
async fn test_outgoing_call_lifecycle() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    let session = group.create_session(listener).unwrap();
    let peer = SipUri::parse("sip:bob@example.com").unwrap();

    session.make_call(&peer, Bytes::from_static(b"offer-x")).unwrap();
    assert_eq!(session.state(), SessionState::OutgoingCall);
    let call_id = session.call_id().unwrap();
    assert!(group.contains_session(&call_id));
    assert_eq!(session.peer_profile().map(|p| p.uri().clone()), Some(peer));

    respond(&group, &transport, 100, "Trying");
    respond(&group, &transport, 180, "Ringing");
    respond(&group, &transport, 180, "Ringing");
    let invite = transport.last_transaction().unwrap();
    group.process_event(TransportEvent::Response(
        RecordingTransport::response_to(&invite, 200, "OK").with_body(Bytes::from_static(b"answer-y")),
    ));
    assert_eq!(session.state(), SessionState::InCall);
    assert_eq!(count(&transport, |c| matches!(c, TransportCommand::Ack { .. })), 1);

    session.end_call().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!group.contains_session(&call_id));
    assert_eq!(count(&transport, |c| matches!(c, TransportCommand::Bye { .. })), 1);

    assert_eq!(
        *events.lock(),
        vec![
            ListenerEvent::Calling,
            ListenerEvent::RingingBack,
            ListenerEvent::CallEstablished {
                sdp: Bytes::from_static(b"answer-y")
            },
            ListenerEvent::CallEnded,
        ]
    );
}

#[tokio::test]
async fn test_incoming_call_answered_from_listener() {
    let (group, transport) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let answering = move |session: &SipSession, event: &ListenerEvent| {
        sink.lock().push(event.clone());
        if matches!(event, ListenerEvent::Ringing { .. }) {
            session.answer_call(Bytes::from_static(b"answer-y")).unwrap();
        }
    };
    group.open_to_receive_calls(Arc::new(answering)).unwrap();

    let call_id = CallId::new("incoming-1@example.org");
    assert!(group.process_event(inbound(&call_id, SipMethod::Invite, b"offer-x")));

    let session = group.session(&call_id).expect("keyed before the call is up");
    assert_eq!(session.state(), SessionState::IncomingCallAnswering);
    assert_eq!(session.peer_profile().and_then(|p| p.display_name().map(str::to_string)), Some("Carol".to_string()));
    assert_eq!(count(&transport, |c| matches!(c, TransportCommand::Ringing { .. })), 1);
    assert_eq!(count(&transport, |c| matches!(c, TransportCommand::InviteOk { .. })), 1);

    assert!(group.process_event(inbound(&call_id, SipMethod::Ack, b"")));
    assert_eq!(session.state(), SessionState::InCall);

    assert!(group.process_event(inbound(&call_id, SipMethod::Bye, b"")));
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!group.contains_session(&call_id));

    let events = events.lock();
    assert!(matches!(events[0], ListenerEvent::Ringing { .. }));
    assert_eq!(
        events[1..],
        [
            ListenerEvent::CallEstablished {
                sdp: Bytes::from_static(b"offer-x")
            },
            ListenerEvent::CallEnded,
        ]
    );
}

#[tokio::test]
async fn test_unmatched_event_without_receiver_is_dropped() {
    let (group, transport) = setup();
    let call_id = CallId::new("nobody@example.org");

    assert!(!group.process_event(inbound(&call_id, SipMethod::Invite, b"offer")));
    assert!(transport.commands().is_empty());

    let (listener, _) = recorder();
    group.open_to_receive_calls(listener).unwrap();
    group.close_to_receive_calls();
    assert!(!group.process_event(inbound(&call_id, SipMethod::Invite, b"offer")));
}

#[tokio::test]
async fn test_receiver_answers_stray_requests() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.open_to_receive_calls(listener).unwrap();
    let call_id = CallId::new("stray@example.org");

    assert!(group.process_event(inbound(&call_id, SipMethod::Options, b"")));
    assert!(group.process_event(inbound(&call_id, SipMethod::Bye, b"")));
    assert!(!group.process_event(inbound(&call_id, SipMethod::Ack, b"")));

    assert_eq!(
        transport.commands(),
        vec![
            TransportCommand::Response {
                call_id: call_id.clone(),
                method: SipMethod::Options,
                status: 200
            },
            TransportCommand::Response {
                call_id: call_id.clone(),
                method: SipMethod::Bye,
                status: 481
            },
        ]
    );
    assert!(events.lock().is_empty());
    assert_eq!(group.session_count(), 0);
}

#[tokio::test]
async fn test_invalid_command_is_rejected() {
    let (group, _transport) = setup();
    let (listener, events) = recorder();
    let session = group.create_session(listener).unwrap();

    assert!(matches!(session.end_call(), Err(UaError::InvalidStateTransition(_))));
    assert!(matches!(
        session.answer_call(Bytes::new()),
        Err(UaError::InvalidStateTransition(_))
    ));
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn test_closed_group_refuses_work() {
    let (group, transport) = setup();
    let (listener, _) = recorder();
    let session = group.create_session(listener.clone()).unwrap();
    session
        .make_call(&SipUri::parse("sip:bob@example.com").unwrap(), Bytes::from_static(b"offer"))
        .unwrap();
    let call_id = session.call_id().unwrap();

    group.close();
    assert!(group.is_closed());
    assert!(!group.contains_session(&call_id));
    assert_eq!(session.end_call(), Err(UaError::GroupClosed));
    assert!(matches!(group.create_session(listener), Err(UaError::GroupClosed)));
    assert!(!respond(&group, &transport, 200, "OK"));
}

#[tokio::test]
async fn test_transport_failure_reports_socket_error() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    let session = group.create_session(listener).unwrap();

    transport.set_failing(true);
    session
        .make_call(&SipUri::parse("sip:bob@example.com").unwrap(), Bytes::from_static(b"offer"))
        .unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(group.session_count(), 0);
    assert!(matches!(
        events.lock().as_slice(),
        [ListenerEvent::Error { code: ErrorCode::SocketError, .. }]
    ));
}

#[tokio::test]
async fn test_connection_loss_ends_calls() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    let session = group.create_session(listener).unwrap();
    session
        .make_call(&SipUri::parse("sip:bob@example.com").unwrap(), Bytes::from_static(b"offer"))
        .unwrap();
    respond(&group, &transport, 200, "OK");
    assert_eq!(session.state(), SessionState::InCall);

    group.on_connectivity_changed(false);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(group.session_count(), 0);
    assert_eq!(
        events.lock().last(),
        Some(&ListenerEvent::Error {
            code: ErrorCode::DataConnectionLost,
            message: "data connection lost".to_string()
        })
    );
}

#[tokio::test]
async fn test_cancel_before_answer() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    let session = group.create_session(listener).unwrap();
    session
        .make_call(&SipUri::parse("sip:bob@example.com").unwrap(), Bytes::from_static(b"offer"))
        .unwrap();
    respond(&group, &transport, 180, "Ringing");

    session.end_call().unwrap();
    assert_eq!(session.state(), SessionState::OutgoingCallCanceling);
    assert_eq!(count(&transport, |c| matches!(c, TransportCommand::Cancel { .. })), 1);

    respond(&group, &transport, 487, "Request Terminated");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(events.lock().last(), Some(&ListenerEvent::CallEnded));
}
