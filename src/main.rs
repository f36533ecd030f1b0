use sipua::application::{SessionListener, SipSession, SipSessionGroup};
use sipua::config::Config;
use sipua::domain::session::{ErrorCode, ListenerEvent};
use sipua::domain::shared::value_objects::{CallId, PeerProfile, SipUri, TransactionId};
use sipua::domain::transport::{RequestEvent, SipMethod, TransportEvent};
use sipua::infrastructure::sip::SipMessage;
use sipua::infrastructure::timer::WakeupTimer;
use sipua::infrastructure::transport::RecordingTransport;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const INCOMING_INVITE: &[u8] = b"INVITE sip:alice@example.com SIP/2.0\r\n\
    Via: SIP/2.0/UDP 198.51.100.4:5060;branch=z9hG4bKdemo1\r\n\
    From: \"Carol\" <sip:carol@example.org>;tag=77aa\r\n\
    To: <sip:alice@example.com>\r\n\
    Call-ID: demo-incoming@example.org\r\n\
    CSeq: 1 INVITE\r\n\
    Content-Type: application/sdp\r\n\
    Content-Length: 9\r\n\r\n\
    v=0 offer";

/// Logs everything a session reports
struct LoggingListener;

impl SessionListener for LoggingListener {
    fn on_calling(&self, session: &SipSession) {
        info!("[{}] calling", session.id());
    }

    fn on_ringing(&self, session: &SipSession, peer: &PeerProfile, _offer: &Bytes) {
        info!("[{}] incoming call from {}", session.id(), peer.uri());
    }

    fn on_ringing_back(&self, session: &SipSession) {
        info!("[{}] ringing back", session.id());
    }

    fn on_call_established(&self, session: &SipSession, sdp: &Bytes) {
        info!("[{}] call established ({} bytes of SDP)", session.id(), sdp.len());
    }

    fn on_call_ended(&self, session: &SipSession) {
        info!("[{}] call ended", session.id());
    }

    fn on_error(&self, session: &SipSession, code: ErrorCode, message: &str) {
        warn!("[{}] error {}: {}", session.id(), code, message);
    }

    fn on_registering(&self, _session: &SipSession) {
        info!("Registering...");
    }

    fn on_registration_done(&self, _session: &SipSession, duration: i32) {
        info!("Registration done: {}s", duration);
    }

    fn on_registration_failed(&self, _session: &SipSession, code: ErrorCode, message: &str) {
        warn!("Registration failed {}: {}", code, message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "sipua.toml".to_string());
    let config = Config::load(&config_path)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sipua");
    info!("Configuration loaded: {:?}", config);

    let profile = config.profile.to_profile()?;
    let transport = Arc::new(RecordingTransport::new(profile.uri().host().to_string()));
    let group = SipSessionGroup::new(
        profile,
        transport.clone(),
        WakeupTimer::new()?,
        config.registration.clone(),
    );

    demo_registration(&group, &transport)?;
    demo_call_lifecycle(&group, &transport)?;
    demo_incoming_call(&group, &transport)?;

    group.close();
    info!("Commands issued: {}", transport.commands().len());
    Ok(())
}

fn demo_registration(group: &SipSessionGroup, transport: &RecordingTransport) -> anyhow::Result<()> {
    info!("=== Registration Demo ===");

    group.start_auto_registration(Arc::new(LoggingListener))?;

    // Stale bindings are cleared first
    let deregister = transport
        .last_transaction()
        .ok_or_else(|| anyhow::anyhow!("no deregistration sent"))?;
    group.process_event(TransportEvent::Response(RecordingTransport::response_to(
        &deregister,
        200,
        "OK",
    )));

    let register = transport
        .last_transaction()
        .ok_or_else(|| anyhow::anyhow!("no registration sent"))?;
    group.process_event(TransportEvent::Response(
        RecordingTransport::response_to(&register, 200, "OK").with_expires(600),
    ));
    info!("Registered: {}", group.is_registered());

    info!("=== Registration Demo Complete ===");
    Ok(())
}

fn demo_call_lifecycle(group: &SipSessionGroup, transport: &RecordingTransport) -> anyhow::Result<()> {
    info!("=== Call Lifecycle Demo ===");

    let session = group.create_session(Arc::new(LoggingListener))?;
    let callee = SipUri::parse("sip:bob@example.com")?;
    session.make_call(&callee, Bytes::from_static(b"v=0 offer"))?;
    info!("Call state: {}", session.state());

    let invite = transport
        .last_transaction()
        .ok_or_else(|| anyhow::anyhow!("no INVITE sent"))?;
    group.process_event(TransportEvent::Response(RecordingTransport::response_to(
        &invite, 180, "Ringing",
    )));
    info!("Call state: {}", session.state());

    group.process_event(TransportEvent::Response(
        RecordingTransport::response_to(&invite, 200, "OK").with_body(Bytes::from_static(b"v=0 answer")),
    ));
    info!("Call state: {}", session.state());

    // Put the call on hold and resume it
    session.change_call(Bytes::from_static(b"v=0 sendonly"))?;
    let reinvite = transport
        .last_transaction()
        .ok_or_else(|| anyhow::anyhow!("no re-INVITE sent"))?;
    group.process_event(TransportEvent::Response(RecordingTransport::response_to(
        &reinvite, 200, "OK",
    )));
    info!("Call state: {}", session.state());

    session.end_call()?;
    info!("Call state: {}", session.state());

    info!("=== Call Lifecycle Demo Complete ===");
    Ok(())
}

fn demo_incoming_call(group: &SipSessionGroup, _transport: &RecordingTransport) -> anyhow::Result<()> {
    info!("=== Incoming Call Demo ===");

    // Answer from inside the listener
    let answering = |session: &SipSession, event: &ListenerEvent| {
        info!("[{}] {:?}", session.id(), event);
        if let ListenerEvent::Ringing { .. } = event {
            if let Err(e) = session.answer_call(Bytes::from_static(b"v=0 answer")) {
                warn!("Could not answer: {}", e);
            }
        }
    };
    group.open_to_receive_calls(Arc::new(answering))?;

    let call_id = CallId::new("demo-incoming@example.org");
    let request = |method: SipMethod, body: &'static [u8]| RequestEvent {
        method,
        call_id: call_id.clone(),
        transaction: TransactionId::generate(),
        from: PeerProfile::new(
            SipUri::new("carol".to_string(), "example.org".to_string(), None),
            Some("Carol".to_string()),
        ),
        body: Bytes::from_static(body),
        dialog: None,
    };

    // The INVITE arrives off the wire
    let invite = SipMessage::parse(INCOMING_INVITE)?.into_event()?;
    group.process_event(invite);
    group.process_event(TransportEvent::Request(request(SipMethod::Ack, b"")));
    if let Some(session) = group.session(&call_id) {
        info!("Call state: {}", session.state());
    }
    group.process_event(TransportEvent::Request(request(SipMethod::Bye, b"")));
    info!("Session still keyed: {}", group.contains_session(&call_id));

    group.close_to_receive_calls();
    info!("=== Incoming Call Demo Complete ===");
    Ok(())
}
