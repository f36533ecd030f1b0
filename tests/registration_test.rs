//! Auto-registration integration tests
//!
//! Run on a paused tokio clock so refreshes, retries and keepalives can be
//! stepped through deterministically.

use parking_lot::Mutex;
use sipua::application::{SessionListener, SipSession, SipSessionGroup};
use sipua::config::RegistrationConfig;
use sipua::domain::session::{ErrorCode, ListenerEvent};
use sipua::domain::shared::value_objects::{SipProfile, SipUri};
use sipua::domain::transport::TransportEvent;
use sipua::infrastructure::timer::WakeupTimer;
use sipua::infrastructure::transport::{RecordingTransport, TransportCommand};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn recorder() -> (Arc<dyn SessionListener>, Arc<Mutex<Vec<ListenerEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener = move |_: &SipSession, event: &ListenerEvent| sink.lock().push(event.clone());
    (Arc::new(listener), events)
}

fn setup_at(local: IpAddr) -> (SipSessionGroup, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new("example.com").with_local_address(local));
    let profile = SipProfile::new(SipUri::parse("sip:alice@example.com").unwrap(), "secret");
    let group = SipSessionGroup::new(
        profile,
        transport.clone(),
        WakeupTimer::new().unwrap(),
        RegistrationConfig::default(),
    );
    (group, transport)
}

fn setup() -> (SipSessionGroup, Arc<RecordingTransport>) {
    setup_at("203.0.113.7".parse().unwrap())
}

/// Answer the latest REGISTER (or challenge retry)
fn respond(group: &SipSessionGroup, transport: &RecordingTransport, status: u16, expires: Option<u32>) {
    let transaction = transport.last_transaction().expect("no client transaction");
    let mut response = RecordingTransport::response_to(&transaction, status, "reason");
    if let Some(expires) = expires {
        response = response.with_expires(expires);
    }
    group.process_event(TransportEvent::Response(response));
}

/// Expiries of every REGISTER sent so far
fn registers(transport: &RecordingTransport) -> Vec<u32> {
    transport
        .commands()
        .iter()
        .filter_map(|c| match c {
            TransportCommand::Register { expiry, .. } => Some(*expiry),
            _ => None,
        })
        .collect()
}

fn keepalives(transport: &RecordingTransport) -> usize {
    transport
        .commands()
        .iter()
        .filter(|c| matches!(c, TransportCommand::Keepalive))
        .count()
}

/// Move the paused clock and let the alarm and delivery tasks run
async fn advance(secs: u64) {
    tokio::time::advance(Duration::from_secs(secs)).await;
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Start auto-registration and walk it to a granted registration
fn registered(group: &SipSessionGroup, transport: &RecordingTransport, expires: u32) {
    respond(group, transport, 200, None);
    respond(group, transport, 200, Some(expires));
    assert!(group.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_start_deregisters_then_registers() {
    let (group, transport) = setup();
    let (listener, events) = recorder();

    group.start_auto_registration(listener).unwrap();
    assert_eq!(registers(&transport), vec![0]);
    assert!(!group.is_registered());

    respond(&group, &transport, 200, None);
    assert_eq!(registers(&transport), vec![0, 3600]);

    respond(&group, &transport, 200, Some(600));
    assert!(group.is_registered());
    assert_eq!(
        *events.lock(),
        vec![
            ListenerEvent::Registering,
            ListenerEvent::RegistrationDone { duration: -1 },
            ListenerEvent::Registering,
            ListenerEvent::RegistrationDone { duration: 600 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_refresh_before_expiry() {
    let (group, transport) = setup();
    let (listener, _) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);

    advance(539).await;
    assert_eq!(registers(&transport).len(), 2);

    advance(1).await;
    assert_eq!(registers(&transport), vec![0, 3600, 3600]);
}

#[tokio::test(start_paused = true)]
async fn test_failures_back_off_exponentially() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.start_auto_registration(listener).unwrap();
    respond(&group, &transport, 200, None);

    respond(&group, &transport, 503, None);
    assert!(matches!(
        events.lock().last(),
        Some(ListenerEvent::RegistrationFailed { code: ErrorCode::ServerError, .. })
    ));
    advance(9).await;
    assert_eq!(registers(&transport).len(), 2);
    advance(1).await;
    assert_eq!(registers(&transport).len(), 3);

    respond(&group, &transport, 503, None);
    advance(19).await;
    assert_eq!(registers(&transport).len(), 3);
    advance(1).await;
    assert_eq!(registers(&transport).len(), 4);

    // Success resets the backoff: the next failure waits the base delay again
    respond(&group, &transport, 200, Some(600));
    assert!(group.is_registered());
    advance(540).await;
    assert_eq!(registers(&transport).len(), 5);
    respond(&group, &transport, 408, None);
    assert!(!group.is_registered());
    advance(10).await;
    assert_eq!(registers(&transport).len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_credentials_pause_supervisor() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.start_auto_registration(listener).unwrap();
    respond(&group, &transport, 200, None);

    respond(&group, &transport, 401, None);
    respond(&group, &transport, 401, None);
    respond(&group, &transport, 401, None);

    let challenges = transport
        .commands()
        .iter()
        .filter(|c| matches!(c, TransportCommand::Challenge { .. }))
        .count();
    assert_eq!(challenges, 2);
    assert!(matches!(
        events.lock().last(),
        Some(ListenerEvent::RegistrationFailed { code: ErrorCode::InvalidCredentials, .. })
    ));

    advance(7200).await;
    assert_eq!(registers(&transport).len(), 2);

    let (replay, replayed) = recorder();
    group.set_registration_listener(replay);
    assert!(matches!(
        replayed.lock().as_slice(),
        [ListenerEvent::RegistrationFailed { code: ErrorCode::InvalidCredentials, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_pauses_supervisor() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);

    transport.set_unreachable(true);
    advance(540).await;
    assert!(!group.is_registered());
    assert!(matches!(
        events.lock().last(),
        Some(ListenerEvent::RegistrationFailed { code: ErrorCode::ServerUnreachable, .. })
    ));

    // No backoff retries even once the route is back
    transport.set_unreachable(false);
    advance(7200).await;
    assert_eq!(registers(&transport).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_new_listener_sees_current_status() {
    let (group, transport) = setup();
    let (listener, _) = recorder();
    group.start_auto_registration(listener).unwrap();

    let (early, early_events) = recorder();
    group.set_registration_listener(early);
    assert_eq!(*early_events.lock(), vec![ListenerEvent::Registering]);

    registered(&group, &transport, 600);
    let (late, late_events) = recorder();
    group.set_registration_listener(late);
    assert!(matches!(
        late_events.lock().as_slice(),
        [ListenerEvent::RegistrationDone { duration }] if (599..=600).contains(duration)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_behind_nat() {
    let (group, transport) = setup_at("192.168.1.10".parse().unwrap());
    let (listener, _) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);

    advance(10).await;
    assert_eq!(keepalives(&transport), 1);
    advance(10).await;
    assert_eq!(keepalives(&transport), 2);

    group.stop_auto_registration();
    assert_eq!(registers(&transport), vec![0, 3600, 0]);
    advance(60).await;
    assert_eq!(keepalives(&transport), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_keepalive_on_public_address() {
    let (group, transport) = setup();
    let (listener, _) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);

    advance(60).await;
    assert_eq!(keepalives(&transport), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_loss_and_restore() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);

    group.on_connectivity_changed(false);
    assert!(!group.is_registered());
    assert!(matches!(
        events.lock().last(),
        Some(ListenerEvent::RegistrationFailed { code: ErrorCode::DataConnectionLost, .. })
    ));

    // Neither refresh nor retry while offline
    advance(3600).await;
    assert_eq!(registers(&transport).len(), 2);

    group.on_connectivity_changed(true);
    assert_eq!(registers(&transport).len(), 3);
    assert_eq!(events.lock().last(), Some(&ListenerEvent::Registering));
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_registration() {
    let (group, transport) = setup();
    let (listener, events) = recorder();
    group.start_auto_registration(listener).unwrap();
    registered(&group, &transport, 600);
    let before = events.lock().len();

    group.close();
    assert!(!group.is_registered());
    assert_eq!(registers(&transport), vec![0, 3600, 0]);

    advance(3600).await;
    assert_eq!(registers(&transport).len(), 3);
    assert_eq!(events.lock().len(), before);
}
