//! Session group
//!
//! Binds one local profile to one transport. The group owns the registry
//! and the auto-registration supervisor, routes transport events to the
//! owning session and hands out `SipSession` handles.
//!
//! Locking: the group mutex serializes dispatch, registry edits and
//! supervisor bookkeeping. A session's own mutex is only taken while the
//! group mutex is held (or for read-only accessors). Listener callbacks run
//! after the group mutex is released, so listeners may call back in.

use super::listener::SessionListener;
use super::registration::AutoRegistration;
use crate::config::RegistrationConfig;
use crate::domain::registry::SessionRegistry;
use crate::domain::session::{Effects, KeyChange, ListenerEvent, Session, SessionEvent, SessionState};
use crate::domain::shared::value_objects::{CallId, PeerProfile, SessionId, SipProfile, SipUri};
use crate::domain::shared::{Result, UaError};
use crate::domain::transport::{SipTransport, TransportEvent};
use crate::infrastructure::timer::WakeupTimer;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// A session together with the listener it reports to
pub(crate) struct SessionCell {
    id: SessionId,
    session: Mutex<Session>,
    listener: Mutex<Arc<dyn SessionListener>>,
}

impl SessionCell {
    pub(crate) fn new(session: Session, listener: Arc<dyn SessionListener>) -> Self {
        Self {
            id: session.id(),
            session: Mutex::new(session),
            listener: Mutex::new(listener),
        }
    }

    pub(crate) fn listener(&self) -> Arc<dyn SessionListener> {
        self.listener.lock().clone()
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.listener.lock() = listener;
    }

    pub(crate) fn state(&self) -> SessionState {
        self.session.lock().state()
    }
}

/// A notification waiting for the group lock to be released
pub(crate) struct Delivery {
    pub(crate) listener: Arc<dyn SessionListener>,
    pub(crate) cell: Arc<SessionCell>,
    pub(crate) event: ListenerEvent,
}

pub(crate) struct GroupState {
    pub(crate) registry: SessionRegistry<SessionCell>,
    pub(crate) closed: bool,
    pub(crate) connected: bool,
    pub(crate) registration: AutoRegistration,
}

pub(crate) struct GroupInner {
    pub(crate) profile: Arc<SipProfile>,
    pub(crate) transport: Arc<dyn SipTransport>,
    pub(crate) timer: WakeupTimer,
    pub(crate) config: RegistrationConfig,
    pub(crate) state: Mutex<GroupState>,
    pub(crate) this: Weak<GroupInner>,
}

impl GroupInner {
    /// Run one event through `cell` and apply the resulting effects
    pub(crate) fn dispatch(
        &self,
        state: &mut GroupState,
        cell: &Arc<SessionCell>,
        event: &SessionEvent,
        out: &mut Vec<Delivery>,
    ) -> bool {
        let mut fx = Effects::new();
        let processed = cell
            .session
            .lock()
            .process(event, self.transport.as_ref(), &mut fx);
        let (notices, key_changes, spawned) = fx.into_parts();

        let mut cells = vec![cell.clone()];
        if !spawned.is_empty() {
            // New inbound calls report to whoever listens on the receiver
            let listener = cell.listener();
            cells.extend(
                spawned
                    .into_iter()
                    .map(|s| Arc::new(SessionCell::new(s, listener.clone()))),
            );
        }
        let find = |id: SessionId| cells.iter().find(|c| c.id == id).cloned();

        for change in key_changes {
            match change {
                KeyChange::Bind { session, key } => {
                    if let Some(owner) = find(session) {
                        state.registry.insert(key, owner);
                    }
                }
                KeyChange::Unbind { session, key } => {
                    if let Some(owner) = find(session) {
                        state.registry.remove(&key, &owner);
                    }
                }
            }
        }

        out.extend(notices.into_iter().filter_map(|notice| {
            find(notice.session).map(|owner| Delivery {
                listener: owner.listener(),
                cell: owner,
                event: notice.event,
            })
        }));
        processed
    }

    /// Deliver queued notifications; never called with the group lock held
    pub(crate) fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let handle = SipSession {
                cell: delivery.cell,
                group: self.this.clone(),
            };
            delivery.event.deliver(delivery.listener.as_ref(), &handle);
        }
    }

    fn execute(&self, cell: &Arc<SessionCell>, event: SessionEvent) -> Result<()> {
        let mut deliveries = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UaError::GroupClosed);
            }
            if self.dispatch(&mut state, cell, &event, &mut deliveries) {
                Ok(())
            } else {
                Err(UaError::InvalidStateTransition(format!(
                    "{} not allowed in {}",
                    event.name(),
                    cell.state()
                )))
            }
        };
        self.deliver(deliveries);
        outcome
    }
}

/// Handle to one session of a group.
///
/// Cloning is cheap; the session lives until its last handle is dropped and
/// the registry no longer references it.
#[derive(Clone)]
pub struct SipSession {
    pub(crate) cell: Arc<SessionCell>,
    pub(crate) group: Weak<GroupInner>,
}

impl SipSession {
    pub fn id(&self) -> SessionId {
        self.cell.id
    }

    pub fn state(&self) -> SessionState {
        self.cell.state()
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.cell.session.lock().call_id().cloned()
    }

    pub fn peer_profile(&self) -> Option<PeerProfile> {
        self.cell.session.lock().peer_profile().cloned()
    }

    pub fn peer_session_description(&self) -> Option<Bytes> {
        self.cell.session.lock().peer_session_description().cloned()
    }

    pub fn local_profile(&self) -> Arc<SipProfile> {
        self.cell.session.lock().local_profile().clone()
    }

    /// Replace the listener; later notifications go to the new one
    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        self.cell.set_listener(listener);
    }

    pub fn make_call(&self, peer: &SipUri, offer: impl Into<Bytes>) -> Result<()> {
        self.command(SessionEvent::MakeCall {
            peer: peer.clone(),
            offer: offer.into(),
        })
    }

    pub fn answer_call(&self, answer: impl Into<Bytes>) -> Result<()> {
        self.command(SessionEvent::AnswerCall {
            answer: answer.into(),
        })
    }

    /// Hang up, reject, or cancel, depending on where the call is
    pub fn end_call(&self) -> Result<()> {
        self.command(SessionEvent::EndCall)
    }

    pub fn change_call(&self, offer: impl Into<Bytes>) -> Result<()> {
        self.command(SessionEvent::ChangeCall {
            offer: offer.into(),
        })
    }

    pub fn register(&self, duration: u32) -> Result<()> {
        self.command(SessionEvent::Register { expiry: duration })
    }

    pub fn unregister(&self) -> Result<()> {
        self.command(SessionEvent::Deregister)
    }

    fn command(&self, event: SessionEvent) -> Result<()> {
        let group = self.group.upgrade().ok_or(UaError::GroupClosed)?;
        group.execute(&self.cell, event)
    }
}

impl PartialEq for SipSession {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for SipSession {}

impl fmt::Debug for SipSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipSession")
            .field("id", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}

/// All sessions of one local identity over one transport
pub struct SipSessionGroup {
    inner: Arc<GroupInner>,
}

impl SipSessionGroup {
    pub fn new(
        profile: SipProfile,
        transport: Arc<dyn SipTransport>,
        timer: WakeupTimer,
        config: RegistrationConfig,
    ) -> Self {
        info!("Session group for {}", profile.uri());
        let profile = Arc::new(profile);
        let inner = Arc::new_cyclic(|this: &Weak<GroupInner>| GroupInner {
            profile,
            transport,
            timer,
            state: Mutex::new(GroupState {
                registry: SessionRegistry::new(),
                closed: false,
                connected: true,
                registration: AutoRegistration::new(this.clone(), &config),
            }),
            config,
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn local_profile(&self) -> Arc<SipProfile> {
        self.inner.profile.clone()
    }

    /// New idle session; it joins the registry once it has a transaction
    pub fn create_session(&self, listener: Arc<dyn SessionListener>) -> Result<SipSession> {
        if self.inner.state.lock().closed {
            return Err(UaError::GroupClosed);
        }
        let cell = Arc::new(SessionCell::new(
            Session::new(self.inner.profile.clone()),
            listener,
        ));
        debug!("Created session {}", cell.id);
        Ok(SipSession {
            cell,
            group: Arc::downgrade(&self.inner),
        })
    }

    /// Accept unmatched INVITEs; each spawns a session reporting to `listener`
    pub fn open_to_receive_calls(&self, listener: Arc<dyn SessionListener>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(UaError::GroupClosed);
        }
        let receiver = SessionCell::new(Session::receiver(self.inner.profile.clone()), listener);
        state.registry.set_receiver(Arc::new(receiver));
        info!("Receiving calls for {}", self.inner.profile.uri());
        Ok(())
    }

    pub fn close_to_receive_calls(&self) {
        if self.inner.state.lock().registry.clear_receiver().is_some() {
            info!("No longer receiving calls for {}", self.inner.profile.uri());
        }
    }

    /// Route one transport event; returns whether a session consumed it
    pub fn process_event(&self, event: TransportEvent) -> bool {
        let inner = &self.inner;
        let mut deliveries = Vec::new();
        let processed = {
            let mut state = inner.state.lock();
            let name = event.name();
            if state.closed {
                debug!("Group closed; dropping {}", name);
                return false;
            }
            let Some(cell) = state.registry.resolve(event.key()) else {
                warn!("No session for {} ({}); dropped", name, event.key());
                return false;
            };

            let processed = inner.dispatch(&mut state, &cell, &SessionEvent::from(event), &mut deliveries);
            if !processed {
                debug!("{} not processed by session {} in {}", name, cell.id, cell.state());
            }
            processed
        };
        inner.deliver(deliveries);
        processed
    }

    pub fn contains_session(&self, call_id: &CallId) -> bool {
        self.inner.state.lock().registry.contains(call_id)
    }

    /// Handle to the session owning `call_id`
    pub fn session(&self, call_id: &CallId) -> Option<SipSession> {
        self.inner
            .state
            .lock()
            .registry
            .get(call_id)
            .map(|cell| SipSession {
                cell,
                group: Arc::downgrade(&self.inner),
            })
    }

    /// Number of keyed sessions
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    pub fn start_auto_registration(&self, listener: Arc<dyn SessionListener>) -> Result<()> {
        self.inner.start_auto_registration(listener)
    }

    pub fn stop_auto_registration(&self) {
        self.inner.stop_auto_registration()
    }

    /// Replace the registration listener and replay the current status to it
    pub fn set_registration_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.set_registration_listener(listener)
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().registration.registered
    }

    pub fn on_connectivity_changed(&self, connected: bool) {
        self.inner.on_connectivity_changed(connected)
    }

    /// Stop auto-registration and forget every session.
    ///
    /// Later commands fail with `GroupClosed`; later events are dropped.
    pub fn close(&self) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            self.inner.stop_registration_locked(&mut state, &mut deliveries);
            state.closed = true;
            state.registry.clear();
        }
        self.inner.deliver(deliveries);
        info!("Session group for {} closed", self.inner.profile.uri());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Drop for SipSessionGroup {
    fn drop(&mut self) {
        self.close();
    }
}
