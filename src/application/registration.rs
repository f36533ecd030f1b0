//! Auto-registration supervisor
//!
//! Owns one long-lived registration session. Starting clears stale bindings
//! with a deregistration, then registers; a granted registration is
//! refreshed `min_expiry` seconds before it lapses, and failures are retried
//! with exponential backoff. Keepalive runs while registered behind a NAT.

use super::group::{Delivery, GroupInner, GroupState, SessionCell, SipSession};
use super::keepalive::{is_behind_nat, KeepaliveProcess};
use super::listener::{NullListener, SessionListener};
use crate::config::RegistrationConfig;
use crate::domain::session::{ErrorCode, ListenerEvent, Session, SessionEvent};
use crate::domain::shared::{Result, UaError};
use crate::infrastructure::timer::WakeupCallback;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exponential retry delay: `min(base * multiplier, cap)` seconds, the
/// multiplier doubling on every consecutive failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: u32,
    cap: u32,
    multiplier: u32,
}

impl Backoff {
    pub fn new(base: u32, cap: u32) -> Self {
        Self {
            base,
            cap,
            multiplier: 1,
        }
    }

    /// Delay for the next retry
    pub fn next_delay(&mut self) -> Duration {
        let secs = self.base.saturating_mul(self.multiplier).min(self.cap);
        if secs < self.cap {
            self.multiplier = self.multiplier.saturating_mul(2);
        }
        Duration::from_secs(u64::from(secs))
    }

    pub fn reset(&mut self) {
        self.multiplier = 1;
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }
}

/// Supervisor bookkeeping, guarded by the group lock
pub(crate) struct AutoRegistration {
    pub(crate) running: bool,
    pub(crate) registered: bool,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) backoff: Backoff,
    pub(crate) last_error: Option<(ErrorCode, String)>,
    pub(crate) session: Option<Arc<SessionCell>>,
    pub(crate) keepalive: Option<Arc<KeepaliveProcess>>,
    /// User's registration listener
    pub(crate) listener: Arc<dyn SessionListener>,
    refresh: Arc<dyn WakeupCallback>,
    tracker: Arc<dyn SessionListener>,
}

impl AutoRegistration {
    pub(crate) fn new(group: Weak<GroupInner>, config: &RegistrationConfig) -> Self {
        Self {
            running: false,
            registered: false,
            expires_at: None,
            backoff: Backoff::new(config.short_expiry, config.max_backoff),
            last_error: None,
            session: None,
            keepalive: None,
            listener: Arc::new(NullListener),
            refresh: Arc::new(RefreshWakeup {
                group: group.clone(),
            }),
            tracker: Arc::new(RegistrationTracker { group }),
        }
    }

    fn owns(&self, session: &SipSession) -> bool {
        self.running
            && self
                .session
                .as_ref()
                .is_some_and(|cell| Arc::ptr_eq(cell, &session.cell))
    }
}

/// Listener on the registration session; feeds outcomes back to the supervisor
struct RegistrationTracker {
    group: Weak<GroupInner>,
}

impl SessionListener for RegistrationTracker {
    fn on_registering(&self, session: &SipSession) {
        if let Some(group) = self.group.upgrade() {
            group.on_registering(session);
        }
    }

    fn on_registration_done(&self, session: &SipSession, duration: i32) {
        if let Some(group) = self.group.upgrade() {
            group.on_registration_done(session, duration);
        }
    }

    fn on_registration_failed(&self, session: &SipSession, code: ErrorCode, message: &str) {
        if let Some(group) = self.group.upgrade() {
            group.on_registration_failed(session, code, message);
        }
    }

    fn on_registration_timeout(&self, session: &SipSession) {
        if let Some(group) = self.group.upgrade() {
            group.on_registration_timeout(session);
        }
    }
}

/// Timer entry for both refreshes and backoff retries
struct RefreshWakeup {
    group: Weak<GroupInner>,
}

impl WakeupCallback for RefreshWakeup {
    fn on_wakeup(&self) {
        if let Some(group) = self.group.upgrade() {
            group.refresh_registration();
        }
    }
}

impl GroupInner {
    pub(crate) fn start_auto_registration(&self, listener: Arc<dyn SessionListener>) -> Result<()> {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UaError::GroupClosed);
            }

            let reg = &mut state.registration;
            reg.listener = listener;
            if reg.running {
                debug!("Auto-registration already running; listener replaced");
                return Ok(());
            }

            info!("Starting auto-registration for {}", self.profile.uri());
            reg.running = true;
            reg.registered = false;
            reg.expires_at = None;
            reg.last_error = None;
            reg.backoff.reset();

            let tracker = reg.tracker.clone();
            let cell = reg
                .session
                .get_or_insert_with(|| {
                    Arc::new(SessionCell::new(
                        Session::new(self.profile.clone()),
                        tracker.clone(),
                    ))
                })
                .clone();
            cell.set_listener(tracker);

            if state.connected {
                // Clear whatever bindings a previous run left behind
                if !self.dispatch(&mut state, &cell, &SessionEvent::Deregister, &mut deliveries) {
                    warn!("Registration session busy in {}; retrying later", cell.state());
                    self.schedule_retry(&mut state);
                }
            }
        }
        self.deliver(deliveries);
        Ok(())
    }

    pub(crate) fn stop_auto_registration(&self) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            self.stop_registration_locked(&mut state, &mut deliveries);
        }
        self.deliver(deliveries);
    }

    pub(crate) fn stop_registration_locked(&self, state: &mut GroupState, out: &mut Vec<Delivery>) {
        if !state.registration.running {
            return;
        }
        info!("Stopping auto-registration for {}", self.profile.uri());

        let was_registered = state.registration.registered;
        let cell = self.pause_registration(state);
        state.registration.last_error = None;

        if let Some(cell) = cell {
            cell.set_listener(Arc::new(NullListener));
            if was_registered && state.connected {
                if !self.dispatch(state, &cell, &SessionEvent::Deregister, out) {
                    debug!("Registration session busy in {}; no deregistration sent", cell.state());
                }
            }
        }
    }

    /// Stop timers and keepalive; returns the registration session
    fn pause_registration(&self, state: &mut GroupState) -> Option<Arc<SessionCell>> {
        let reg = &mut state.registration;
        reg.running = false;
        reg.registered = false;
        reg.expires_at = None;
        self.timer.cancel(&reg.refresh);
        if let Some(keepalive) = reg.keepalive.take() {
            keepalive.stop(&self.timer);
        }
        reg.session.clone()
    }

    pub(crate) fn set_registration_listener(&self, listener: Arc<dyn SessionListener>) {
        let delivery = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.registration.listener = listener.clone();
            let Some(cell) = state.registration.session.clone() else {
                return;
            };
            Delivery {
                listener,
                event: self.registration_status(&state, &cell),
                cell,
            }
        };
        self.deliver(vec![delivery]);
    }

    fn registration_status(&self, state: &GroupState, cell: &SessionCell) -> ListenerEvent {
        let reg = &state.registration;
        if !state.connected {
            return ListenerEvent::RegistrationFailed {
                code: ErrorCode::DataConnectionLost,
                message: "no data connection".to_string(),
            };
        }
        if !reg.running && reg.last_error.is_none() {
            return ListenerEvent::RegistrationFailed {
                code: ErrorCode::ClientError,
                message: "auto-registration not running".to_string(),
            };
        }
        if reg.registered {
            let remaining = reg
                .expires_at
                .map(|at| (at - Utc::now()).num_seconds())
                .unwrap_or_default()
                .clamp(0, i64::from(i32::MAX));
            return ListenerEvent::RegistrationDone {
                duration: i32::try_from(remaining).unwrap_or(i32::MAX),
            };
        }
        match &reg.last_error {
            Some((ErrorCode::TimeOut, _)) => ListenerEvent::RegistrationTimeout,
            Some((code, message)) => ListenerEvent::RegistrationFailed {
                code: *code,
                message: message.clone(),
            },
            None if cell.state().is_registration() => ListenerEvent::Registering,
            None => ListenerEvent::RegistrationFailed {
                code: ErrorCode::InProgress,
                message: "registration in progress".to_string(),
            },
        }
    }

    fn on_registering(&self, session: &SipSession) {
        let listener = {
            let mut state = self.state.lock();
            if !state.registration.owns(session) {
                return;
            }
            state.registration.registered = false;
            state.registration.listener.clone()
        };
        listener.on_registering(session);
    }

    fn on_registration_done(&self, session: &SipSession, duration: i32) {
        let mut deliveries = Vec::new();
        let listener = {
            let mut state = self.state.lock();
            if !state.registration.owns(session) {
                return;
            }
            let listener = state.registration.listener.clone();

            if duration > 0 {
                info!("Registered {} for {}s", self.profile.uri(), duration);
                let reg = &mut state.registration;
                reg.registered = true;
                reg.expires_at = Some(Utc::now() + chrono::Duration::seconds(i64::from(duration)));
                reg.last_error = None;
                reg.backoff.reset();
                let delay = self.config.refresh_delay(duration.unsigned_abs());
                self.schedule_refresh(&state, delay);
                self.start_keepalive_if_needed(&mut state);
            } else {
                state.registration.registered = false;
                state.registration.expires_at = None;
                if state.connected {
                    let cell = session.cell.clone();
                    let register = SessionEvent::Register {
                        expiry: self.config.expiry,
                    };
                    if !self.dispatch(&mut state, &cell, &register, &mut deliveries) {
                        warn!("Could not re-register from {}", cell.state());
                    }
                }
            }
            listener
        };
        listener.on_registration_done(session, duration);
        self.deliver(deliveries);
    }

    fn on_registration_failed(&self, session: &SipSession, code: ErrorCode, message: &str) {
        let listener = {
            let mut state = self.state.lock();
            if !state.registration.owns(session) {
                return;
            }
            let listener = state.registration.listener.clone();
            state.registration.last_error = Some((code, message.to_string()));
            state.registration.registered = false;
            state.registration.expires_at = None;

            match code {
                ErrorCode::InvalidCredentials | ErrorCode::ServerUnreachable => {
                    warn!("Registration of {} failed ({}); pausing", self.profile.uri(), code);
                    self.pause_registration(&mut state);
                }
                // Retried once connectivity returns
                ErrorCode::DataConnectionLost => {}
                _ => self.schedule_retry(&mut state),
            }
            listener
        };
        listener.on_registration_failed(session, code, message);
    }

    fn on_registration_timeout(&self, session: &SipSession) {
        let listener = {
            let mut state = self.state.lock();
            if !state.registration.owns(session) {
                return;
            }
            state.registration.last_error =
                Some((ErrorCode::TimeOut, "registration timed out".to_string()));
            state.registration.registered = false;
            state.registration.expires_at = None;
            self.schedule_retry(&mut state);
            state.registration.listener.clone()
        };
        listener.on_registration_timeout(session);
    }

    /// Refresh or retry, as scheduled on the wakeup timer
    pub(crate) fn refresh_registration(&self) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed || !state.registration.running || !state.connected {
                return;
            }
            let Some(cell) = state.registration.session.clone() else {
                return;
            };
            state.registration.last_error = None;

            debug!("Refreshing registration of {}", self.profile.uri());
            let register = SessionEvent::Register {
                expiry: self.config.expiry,
            };
            if !self.dispatch(&mut state, &cell, &register, &mut deliveries) {
                debug!("Registration session busy in {}; refresh skipped", cell.state());
            }
        }
        self.deliver(deliveries);
    }

    pub(crate) fn on_connectivity_changed(&self, connected: bool) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed || state.connected == connected {
                return;
            }
            state.connected = connected;

            if connected {
                info!("Data connection restored");
                if state.registration.running {
                    state.registration.backoff.reset();
                    state.registration.last_error = None;
                    if let Some(cell) = state.registration.session.clone() {
                        let register = SessionEvent::Register {
                            expiry: self.config.expiry,
                        };
                        if !self.dispatch(&mut state, &cell, &register, &mut deliveries) {
                            warn!("Could not register from {}", cell.state());
                        }
                    }
                }
            } else {
                warn!("Data connection lost");
                let registration_cell = state.registration.session.clone();
                let mut registration_notified = false;
                for cell in state.registry.sessions() {
                    if registration_cell
                        .as_ref()
                        .is_some_and(|reg| Arc::ptr_eq(reg, &cell))
                    {
                        registration_notified = true;
                    }
                    self.dispatch(&mut state, &cell, &SessionEvent::ConnectionLost, &mut deliveries);
                }

                let reg = &mut state.registration;
                self.timer.cancel(&reg.refresh);
                if let Some(keepalive) = reg.keepalive.take() {
                    keepalive.stop(&self.timer);
                }
                reg.registered = false;
                reg.expires_at = None;

                if reg.running && !registration_notified {
                    if let Some(cell) = registration_cell {
                        let message = "data connection lost".to_string();
                        reg.last_error = Some((ErrorCode::DataConnectionLost, message.clone()));
                        deliveries.push(Delivery {
                            listener: reg.listener.clone(),
                            cell,
                            event: ListenerEvent::RegistrationFailed {
                                code: ErrorCode::DataConnectionLost,
                                message,
                            },
                        });
                    }
                }
            }
        }
        self.deliver(deliveries);
    }

    fn schedule_retry(&self, state: &mut GroupState) {
        if !state.registration.running || !state.connected {
            return;
        }
        let delay = state.registration.backoff.next_delay();
        info!("Retrying registration of {} in {:?}", self.profile.uri(), delay);
        self.schedule_refresh(state, delay);
    }

    fn schedule_refresh(&self, state: &GroupState, delay: Duration) {
        let refresh = &state.registration.refresh;
        self.timer.cancel(refresh);
        if let Err(e) = self.timer.set(delay, refresh.clone()) {
            warn!("Could not schedule registration refresh: {}", e);
        }
    }

    fn start_keepalive_if_needed(&self, state: &mut GroupState) {
        if state.registration.keepalive.is_some() {
            return;
        }
        let local = self.transport.local_address();
        if !self.profile.send_keepalive() && !is_behind_nat(local) {
            debug!("{} is not behind a NAT; no keepalive", local);
            return;
        }
        info!("Starting keepalive every {:?}", self.config.keepalive_period());
        state.registration.keepalive = Some(KeepaliveProcess::start(
            self.this.clone(),
            &self.timer,
            self.config.keepalive_period(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(10, 3600);
        let delays: Vec<u64> = (0..11).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(
            delays,
            vec![10, 20, 40, 80, 160, 320, 640, 1280, 2560, 3600, 3600]
        );
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(10, 3600);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.multiplier(), 4);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
