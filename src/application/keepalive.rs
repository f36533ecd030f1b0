//! NAT keepalive
//!
//! While registered from behind a NAT, send an out-of-dialog OPTIONS every
//! `keepalive_interval` seconds so the binding the registrar sees stays open.

use super::group::GroupInner;
use crate::infrastructure::timer::{WakeupCallback, WakeupTimer};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct KeepaliveProcess {
    group: Weak<GroupInner>,
    period: Duration,
    this: Weak<KeepaliveProcess>,
}

impl KeepaliveProcess {
    pub(crate) fn start(group: Weak<GroupInner>, timer: &WakeupTimer, period: Duration) -> Arc<Self> {
        let keepalive = Arc::new_cyclic(|this| Self {
            group,
            period,
            this: this.clone(),
        });
        keepalive.schedule(timer);
        keepalive
    }

    fn schedule(&self, timer: &WakeupTimer) {
        if let Some(this) = self.this.upgrade() {
            if let Err(e) = timer.set(self.period, this) {
                warn!("Could not schedule keepalive: {}", e);
            }
        }
    }

    pub(crate) fn stop(&self, timer: &WakeupTimer) {
        if let Some(this) = self.this.upgrade() {
            let callback: Arc<dyn WakeupCallback> = this;
            timer.cancel(&callback);
            debug!("Keepalive stopped");
        }
    }
}

impl WakeupCallback for KeepaliveProcess {
    fn on_wakeup(&self) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        let state = group.state.lock();
        let current = state
            .registration
            .keepalive
            .as_ref()
            .is_some_and(|k| std::ptr::eq(Arc::as_ptr(k), self));
        if state.closed || !current {
            debug!("Stale keepalive; not rescheduled");
            return;
        }

        match group.transport.send_keepalive(&group.profile) {
            Ok(()) => debug!("Keepalive sent for {}", group.profile.uri()),
            Err(e) => warn!("Keepalive failed: {}", e),
        }
        self.schedule(&group.timer);
    }
}

/// Whether `addr` looks like it sits behind a NAT: RFC 1918 and RFC 6598
/// (carrier-grade) IPv4 ranges, and IPv6 unique-local addresses
pub fn is_behind_nat(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private() || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
