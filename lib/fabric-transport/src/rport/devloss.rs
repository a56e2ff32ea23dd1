// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fast-fail and devloss timers armed when a target port is lost.

use std::sync::{Arc, Weak};
use std::time::Duration;

use slog::{debug, info, warn};

use super::{RemotePort, RportFlags, RportState};
use crate::adapter::HostInner;
use crate::config::BindType;
use crate::driver::DriverCaps;
use crate::ids::{ClassOfService, RportNumber};
use crate::teardown;
use crate::workq::DelayedWork;

#[derive(Default)]
pub(crate) struct DevlossTimers {
    fail_io: Option<DelayedWork>,
    dev_loss: Option<DelayedWork>,
}

impl DevlossTimers {
    pub(crate) fn dev_loss_armed(&self) -> bool {
        self.dev_loss.as_ref().is_some_and(DelayedWork::is_pending)
    }

    pub(crate) fn fail_io_armed(&self) -> bool {
        self.fail_io.as_ref().is_some_and(DelayedWork::is_pending)
    }

    fn is_empty(&self) -> bool {
        self.fail_io.is_none() && self.dev_loss.is_none()
    }
}

/// Delay before in-flight I/O is failed, if fast-fail applies at all.
pub(crate) fn fail_io_delay(
    fast_io_fail_tmo: Option<u32>,
    dev_loss_tmo: u32,
) -> Option<u32> {
    let fast = fast_io_fail_tmo?;
    (fast < dev_loss_tmo).then(|| fast.min(dev_loss_tmo).saturating_sub(1))
}

/// Arm the timer pair for a port that has just been blocked. Called with the
/// adapter lock held.
pub(crate) fn arm(inner: &Arc<HostInner>, port: &mut RemotePort) {
    if !port.timers.is_empty() {
        // Cancellation always takes the timers out of the port, so leftovers
        // mean a timer outlived its port state. Stop them rather than let two
        // devloss actions race.
        warn!(inner.log, "remote port blocked with timers outstanding";
            "rport" => port.number.0);
        let stale = std::mem::take(&mut port.timers);
        for work in [stale.fail_io, stale.dev_loss].into_iter().flatten() {
            work.cancel();
        }
    }

    let tmo = inner.config.effective_dev_loss_tmo(port.dev_loss_tmo);
    let host = Arc::downgrade(inner);

    let can_fail_io =
        inner.driver.capabilities().contains(DriverCaps::TERMINATE_RPORT_IO);
    if let Some(delay) = fail_io_delay(port.fast_io_fail_tmo, tmo) {
        if can_fail_io {
            port.timers.fail_io = Some(inner.devloss_q.queue_delayed(
                Duration::from_secs(u64::from(delay)),
                fail_io_expired(host.clone(), port.number),
            ));
        }
    }
    port.timers.dev_loss = Some(inner.devloss_q.queue_delayed(
        Duration::from_secs(u64::from(tmo)),
        dev_loss_expired(host, port.number),
    ));

    debug!(inner.log, "devloss timers armed";
        "rport" => port.number.0,
        "dev_loss_tmo" => tmo,
        "fast_io_fail" => port.timers.fail_io.is_some());
}

/// Cancel a port's timers, flushing the devloss queue if either had already
/// fired so that its expiry has run to completion before returning.
///
/// Must not be called from the devloss queue itself.
pub(crate) async fn cancel_timers(inner: &HostInner, timers: DevlossTimers) {
    let mut flush = false;
    for work in [timers.fail_io, timers.dev_loss].into_iter().flatten() {
        if !work.cancel() {
            flush = true;
        }
    }
    if flush {
        debug!(inner.log, "timer already fired, flushing devloss queue");
        inner.devloss_q.flush().await;
    }
}

async fn fail_io_expired(host: Weak<HostInner>, number: RportNumber) {
    let Some(inner) = host.upgrade() else {
        return;
    };
    let info = {
        let state = inner.state.lock().unwrap();
        let info = state
            .bindings
            .active()
            .find(|p| p.number == number && p.state == RportState::Blocked)
            .map(|p| p.info(inner.id));
        info
    };
    let Some(info) = info else {
        return;
    };
    info!(inner.log, "fast-fail timeout, terminating I/O";
        "rport" => number.0);
    inner.driver.terminate_rport_io(&info).await;
}

async fn dev_loss_expired(host: Weak<HostInner>, number: RportNumber) {
    let Some(inner) = host.upgrade() else {
        return;
    };
    let log = &inner.log;
    let bind_type = inner.config.bind_type;

    let mut state = inner.state.lock().unwrap();
    let Some(port) = state.bindings.active_mut(number) else {
        debug!(log, "devloss expiry for departed remote port";
            "rport" => number.0);
        return;
    };
    port.flags.remove(RportFlags::DEVLOSS_PENDING);
    if let Some(work) = port.timers.fail_io.take() {
        work.cancel();
    }
    port.timers.dev_loss = None;

    if port.state == RportState::Online && !port.ids.roles.is_target() {
        info!(log, "devloss timeout, no longer a target, removing target";
            "rport" => number.0);
        let unblock = port.take_io_block(inner.id);
        let queue = !port.flags.contains(RportFlags::STGT_DELETE_PENDING);
        port.flags.insert(RportFlags::STGT_DELETE_PENDING);
        drop(state);
        if let Some(address) = unblock {
            inner.stack.unblock_target(address);
        }
        if queue {
            inner
                .work_q
                .queue(teardown::stgt_delete(Arc::downgrade(&inner), number));
        }
        return;
    }

    if port.state != RportState::Blocked {
        info!(log, "devloss timeout, leaving target alone";
            "rport" => number.0,
            "state" => %port.state);
        return;
    }

    if bind_type == BindType::None {
        if let Some(mut port) = state.bindings.remove_active(number) {
            port.state = RportState::Deleted;
            info!(log, "devloss timeout, removing target";
                "rport" => number.0);
            inner
                .work_q
                .queue(teardown::final_delete(Arc::downgrade(&inner), port));
        }
        return;
    }

    info!(log, "devloss timeout, removing target and saving binding";
        "rport" => number.0,
        "remove" => inner.config.remove_on_dev_loss);
    let Some(port) = state.bindings.demote(number) else {
        return;
    };
    port.ids = bind_type.reset_for_binding(&port.ids);
    port.maxframe_size = None;
    port.supported_classes = ClassOfService::empty();
    port.state = RportState::NotPresent;
    port.flags.insert(RportFlags::STGT_DELETE_PENDING);
    let unblock = port.take_io_block(inner.id);
    drop(state);

    if let Some(address) = unblock {
        inner.stack.unblock_target(address);
    }
    inner
        .work_q
        .queue(teardown::stgt_delete(Arc::downgrade(&inner), number));
}
