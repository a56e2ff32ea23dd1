// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Target and remote port teardown, run from the adapter work queue.

use std::sync::Weak;

use slog::{debug, info};

use crate::adapter::{HostFlag, HostInner};
use crate::driver::{DriverCaps, TargetAddress};
use crate::ids::RportNumber;
use crate::rport::devloss::{self, DevlossTimers};
use crate::rport::{RemotePort, RemotePortInfo, RportFlags};

/// Let the driver abort whatever I/O it still has outstanding to the port.
async fn quiesce_driver(inner: &HostInner, info: &RemotePortInfo) {
    let caps = inner.driver.capabilities();
    if caps.contains(DriverCaps::DEV_LOSS_CALLBACK) {
        inner.driver.dev_loss_tmo_callback(info).await;
    } else if caps.contains(DriverCaps::TERMINATE_RPORT_IO) {
        inner.driver.terminate_rport_io(info).await;
    }
}

async fn teardown_target(
    inner: &HostInner,
    info: &RemotePortInfo,
    address: TargetAddress,
    timers: DevlossTimers,
) {
    quiesce_driver(inner, info).await;
    devloss::cancel_timers(inner, timers).await;

    // Targets are always removed while the adapter itself goes away.
    let removing = inner.flag() != HostFlag::Ready;
    if inner.config.remove_on_dev_loss || removing {
        info!(inner.log, "removing target"; "target" => %address);
        inner.stack.remove_target(address).await;
    } else {
        info!(inner.log, "marking target offline"; "target" => %address);
        inner.stack.offline_target(address).await;
    }
}

/// Remove the logical target of a port that remains registered, either in
/// `active` (role dropped) or in `bound` (devloss expired).
pub(crate) async fn stgt_delete(host: Weak<HostInner>, number: RportNumber) {
    let Some(inner) = host.upgrade() else {
        return;
    };
    let found = {
        let mut state = inner.state.lock().unwrap();
        state.bindings.get_mut(number).and_then(|port| {
            let address = port.address(inner.id)?;
            let timers = if port.flags.contains(RportFlags::DEVLOSS_PENDING) {
                std::mem::take(&mut port.timers)
            } else {
                DevlossTimers::default()
            };
            Some((port.info(inner.id), address, timers))
        })
    };
    // A port that left the registry in the meantime is torn down by its
    // final delete instead.
    let Some((info, address, timers)) = found else {
        debug!(inner.log, "target delete for departed remote port";
            "rport" => number.0);
        return;
    };

    teardown_target(&inner, &info, address, timers).await;

    let mut state = inner.state.lock().unwrap();
    if let Some(port) = state.bindings.get_mut(number) {
        port.flags.remove(
            RportFlags::STGT_DELETE_PENDING | RportFlags::DEVLOSS_PENDING,
        );
    }
}

/// Release a port that has already been detached from the registry.
pub(crate) async fn final_delete(host: Weak<HostInner>, mut port: RemotePort) {
    let Some(inner) = host.upgrade() else {
        return;
    };

    // Reclaim an outstanding scan before anything is removed underneath it.
    if port.flags.contains(RportFlags::SCAN_PENDING) {
        inner.scan_q.flush().await;
    }
    if let Some(address) = port.take_io_block(inner.id) {
        inner.stack.unblock_target(address);
    }

    port.flags.remove(RportFlags::DEVLOSS_PENDING);
    let timers = std::mem::take(&mut port.timers);
    let info = port.info(inner.id);
    match port.address(inner.id) {
        Some(address) => {
            teardown_target(&inner, &info, address, timers).await;
        }
        None => {
            devloss::cancel_timers(&inner, timers).await;
            quiesce_driver(&inner, &info).await;
        }
    }

    inner.stack.rport_removed(&info).await;
    debug!(inner.log, "remote port deleted"; "rport" => port.number.0);
}
