// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote port lifecycle.
//!
//! A remote port is created the first time discovery reports an identity the
//! adapter has no record of, and moves through the following states:
//!
//! ```text
//! Creating -> Online <-> Blocked -> NotPresent (bound) -> Online
//!                |          |
//!                +----------+----> Deleted
//! ```
//!
//! All state changes happen under the adapter lock. Anything that may sleep
//! (storage stack calls, driver callbacks, queue flushes) happens with the
//! lock released, either inline in the notification handler or on one of the
//! adapter's work queues.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn};
use thiserror::Error;

use crate::adapter::{Adapter, HostFlag, HostInner, HostState};
use crate::config::{fast_io_fail_secs, AdapterConfig, ConfigError};
use crate::driver::{StackError, TargetAddress};
use crate::events::EventKind;
use crate::ids::{
    AdapterId, ClassOfService, PortId, RemotePortIdentity, RportNumber,
    RportRoles, TargetId, Wwn,
};
use crate::teardown;

pub mod binding;
pub(crate) mod devloss;

use devloss::DevlossTimers;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("adapter is being removed")]
    HostRemoving,

    #[error("no such remote port")]
    UnknownPort,

    #[error("numeric target id space exhausted")]
    TargetIdsExhausted,

    #[error("remote port registration failed")]
    Registration(#[from] StackError),

    #[error("invalid timeout")]
    InvalidTimeout(#[from] ConfigError),
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RportState {
    Creating,
    Online,
    Blocked,
    NotPresent,
    Deleted,
}

bitflags! {
    #[derive(
        Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    )]
    pub struct RportFlags: u32 {
        const SCAN_PENDING = 1 << 0;
        /// Devloss timers are (or were just) armed and teardown has not run.
        const DEVLOSS_PENDING = 1 << 1;
        /// Target teardown is queued on the adapter work queue.
        const STGT_DELETE_PENDING = 1 << 2;
        /// The storage stack has been told to stop issuing I/O to the target.
        const IO_BLOCKED = 1 << 3;
    }
}

/// Opaque reference to a remote port, returned from discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RemotePortHandle(RportNumber);

impl RemotePortHandle {
    pub fn number(&self) -> RportNumber {
        self.0
    }
}

/// Link attributes a driver may report for a remote port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RportAttrs {
    pub maxframe_size: Option<u32>,
    pub supported_classes: ClassOfService,
}

pub(crate) struct RemotePort {
    pub(crate) number: RportNumber,
    pub(crate) channel: u32,
    pub(crate) ids: RemotePortIdentity,
    pub(crate) target_id: Option<TargetId>,
    pub(crate) dev_loss_tmo: u32,
    pub(crate) fast_io_fail_tmo: Option<u32>,
    pub(crate) state: RportState,
    pub(crate) flags: RportFlags,
    pub(crate) maxframe_size: Option<u32>,
    pub(crate) supported_classes: ClassOfService,
    pub(crate) timers: DevlossTimers,
}

/// Point-in-time view of a remote port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemotePortInfo {
    pub host: AdapterId,
    pub number: RportNumber,
    pub channel: u32,
    pub node_name: Wwn,
    pub port_name: Wwn,
    pub port_id: PortId,
    pub roles: RportRoles,
    pub target_id: Option<TargetId>,
    pub state: RportState,
    pub flags: RportFlags,
    pub dev_loss_tmo: u32,
    pub fast_io_fail_tmo: Option<u32>,
    pub maxframe_size: Option<u32>,
    pub supported_classes: ClassOfService,
    pub dev_loss_armed: bool,
    pub fail_io_armed: bool,
}

impl RemotePort {
    pub(crate) fn new(
        number: RportNumber,
        channel: u32,
        ids: RemotePortIdentity,
        target_id: Option<TargetId>,
        config: &AdapterConfig,
    ) -> Self {
        Self {
            number,
            channel,
            ids,
            target_id,
            dev_loss_tmo: config.dev_loss_tmo,
            fast_io_fail_tmo: fast_io_fail_secs(config.fast_io_fail_tmo),
            state: RportState::Creating,
            flags: RportFlags::empty(),
            maxframe_size: None,
            supported_classes: ClassOfService::empty(),
            timers: DevlossTimers::default(),
        }
    }

    pub(crate) fn handle(&self) -> RemotePortHandle {
        RemotePortHandle(self.number)
    }

    pub(crate) fn address(&self, host: AdapterId) -> Option<TargetAddress> {
        self.target_id.map(|target| TargetAddress {
            adapter: host,
            channel: self.channel,
            target,
        })
    }

    pub(crate) fn info(&self, host: AdapterId) -> RemotePortInfo {
        RemotePortInfo {
            host,
            number: self.number,
            channel: self.channel,
            node_name: self.ids.node_name,
            port_name: self.ids.port_name,
            port_id: self.ids.port_id,
            roles: self.ids.roles,
            target_id: self.target_id,
            state: self.state,
            flags: self.flags,
            dev_loss_tmo: self.dev_loss_tmo,
            fast_io_fail_tmo: self.fast_io_fail_tmo,
            maxframe_size: self.maxframe_size,
            supported_classes: self.supported_classes,
            dev_loss_armed: self.timers.dev_loss_armed(),
            fail_io_armed: self.timers.fail_io_armed(),
        }
    }

    /// Clear the I/O block marker, returning the target to unblock if the
    /// storage stack was told to block it.
    pub(crate) fn take_io_block(
        &mut self,
        host: AdapterId,
    ) -> Option<TargetAddress> {
        if self.flags.contains(RportFlags::IO_BLOCKED) {
            self.flags.remove(RportFlags::IO_BLOCKED);
            self.address(host)
        } else {
            None
        }
    }
}

/// Queue a scan of the port's target. Called with the adapter lock held.
pub(crate) fn queue_scan(inner: &Arc<HostInner>, port: &mut RemotePort) {
    let Some(address) = port.address(inner.id) else {
        return;
    };
    port.flags.insert(RportFlags::SCAN_PENDING);
    inner.pending_scans.fetch_add(1, Ordering::SeqCst);
    inner
        .scan_q
        .queue(scan_rport(Arc::downgrade(inner), port.number, address));
}

async fn scan_rport(
    host: Weak<HostInner>,
    number: RportNumber,
    address: TargetAddress,
) {
    let Some(inner) = host.upgrade() else {
        return;
    };
    let scan = {
        let state = inner.state.lock().unwrap();
        let online = state.bindings.active().any(|p| {
            p.number == number
                && p.state == RportState::Online
                && p.ids.roles.is_target()
        });
        online
    };
    if scan {
        debug!(inner.log, "scanning target"; "target" => %address);
        inner.stack.scan_target(address).await;
    }

    let mut state = inner.state.lock().unwrap();
    if let Some(port) = state.bindings.get_mut(number) {
        port.flags.remove(RportFlags::SCAN_PENDING);
    }
    inner.pending_scans.fetch_sub(1, Ordering::SeqCst);
}

/// Outcome of looking up a discovered identity, decided under the lock.
enum Appearance {
    /// A blocked port came back inside its grace period.
    Reactivated { number: RportNumber, timers: DevlossTimers, target: bool },
    /// The port is already live; only its roles may need updating.
    Duplicate { number: RportNumber, roles: Option<RportRoles> },
    /// A bound record was brought back into service.
    Rebound { number: RportNumber, unblock: Option<TargetAddress> },
    /// The matching bound record still has teardown queued.
    Retry,
    Create,
}

enum RoleChange {
    None,
    Gained(DevlossTimers),
    Dropped,
    Delete,
}

impl Adapter {
    /// Discovery reports a remote port on `channel`.
    ///
    /// The port is matched against blocked ports, then live ports, then bound
    /// records under the adapter's bind type, before a new port is created.
    /// A matching bound record lends the new port its numeric target id.
    pub async fn port_appeared(
        &self,
        channel: u32,
        ids: RemotePortIdentity,
    ) -> Result<RemotePortHandle, PortError> {
        let inner = &self.0;
        let _serial = inner.transitions.lock().await;

        loop {
            if inner.flag() != HostFlag::Ready {
                warn!(inner.log, "adapter going away, not adding remote port";
                    "port_name" => %ids.port_name);
                return Err(PortError::HostRemoving);
            }

            // Let any queued target teardown finish first.
            inner.work_q.flush().await;

            let appearance = {
                let mut guard = inner.state.lock().unwrap();
                resolve(inner, &mut guard, channel, &ids)
            };

            match appearance {
                Appearance::Reactivated { number, timers, target } => {
                    self.reactivate(number, timers, target).await;
                    return Ok(RemotePortHandle(number));
                }
                Appearance::Duplicate { number, roles } => {
                    debug!(inner.log, "duplicate remote port notification";
                        "rport" => number.0);
                    if let Some(roles) = roles {
                        self.change_roles(number, roles).await;
                    }
                    return Ok(RemotePortHandle(number));
                }
                Appearance::Rebound { number, unblock } => {
                    if let Some(address) = unblock {
                        inner.stack.unblock_target(address);
                    }
                    let address = self.target_address(RemotePortHandle(number));
                    if let Some(address) = address {
                        if ids.roles.is_target() {
                            inner.publish(EventKind::NewTarget {
                                address,
                                port_name: ids.port_name,
                            });
                        }
                    }
                    info!(inner.log, "remote port rebound";
                        "rport" => number.0,
                        "channel" => channel,
                        "port_name" => %ids.port_name);
                    return Ok(RemotePortHandle(number));
                }
                Appearance::Retry => {
                    debug!(inner.log, "bound port teardown pending, retrying";
                        "port_name" => %ids.port_name);
                    continue;
                }
                Appearance::Create => {
                    return self.rport_create(channel, ids).await;
                }
            }
        }
    }

    async fn reactivate(
        &self,
        number: RportNumber,
        timers: DevlossTimers,
        target: bool,
    ) {
        let inner = &self.0;
        devloss::cancel_timers(inner, timers).await;

        let unblock = {
            let mut state = inner.state.lock().unwrap();
            state.bindings.active_mut(number).and_then(|port| {
                port.flags.remove(RportFlags::DEVLOSS_PENDING);
                port.take_io_block(inner.id)
            })
        };
        if let Some(address) = unblock {
            inner.stack.unblock_target(address);
        }

        if target {
            info!(inner.log, "remote port reactivated"; "rport" => number.0);
        } else {
            info!(
                inner.log,
                "remote port returned without target role, removing target";
                "rport" => number.0
            );
            inner
                .work_q
                .queue(teardown::stgt_delete(Arc::downgrade(inner), number));
        }
    }

    async fn rport_create(
        &self,
        channel: u32,
        ids: RemotePortIdentity,
    ) -> Result<RemotePortHandle, PortError> {
        let inner = &self.0;
        let (number, target_id, info) = {
            let mut state = inner.state.lock().unwrap();
            let target_id = if ids.roles.is_target() {
                Some(state.ids.alloc_target().ok_or_else(|| {
                    warn!(inner.log, "target ids exhausted";
                        "port_name" => %ids.port_name);
                    PortError::TargetIdsExhausted
                })?)
            } else {
                None
            };
            if let Some(target) = target_id {
                debug_assert!(!state.bindings.target_in_use(channel, target));
            }
            let number = state.ids.alloc_rport();
            let port =
                RemotePort::new(number, channel, ids, target_id, &inner.config);
            let info = port.info(inner.id);
            state.bindings.insert(port);
            (number, target_id, info)
        };

        if let Err(e) = inner.stack.rport_added(&info).await {
            let mut state = inner.state.lock().unwrap();
            state.bindings.remove_active(number);
            if let Some(target) = target_id {
                state.ids.release_target(target);
            }
            warn!(inner.log, "remote port registration failed";
                "rport" => number.0,
                "port_name" => %ids.port_name,
                "error" => %e);
            return Err(PortError::Registration(e));
        }

        let address = {
            let mut state = inner.state.lock().unwrap();
            let Some(port) = state.bindings.active_mut(number) else {
                return Err(PortError::HostRemoving);
            };
            port.state = RportState::Online;
            if port.ids.roles.is_target() {
                queue_scan(inner, port);
            }
            port.address(inner.id)
        };

        info!(inner.log, "remote port created";
            "rport" => number.0,
            "channel" => channel,
            "target" => ?target_id,
            "port_name" => %ids.port_name);
        if let Some(address) = address {
            inner.publish(EventKind::NewTarget {
                address,
                port_name: ids.port_name,
            });
        }
        Ok(RemotePortHandle(number))
    }

    /// Discovery reports that a remote port is gone.
    ///
    /// A port with a numeric target id is blocked for its devloss timeout so
    /// that it may return without disturbing its target. Any other port is
    /// deleted outright.
    pub async fn port_disappeared(&self, handle: RemotePortHandle) {
        let inner = &self.0;
        let _serial = inner.transitions.lock().await;
        let number = handle.number();

        let (address, port_name) = {
            let mut state = inner.state.lock().unwrap();
            if state.flag != HostFlag::Ready {
                warn!(
                    inner.log,
                    "adapter going away, remote ports go with it";
                    "rport" => number.0
                );
                return;
            }
            let Some(port) = state.bindings.active_mut(number) else {
                warn!(inner.log, "loss reported for unknown remote port";
                    "rport" => number.0);
                return;
            };
            if port.state != RportState::Online {
                warn!(inner.log, "remote port already blocked";
                    "rport" => number.0,
                    "state" => %port.state);
                return;
            }

            let port_name = port.ids.port_name;
            match port.address(inner.id) {
                Some(address) => {
                    port.state = RportState::Blocked;
                    port.flags.insert(
                        RportFlags::DEVLOSS_PENDING | RportFlags::IO_BLOCKED,
                    );
                    (address, port_name)
                }
                None => {
                    let removed = state.bindings.remove_active(number);
                    if let Some(mut port) = removed {
                        port.state = RportState::Deleted;
                        info!(
                            inner.log,
                            "non-target remote port gone, deleting";
                            "rport" => number.0
                        );
                        inner.work_q.queue(teardown::final_delete(
                            Arc::downgrade(inner),
                            port,
                        ));
                    }
                    return;
                }
            }
        };

        inner.stack.block_target(address);
        {
            let mut state = inner.state.lock().unwrap();
            if let Some(port) = state.bindings.active_mut(number) {
                if port.state == RportState::Blocked {
                    devloss::arm(inner, port);
                }
            }
        }

        info!(inner.log, "remote port blocked";
            "rport" => number.0,
            "channel" => address.channel,
            "target" => address.target.0);
        inner.publish(EventKind::RemovedTarget { address, port_name });
    }

    /// Discovery reports a new role set for a known remote port.
    pub async fn port_role_changed(
        &self,
        handle: RemotePortHandle,
        roles: RportRoles,
    ) {
        let inner = &self.0;
        let _serial = inner.transitions.lock().await;
        if inner.flag() != HostFlag::Ready {
            warn!(inner.log, "adapter is being removed, ignoring role change";
                "rport" => handle.number().0);
            return;
        }
        self.change_roles(handle.number(), roles).await;
    }

    async fn change_roles(&self, number: RportNumber, roles: RportRoles) {
        let inner = &self.0;
        let change = {
            let mut guard = inner.state.lock().unwrap();
            let state = &mut *guard;
            let Some(port) = state.bindings.active_mut(number) else {
                warn!(inner.log, "role change for unknown remote port";
                    "rport" => number.0);
                return;
            };

            let was_target = port.ids.roles.is_target();
            let mut change = RoleChange::None;
            if roles.is_target() {
                if port.target_id.is_none() {
                    match state.ids.alloc_target() {
                        Some(target) => {
                            port.target_id = Some(target);
                            change =
                                RoleChange::Gained(DevlossTimers::default());
                        }
                        None => {
                            warn!(inner.log, "target ids exhausted";
                                "rport" => number.0);
                        }
                    }
                } else if !was_target {
                    change = RoleChange::Gained(DevlossTimers::default());
                }
            } else if was_target {
                if roles.is_empty() {
                    change = RoleChange::Delete;
                } else if port.state == RportState::Online {
                    port.flags.insert(RportFlags::STGT_DELETE_PENDING);
                    change = RoleChange::Dropped;
                }
                // A blocked port keeps its devloss timer running in case the
                // role comes back before it fires.
            }
            port.ids.roles = roles;
            if let RoleChange::Gained(timers) = &mut change {
                *timers = std::mem::take(&mut port.timers);
            }

            if let RoleChange::Delete = change {
                if let Some(mut port) = state.bindings.remove_active(number) {
                    port.state = RportState::Deleted;
                    inner.work_q.queue(teardown::final_delete(
                        Arc::downgrade(inner),
                        port,
                    ));
                }
            }
            change
        };

        match change {
            RoleChange::None => {}
            RoleChange::Dropped => {
                info!(inner.log, "remote port lost target role";
                    "rport" => number.0);
                inner.work_q.queue(teardown::stgt_delete(
                    Arc::downgrade(inner),
                    number,
                ));
            }
            RoleChange::Delete => {
                info!(inner.log, "remote port has no roles left, deleting";
                    "rport" => number.0);
            }
            RoleChange::Gained(timers) => {
                devloss::cancel_timers(inner, timers).await;
                {
                    let mut state = inner.state.lock().unwrap();
                    if let Some(port) = state.bindings.active_mut(number) {
                        port.flags.remove(RportFlags::DEVLOSS_PENDING);
                    }
                }
                inner.work_q.flush().await;

                let (unblock, address, port_name) = {
                    let mut state = inner.state.lock().unwrap();
                    let Some(port) = state.bindings.active_mut(number) else {
                        return;
                    };
                    if port.state == RportState::Blocked {
                        port.state = RportState::Online;
                    }
                    queue_scan(inner, port);
                    (
                        port.take_io_block(inner.id),
                        port.address(inner.id),
                        port.ids.port_name,
                    )
                };
                if let Some(address) = unblock {
                    inner.stack.unblock_target(address);
                }
                info!(inner.log, "remote port gained target role";
                    "rport" => number.0,
                    "target" => ?address.map(|a| a.target));
                if let Some(address) = address {
                    inner.publish(EventKind::NewTarget { address, port_name });
                }
            }
        }
    }

    /// Adapter-initiated removal of a remote port.
    ///
    /// Unlike a devloss timeout, the numeric target id is not kept in the
    /// bound list. A port that never had a target is deleted before this
    /// returns; otherwise teardown is queued.
    pub async fn remote_port_remove(&self, handle: RemotePortHandle) {
        let inner = &self.0;
        let _serial = inner.transitions.lock().await;
        let number = handle.number();

        let (port, was_live) = {
            let mut state = inner.state.lock().unwrap();
            if state.flag != HostFlag::Ready {
                warn!(
                    inner.log,
                    "adapter going away, remote ports go with it";
                    "rport" => number.0
                );
                return;
            }
            let Some(mut port) = state.bindings.remove(number) else {
                warn!(inner.log, "removal of unknown remote port";
                    "rport" => number.0);
                return;
            };
            let was_live =
                matches!(port.state, RportState::Online | RportState::Blocked);
            port.state = RportState::Deleted;
            (port, was_live)
        };

        info!(inner.log, "removing remote port";
            "rport" => number.0,
            "target" => ?port.target_id);
        match port.address(inner.id) {
            None => {
                teardown::final_delete(Arc::downgrade(inner), port).await;
            }
            Some(address) => {
                let port_name = port.ids.port_name;
                inner
                    .work_q
                    .queue(teardown::final_delete(Arc::downgrade(inner), port));
                if was_live {
                    inner.publish(EventKind::RemovedTarget {
                        address,
                        port_name,
                    });
                }
            }
        }
    }

    /// Set the devloss timeout for a port. Takes effect the next time the port
    /// is lost.
    pub fn set_dev_loss_tmo(
        &self,
        handle: RemotePortHandle,
        secs: u32,
    ) -> Result<(), PortError> {
        self.0.config.check_dev_loss_tmo(secs)?;
        let mut state = self.0.state.lock().unwrap();
        let port = state
            .bindings
            .get_mut(handle.number())
            .ok_or(PortError::UnknownPort)?;
        if let Some(fast) = port.fast_io_fail_tmo {
            if fast >= secs {
                return Err(ConfigError::FastIoFailTmo {
                    value: fast as i32,
                    dev_loss_tmo: secs,
                }
                .into());
            }
        }
        port.dev_loss_tmo = secs;
        Ok(())
    }

    /// Set the fast-fail timeout for a port. Zero, negative or `None`
    /// disables it.
    pub fn set_fast_io_fail_tmo(
        &self,
        handle: RemotePortHandle,
        value: Option<i32>,
    ) -> Result<(), PortError> {
        let secs = fast_io_fail_secs(value);
        let mut state = self.0.state.lock().unwrap();
        let port = state
            .bindings
            .get_mut(handle.number())
            .ok_or(PortError::UnknownPort)?;
        if let Some(fast) = secs {
            if fast >= port.dev_loss_tmo {
                return Err(ConfigError::FastIoFailTmo {
                    value: fast as i32,
                    dev_loss_tmo: port.dev_loss_tmo,
                }
                .into());
            }
        }
        port.fast_io_fail_tmo = secs;
        Ok(())
    }

    pub fn set_rport_attrs(
        &self,
        handle: RemotePortHandle,
        attrs: RportAttrs,
    ) -> Result<(), PortError> {
        let mut state = self.0.state.lock().unwrap();
        let port = state
            .bindings
            .get_mut(handle.number())
            .ok_or(PortError::UnknownPort)?;
        port.maxframe_size = attrs.maxframe_size;
        port.supported_classes = attrs.supported_classes;
        Ok(())
    }
}

/// Match `ids` against the registry and apply whatever can be applied under
/// the lock.
fn resolve(
    inner: &Arc<HostInner>,
    state: &mut HostState,
    channel: u32,
    ids: &RemotePortIdentity,
) -> Appearance {
    if let Some(number) = state.bindings.find_blocked(channel, ids) {
        let Some(port) = state.bindings.active_mut(number) else {
            return Appearance::Create;
        };
        port.ids = *ids;
        port.state = RportState::Online;
        let timers = std::mem::take(&mut port.timers);
        let target = ids.roles.is_target();
        if !target {
            port.flags.insert(RportFlags::STGT_DELETE_PENDING);
        }
        return Appearance::Reactivated { number, timers, target };
    }

    if let Some(number) = state.bindings.find_live(channel, ids) {
        let Some(port) = state.bindings.active_mut(number) else {
            return Appearance::Create;
        };
        port.ids.node_name = ids.node_name;
        port.ids.port_name = ids.port_name;
        port.ids.port_id = ids.port_id;
        let roles = (port.ids.roles != ids.roles).then_some(ids.roles);
        return Appearance::Duplicate { number, roles };
    }

    if let Some(number) = state.bindings.find_bound(channel, ids) {
        let pending = state
            .bindings
            .get(number)
            .is_some_and(|p| p.flags.contains(RportFlags::STGT_DELETE_PENDING));
        if pending {
            return Appearance::Retry;
        }
        let Some(port) = state.bindings.promote(number) else {
            return Appearance::Create;
        };
        port.ids = *ids;
        port.state = RportState::Online;
        if ids.roles.is_target() {
            queue_scan(inner, port);
        }
        let unblock = port.take_io_block(inner.id);
        return Appearance::Rebound { number, unblock };
    }

    Appearance::Create
}
