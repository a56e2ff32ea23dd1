// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual adapters (NPIV vports) layered on a physical adapter.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use futures::future::BoxFuture;
use serde::Serialize;
use slog::{error, info, warn};
use thiserror::Error;

use crate::adapter::{Adapter, AdapterInit, HostFlag, HostInner, PortType};
use crate::config::AdapterConfig;
use crate::driver::{DriverCaps, DriverError, HostPortState, VportRequest};
use crate::events::EventKind;
use crate::ids::{VportNumber, Wwn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VportError {
    #[error("virtual adapters not supported")]
    NotSupported,

    #[error("adapter is being removed")]
    HostRemoving,

    #[error("virtual adapter quota exhausted")]
    NoSpace,

    #[error("virtual adapter is still being created")]
    Busy,

    #[error("virtual adapter termination already in progress")]
    AlreadyInProgress,

    #[error("virtual adapter already terminated")]
    AlreadyDone,

    #[error("driver rejected request")]
    DriverRejected(#[source] DriverError),
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct VportFlags: u32 {
        const CREATING = 1 << 0;
        const DELETING = 1 << 1;
        const DISABLED = 1 << 2;
    }
}

/// Caller-supplied identity for a new virtual adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VportArgs {
    pub node_name: Wwn,
    pub port_name: Wwn,
    /// Created through the driver's legacy interface.
    pub legacy: bool,
}

/// Bookkeeping a physical adapter keeps for each of its virtual adapters.
pub(crate) struct VportEntry {
    pub(crate) number: VportNumber,
    flags: VportFlags,
    vhost: Adapter,
    req: VportRequest,
}

/// A virtual adapter, as returned to whoever created it.
#[derive(Clone, Debug)]
pub struct VirtualAdapter {
    number: VportNumber,
    parent: Weak<HostInner>,
    vhost: Adapter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Physical,
    Virtual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum VportState {
    Active,
    Offline,
    Disabled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VportInfo {
    pub link_type: LinkType,
    pub node_name: Wwn,
    pub port_name: Wwn,
    pub state: VportState,
    /// Quota and usage; only meaningful for a physical adapter.
    pub vports_max: Option<u32>,
    pub vports_inuse: Option<u32>,
}

impl From<HostPortState> for VportState {
    fn from(value: HostPortState) -> Self {
        match value {
            HostPortState::Online => VportState::Active,
            HostPortState::Offline => VportState::Offline,
            _ => VportState::Failed,
        }
    }
}

impl Adapter {
    /// Create a virtual adapter on this (physical) adapter.
    ///
    /// A quota slot is held from the moment the request is accepted; it is
    /// given back if the driver refuses the vport.
    pub async fn vport_create(
        &self,
        args: VportArgs,
    ) -> Result<VirtualAdapter, VportError> {
        let inner = &self.0;
        let caps = inner.driver.capabilities();
        if inner.port_type != PortType::Physical
            || !caps.contains(DriverCaps::VPORT_CREATE)
        {
            return Err(VportError::NotSupported);
        }

        let (number, req, vhost) = {
            let mut guard = inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.flag != HostFlag::Ready {
                warn!(inner.log, "adapter going away, not creating vport");
                return Err(VportError::HostRemoving);
            }
            if state.vports_inuse >= inner.config.max_vports {
                warn!(inner.log, "vport quota exhausted";
                    "max_vports" => inner.config.max_vports);
                return Err(VportError::NoSpace);
            }
            state.vports_inuse += 1;
            let number = state.ids.alloc_vport();

            let vhost = Adapter::build(
                &inner.log.new(slog::o!("vport" => number.0)),
                AdapterInit {
                    config: AdapterConfig {
                        max_vports: 0,
                        ..inner.config.clone()
                    },
                    node_name: args.node_name,
                    port_name: args.port_name,
                    driver: inner.driver.clone(),
                    stack: inner.stack.clone(),
                },
                PortType::Npiv,
                Some(Arc::downgrade(inner)),
            );
            let req = VportRequest {
                parent: inner.id,
                vhost: vhost.id(),
                number,
                node_name: args.node_name,
                port_name: args.port_name,
                legacy: args.legacy,
            };
            state.vports.push(VportEntry {
                number,
                flags: VportFlags::CREATING,
                vhost: vhost.clone(),
                req: req.clone(),
            });
            (number, req, vhost)
        };

        let created = inner.driver.vport_create(&req).await;

        // A vport that finished creation after its parent started going
        // away would be missed by the parent's teardown, so it is undone
        // here as well.
        let committed = {
            let mut state = inner.state.lock().unwrap();
            let ready = state.flag == HostFlag::Ready;
            match state.vports.iter_mut().find(|v| v.number == number) {
                Some(entry) if created.is_ok() && ready => {
                    entry.flags.remove(VportFlags::CREATING);
                    true
                }
                _ => {
                    state.vports.retain(|v| v.number != number);
                    state.vports_inuse = state.vports_inuse.saturating_sub(1);
                    false
                }
            }
        };

        if !committed {
            if created.is_ok() && caps.contains(DriverCaps::VPORT_DELETE) {
                if let Err(e) = inner.driver.vport_delete(&req).await {
                    error!(inner.log, "failed to undo vport creation";
                        "vport" => number.0, "error" => %e);
                }
            }
            vhost.host_removed().await;
            return Err(match created {
                Err(e) => {
                    warn!(inner.log, "driver rejected vport";
                        "vport" => number.0, "error" => %e);
                    VportError::DriverRejected(e)
                }
                Ok(()) => VportError::HostRemoving,
            });
        }

        info!(inner.log, "vport created";
            "vport" => number.0,
            "vhost" => vhost.id().0,
            "port_name" => %args.port_name);
        inner.publish(EventKind::NewVport { number, vhost: vhost.id() });
        Ok(VirtualAdapter { number, parent: Arc::downgrade(inner), vhost })
    }

    /// Number of virtual adapters counted against this adapter's quota.
    pub fn vports_inuse(&self) -> u32 {
        self.0.state.lock().unwrap().vports_inuse
    }

    pub fn vports(&self) -> Vec<VirtualAdapter> {
        let state = self.0.state.lock().unwrap();
        state
            .vports
            .iter()
            .filter(|v| !v.flags.contains(VportFlags::CREATING))
            .map(|v| VirtualAdapter {
                number: v.number,
                parent: Arc::downgrade(&self.0),
                vhost: v.vhost.clone(),
            })
            .collect()
    }

    pub fn vport_info(&self) -> VportInfo {
        let inner = &self.0;
        let port_state = inner.driver.host_port_state();
        match inner.port_type {
            PortType::Physical => {
                let state = inner.state.lock().unwrap();
                VportInfo {
                    link_type: LinkType::Physical,
                    node_name: inner.node_name,
                    port_name: inner.port_name,
                    state: port_state.into(),
                    vports_max: Some(inner.config.max_vports),
                    vports_inuse: Some(state.vports_inuse),
                }
            }
            PortType::Npiv => {
                let disabled = self.parent().is_some_and(|parent| {
                    let state = parent.0.state.lock().unwrap();
                    state.vports.iter().any(|v| {
                        v.vhost.id() == inner.id
                            && v.flags.contains(VportFlags::DISABLED)
                    })
                });
                VportInfo {
                    link_type: LinkType::Virtual,
                    node_name: inner.node_name,
                    port_name: inner.port_name,
                    state: if disabled {
                        VportState::Disabled
                    } else {
                        port_state.into()
                    },
                    vports_max: None,
                    vports_inuse: None,
                }
            }
        }
    }
}

impl VirtualAdapter {
    pub fn number(&self) -> VportNumber {
        self.number
    }

    /// The child adapter, to which discovery on the virtual port is reported.
    pub fn adapter(&self) -> &Adapter {
        &self.vhost
    }

    /// Terminate the vport, releasing its quota slot once the driver has
    /// let go of it.
    pub async fn terminate(&self) -> Result<(), VportError> {
        let Some(parent) = self.parent.upgrade() else {
            return Err(VportError::AlreadyDone);
        };
        terminate(&parent, self.number, false).await
    }

    /// Enable or disable the vport in the driver.
    pub async fn suspend(&self, disable: bool) -> Result<(), VportError> {
        let Some(inner) = self.parent.upgrade() else {
            return Err(VportError::AlreadyDone);
        };
        if !inner.driver.capabilities().contains(DriverCaps::VPORT_DISABLE) {
            return Err(VportError::NotSupported);
        }
        let req = {
            let state = inner.state.lock().unwrap();
            let entry = state
                .vports
                .iter()
                .find(|v| v.number == self.number)
                .ok_or(VportError::AlreadyDone)?;
            if entry.flags.contains(VportFlags::CREATING) {
                return Err(VportError::Busy);
            }
            if entry.flags.contains(VportFlags::DELETING) {
                return Err(VportError::AlreadyInProgress);
            }
            entry.req.clone()
        };

        inner
            .driver
            .vport_disable(&req, disable)
            .await
            .map_err(VportError::DriverRejected)?;

        let mut state = inner.state.lock().unwrap();
        if let Some(entry) =
            state.vports.iter_mut().find(|v| v.number == self.number)
        {
            entry.flags.set(VportFlags::DISABLED, disable);
        }
        let what = if disable { "disabled" } else { "enabled" };
        info!(inner.log, "vport {}", what; "vport" => self.number.0);
        Ok(())
    }
}

async fn terminate(
    inner: &Arc<HostInner>,
    number: VportNumber,
    forced: bool,
) -> Result<(), VportError> {
    let (req, vhost) = {
        let mut state = inner.state.lock().unwrap();
        let Some(entry) = state.vports.iter_mut().find(|v| v.number == number)
        else {
            return Err(VportError::AlreadyDone);
        };
        if entry.flags.contains(VportFlags::CREATING) {
            return Err(VportError::Busy);
        }
        if entry.flags.contains(VportFlags::DELETING) {
            return Err(VportError::AlreadyInProgress);
        }
        entry.flags.insert(VportFlags::DELETING);
        (entry.req.clone(), entry.vhost.clone())
    };

    let can_delete =
        inner.driver.capabilities().contains(DriverCaps::VPORT_DELETE);
    let result = if can_delete {
        inner.driver.vport_delete(&req).await
    } else {
        Err(DriverError::NotSupported)
    };
    if let Err(e) = result {
        if !forced {
            let mut state = inner.state.lock().unwrap();
            if let Some(entry) =
                state.vports.iter_mut().find(|v| v.number == number)
            {
                entry.flags.remove(VportFlags::DELETING);
            }
            return Err(match e {
                DriverError::NotSupported => VportError::NotSupported,
                e => VportError::DriverRejected(e),
            });
        }
        // Adapter teardown proceeds regardless of what the driver says.
        warn!(inner.log, "driver failed to delete vport, removing anyway";
            "vport" => number.0, "error" => %e);
    }

    {
        let mut state = inner.state.lock().unwrap();
        state.vports.retain(|v| v.number != number);
        state.vports_inuse = state.vports_inuse.saturating_sub(1);
    }
    vhost.host_removed().await;

    info!(inner.log, "vport terminated"; "vport" => number.0);
    inner.publish(EventKind::RemovedVport { number, vhost: vhost.id() });
    Ok(())
}

/// Vport deletion queued on the physical adapter's work queue while the
/// physical adapter is removed.
///
/// Terminating a vport removes its child adapter, so the future is boxed to
/// keep its type from referring back to `Adapter::host_removed`.
pub(crate) fn forced_terminate(
    host: Weak<HostInner>,
    number: VportNumber,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = host.upgrade() else {
            return;
        };
        if let Err(e) = terminate(&inner, number, true).await {
            warn!(inner.log, "vport teardown skipped";
                "vport" => number.0, "error" => %e);
        }
    })
}
