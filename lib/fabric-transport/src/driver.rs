// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators on either side of the transport: the
//! low-level fabric driver below, and the generic storage stack above.

use std::fmt;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AdapterId, TargetId, VportNumber, Wwn};
use crate::rport::RemotePortInfo;

bitflags! {
    /// Optional driver entry points. The transport consults these instead of
    /// probing for default method implementations.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DriverCaps: u32 {
        /// Driver can abort all I/O outstanding to a remote port.
        const TERMINATE_RPORT_IO = 1 << 0;
        /// Driver wants to be told when a remote port's devloss window
        /// closes, and aborts its I/O as part of handling that.
        const DEV_LOSS_CALLBACK = 1 << 1;
        const VPORT_CREATE = 1 << 2;
        const VPORT_DELETE = 1 << 3;
        const VPORT_DISABLE = 1 << 4;
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("operation not supported by driver")]
    NotSupported,

    #[error("driver out of memory")]
    NoMemory,

    #[error("driver failure: {0}")]
    Failed(String),
}

/// Link state of the local port, as reported by the driver.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum HostPortState {
    #[default]
    Unknown,
    Online,
    Offline,
    LinkDown,
    Error,
}

/// What the driver is asked to instantiate (or tear down) for a virtual
/// adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VportRequest {
    pub parent: AdapterId,
    pub vhost: AdapterId,
    pub number: VportNumber,
    pub node_name: Wwn,
    pub port_name: Wwn,
    pub legacy: bool,
}

/// The low-level driver for an adapter.
///
/// Only [`capabilities`](Self::capabilities) is required; the transport never
/// calls an entry point whose capability bit is clear.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FabricDriver: Send + Sync + 'static {
    fn capabilities(&self) -> DriverCaps;

    async fn terminate_rport_io(&self, _rport: &RemotePortInfo) {}

    async fn dev_loss_tmo_callback(&self, _rport: &RemotePortInfo) {}

    async fn vport_create(
        &self,
        _req: &VportRequest,
    ) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn vport_delete(
        &self,
        _req: &VportRequest,
    ) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn vport_disable(
        &self,
        _req: &VportRequest,
        _disable: bool,
    ) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }

    fn host_port_state(&self) -> HostPortState {
        HostPortState::Unknown
    }
}

/// Address of a logical target as seen by the storage stack. Fabric names
/// never cross this boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetAddress {
    pub adapter: AdapterId,
    pub channel: u32,
    pub target: TargetId,
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.adapter, self.channel, self.target)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("storage stack out of memory")]
    NoMemory,

    #[error("registration failed: {0}")]
    Failed(String),
}

/// The generic storage stack which owns logical targets and units.
///
/// `block_target` and `unblock_target` must not sleep. Removal and offlining
/// must tolerate targets which are already gone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageStack: Send + Sync + 'static {
    /// Register a remote port object with the device model.
    async fn rport_added(
        &self,
        _rport: &RemotePortInfo,
    ) -> Result<(), StackError> {
        Ok(())
    }

    /// Unregister a remote port object. Its logical target, if any, has
    /// already been dealt with.
    async fn rport_removed(&self, _rport: &RemotePortInfo) {}

    fn block_target(&self, target: TargetAddress);

    fn unblock_target(&self, target: TargetAddress);

    /// Probe the target for logical units.
    async fn scan_target(&self, target: TargetAddress);

    /// Remove the target and every logical unit under it.
    async fn remove_target(&self, target: TargetAddress);

    /// Fail all I/O to the target without removing it.
    async fn offline_target(&self, _target: TargetAddress) {}
}
