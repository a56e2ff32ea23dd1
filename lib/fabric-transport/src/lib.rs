// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote port presence and device-loss recovery for fabric-attached
//! storage adapters.
//!
//! An [`Adapter`] tracks the remote ports its driver discovers, hands each
//! target port a numeric target id which stays stable across transient loss,
//! holds lost targets blocked for a devloss grace period, and tears them down
//! through the [`StorageStack`] once that period runs out. Virtual adapters
//! ([`VirtualAdapter`]) can be layered on a physical adapter up to its quota.

#![allow(clippy::style)]

pub mod adapter;
pub mod config;
pub mod driver;
pub mod events;
pub mod ids;
pub mod rport;
mod teardown;
pub mod vport;
mod workq;

pub use adapter::{Adapter, AdapterInit, HostFlag, PortType};
pub use config::{AdapterConfig, BindType, ConfigError};
pub use driver::{
    DriverCaps, DriverError, FabricDriver, HostPortState, StackError,
    StorageStack, TargetAddress, VportRequest,
};
pub use events::{next_event_number, AdapterEvent, EventKind};
pub use ids::{
    AdapterId, ClassOfService, PortId, RemotePortIdentity, RportNumber,
    RportRoles, TargetId, VportNumber, Wwn,
};
pub use rport::binding::BindingsInfo;
pub use rport::{
    PortError, RemotePortHandle, RemotePortInfo, RportAttrs, RportFlags,
    RportState,
};
pub use vport::{
    LinkType, VirtualAdapter, VportArgs, VportError, VportInfo, VportState,
};
