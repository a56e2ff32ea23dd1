// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver and storage stack stand-ins which only log what they are asked to
//! do.

use async_trait::async_trait;
use fabric_transport::{
    DriverCaps, DriverError, FabricDriver, HostPortState, RemotePortInfo,
    StackError, StorageStack, TargetAddress, VportRequest,
};
use slog::{info, Logger};

pub struct LoggingDriver {
    log: Logger,
}

impl LoggingDriver {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(slog::o!("component" => "driver")) }
    }
}

#[async_trait]
impl FabricDriver for LoggingDriver {
    fn capabilities(&self) -> DriverCaps {
        DriverCaps::all()
    }

    async fn terminate_rport_io(&self, rport: &RemotePortInfo) {
        info!(self.log, "terminate rport I/O";
            "host" => rport.host.0, "rport" => rport.number.0);
    }

    async fn dev_loss_tmo_callback(&self, rport: &RemotePortInfo) {
        info!(self.log, "devloss callback";
            "host" => rport.host.0, "rport" => rport.number.0);
    }

    async fn vport_create(
        &self,
        req: &VportRequest,
    ) -> Result<(), DriverError> {
        info!(self.log, "vport create";
            "parent" => req.parent.0,
            "vport" => req.number.0,
            "port_name" => %req.port_name,
            "legacy" => req.legacy);
        Ok(())
    }

    async fn vport_delete(
        &self,
        req: &VportRequest,
    ) -> Result<(), DriverError> {
        info!(self.log, "vport delete";
            "parent" => req.parent.0, "vport" => req.number.0);
        Ok(())
    }

    async fn vport_disable(
        &self,
        req: &VportRequest,
        disable: bool,
    ) -> Result<(), DriverError> {
        info!(self.log, "vport disable";
            "vport" => req.number.0, "disable" => disable);
        Ok(())
    }

    fn host_port_state(&self) -> HostPortState {
        HostPortState::Online
    }
}

pub struct LoggingStack {
    log: Logger,
}

impl LoggingStack {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(slog::o!("component" => "stack")) }
    }
}

#[async_trait]
impl StorageStack for LoggingStack {
    async fn rport_added(
        &self,
        rport: &RemotePortInfo,
    ) -> Result<(), StackError> {
        info!(self.log, "rport registered";
            "host" => rport.host.0,
            "rport" => rport.number.0,
            "port_name" => %rport.port_name);
        Ok(())
    }

    async fn rport_removed(&self, rport: &RemotePortInfo) {
        info!(self.log, "rport unregistered";
            "host" => rport.host.0, "rport" => rport.number.0);
    }

    fn block_target(&self, target: TargetAddress) {
        info!(self.log, "block"; "target" => %target);
    }

    fn unblock_target(&self, target: TargetAddress) {
        info!(self.log, "unblock"; "target" => %target);
    }

    async fn scan_target(&self, target: TargetAddress) {
        info!(self.log, "scan"; "target" => %target);
    }

    async fn remove_target(&self, target: TargetAddress) {
        info!(self.log, "remove"; "target" => %target);
    }

    async fn offline_target(&self, target: TargetAddress) {
        info!(self.log, "offline"; "target" => %target);
    }
}
