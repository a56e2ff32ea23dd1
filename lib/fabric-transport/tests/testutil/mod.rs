// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording stand-ins for the driver and storage stack.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabric_transport::{
    Adapter, AdapterConfig, AdapterInit, DriverCaps, DriverError,
    FabricDriver, HostPortState, PortId, RemotePortIdentity, RemotePortInfo,
    RportNumber, RportRoles, StackError, StorageStack, TargetAddress,
    VportNumber, VportRequest, Wwn,
};
use slog::Logger;
use tokio::sync::oneshot;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StackCall {
    Added(RportNumber),
    Removed(RportNumber),
    Block(TargetAddress),
    Unblock(TargetAddress),
    Scan(TargetAddress),
    Remove(TargetAddress),
    Offline(TargetAddress),
}

#[derive(Default)]
pub struct MockStack {
    calls: Mutex<Vec<StackCall>>,
    fail_add: AtomicBool,
    remove_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockStack {
    pub fn calls(&self) -> Vec<StackCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&StackCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn scans(&self) -> usize {
        self.count(|c| matches!(c, StackCall::Scan(_)))
    }

    pub fn removals(&self) -> usize {
        self.count(|c| matches!(c, StackCall::Remove(_)))
    }

    pub fn position(&self, call: &StackCall) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == call)
    }

    /// Make the next registration fail.
    pub fn fail_next_add(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }

    /// Hold the next target removal until the returned sender fires.
    pub fn hold_next_removal(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.remove_gate.lock().unwrap() = Some(rx);
        tx
    }

    fn record(&self, call: StackCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl StorageStack for MockStack {
    async fn rport_added(
        &self,
        rport: &RemotePortInfo,
    ) -> Result<(), StackError> {
        if self.fail_add.swap(false, Ordering::SeqCst) {
            return Err(StackError::NoMemory);
        }
        self.record(StackCall::Added(rport.number));
        Ok(())
    }

    async fn rport_removed(&self, rport: &RemotePortInfo) {
        self.record(StackCall::Removed(rport.number));
    }

    fn block_target(&self, target: TargetAddress) {
        self.record(StackCall::Block(target));
    }

    fn unblock_target(&self, target: TargetAddress) {
        self.record(StackCall::Unblock(target));
    }

    async fn scan_target(&self, target: TargetAddress) {
        self.record(StackCall::Scan(target));
    }

    async fn remove_target(&self, target: TargetAddress) {
        let gate = self.remove_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.record(StackCall::Remove(target));
    }

    async fn offline_target(&self, target: TargetAddress) {
        self.record(StackCall::Offline(target));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    TerminateIo(RportNumber),
    DevLoss(RportNumber),
    VportCreate(VportNumber),
    VportDelete(VportNumber),
    VportDisable(VportNumber, bool),
}

pub struct MockDriver {
    caps: DriverCaps,
    calls: Mutex<Vec<DriverCall>>,
    reject_create: AtomicBool,
    reject_delete: AtomicBool,
    port_state: Mutex<HostPortState>,
    terminate_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockDriver {
    pub fn new(caps: DriverCaps) -> Self {
        Self {
            caps,
            calls: Mutex::new(Vec::new()),
            reject_create: AtomicBool::new(false),
            reject_delete: AtomicBool::new(false),
            port_state: Mutex::new(HostPortState::Online),
            terminate_gate: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn reject_create(&self, reject: bool) {
        self.reject_create.store(reject, Ordering::SeqCst);
    }

    pub fn reject_delete(&self, reject: bool) {
        self.reject_delete.store(reject, Ordering::SeqCst);
    }

    /// Hold the next I/O termination (after recording it) until the returned
    /// sender fires.
    pub fn hold_next_terminate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.terminate_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_port_state(&self, state: HostPortState) {
        *self.port_state.lock().unwrap() = state;
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl FabricDriver for MockDriver {
    fn capabilities(&self) -> DriverCaps {
        self.caps
    }

    async fn terminate_rport_io(&self, rport: &RemotePortInfo) {
        self.record(DriverCall::TerminateIo(rport.number));
        let gate = self.terminate_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }

    async fn dev_loss_tmo_callback(&self, rport: &RemotePortInfo) {
        self.record(DriverCall::DevLoss(rport.number));
    }

    async fn vport_create(
        &self,
        req: &VportRequest,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::VportCreate(req.number));
        if self.reject_create.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("no fabric login".to_string()));
        }
        Ok(())
    }

    async fn vport_delete(
        &self,
        req: &VportRequest,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::VportDelete(req.number));
        if self.reject_delete.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("logout failed".to_string()));
        }
        Ok(())
    }

    async fn vport_disable(
        &self,
        req: &VportRequest,
        disable: bool,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::VportDisable(req.number, disable));
        Ok(())
    }

    fn host_port_state(&self) -> HostPortState {
        *self.port_state.lock().unwrap()
    }
}

pub struct Harness {
    pub adapter: Adapter,
    pub driver: Arc<MockDriver>,
    pub stack: Arc<MockStack>,
}

pub fn harness(config: AdapterConfig, caps: DriverCaps) -> Harness {
    let driver = Arc::new(MockDriver::new(caps));
    let stack = Arc::new(MockStack::default());
    let adapter = Adapter::new(
        &test_logger(),
        AdapterInit {
            config,
            node_name: Wwn(0x2000_0000_c9aa_0001),
            port_name: Wwn(0x1000_0000_c9aa_0001),
            driver: driver.clone(),
            stack: stack.clone(),
        },
    )
    .unwrap();
    Harness { adapter, driver, stack }
}

pub fn config(dev_loss_tmo: u32) -> AdapterConfig {
    AdapterConfig { dev_loss_tmo, ..Default::default() }
}

pub fn identity(wwpn: u64, roles: RportRoles) -> RemotePortIdentity {
    RemotePortIdentity::new(
        Wwn(wwpn | 0x2000_0000_0000_0000),
        Wwn(wwpn),
        PortId((wwpn & 0xff_ffff) as u32),
        roles,
    )
}

pub fn target(wwpn: u64) -> RemotePortIdentity {
    identity(wwpn, RportRoles::FCP_TARGET)
}

pub fn initiator(wwpn: u64) -> RemotePortIdentity {
    identity(wwpn, RportRoles::FCP_INITIATOR)
}

/// Let paused time run forward, then drain whatever expiry it caused.
pub async fn advance(adapter: &Adapter, secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    adapter.flush_devloss().await;
    adapter.flush_work().await;
    adapter.flush_scans().await;
}
