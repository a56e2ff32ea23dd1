// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric-attached adapters (hosts).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use slog::{info, warn, Logger};
use tokio::sync::broadcast;

use crate::config::{AdapterConfig, ConfigError};
use crate::driver::{FabricDriver, StorageStack, TargetAddress};
use crate::events::{next_event_number, AdapterEvent, EventKind};
use crate::ids::{AdapterId, IdAllocator, Wwn};
use crate::rport::binding::{Bindings, BindingsInfo};
use crate::rport::{RemotePortHandle, RemotePortInfo, RportState};
use crate::teardown;
use crate::vport::{self, VportEntry};
use crate::workq::WorkQueue;

const EVENT_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Physical,
    /// Virtual adapter layered on a physical one.
    Npiv,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum HostFlag {
    Ready,
    Removing,
    Removed,
}

/// Everything needed to set up an adapter.
pub struct AdapterInit {
    pub config: AdapterConfig,
    pub node_name: Wwn,
    pub port_name: Wwn,
    pub driver: Arc<dyn FabricDriver>,
    pub stack: Arc<dyn StorageStack>,
}

/// State guarded by the adapter lock.
pub(crate) struct HostState {
    pub(crate) flag: HostFlag,
    pub(crate) ids: IdAllocator,
    pub(crate) bindings: Bindings,
    pub(crate) vports: Vec<VportEntry>,
    pub(crate) vports_inuse: u32,
}

pub(crate) struct HostInner {
    pub(crate) id: AdapterId,
    pub(crate) log: Logger,
    pub(crate) config: AdapterConfig,
    pub(crate) port_type: PortType,
    pub(crate) node_name: Wwn,
    pub(crate) port_name: Wwn,
    pub(crate) driver: Arc<dyn FabricDriver>,
    pub(crate) stack: Arc<dyn StorageStack>,
    pub(crate) state: Mutex<HostState>,

    /// Serializes inbound discovery notifications and host removal against
    /// each other. Held across awaits, so it is never taken from a work
    /// queue item.
    pub(crate) transitions: tokio::sync::Mutex<()>,

    /// Target and remote port teardown, and vport deletion.
    pub(crate) work_q: WorkQueue,
    /// Fast-fail and devloss timer expiry.
    pub(crate) devloss_q: WorkQueue,
    /// Target scans.
    pub(crate) scan_q: WorkQueue,
    pub(crate) pending_scans: AtomicU64,

    pub(crate) events: broadcast::Sender<AdapterEvent>,
    pub(crate) parent: Option<Weak<HostInner>>,
}

impl HostInner {
    pub(crate) fn flag(&self) -> HostFlag {
        self.state.lock().unwrap().flag
    }

    pub(crate) fn publish(&self, kind: EventKind) {
        let event =
            AdapterEvent { number: next_event_number(), host: self.id, kind };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Handle to an adapter. Clones refer to the same adapter.
///
/// Adapters must be created from within a Tokio runtime, as each one spawns
/// tasks to service its work queues.
#[derive(Clone)]
pub struct Adapter(pub(crate) Arc<HostInner>);

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.0.id)
            .field("port_type", &self.0.port_type)
            .field("port_name", &self.0.port_name)
            .finish()
    }
}

impl Adapter {
    /// Set up a physical adapter.
    pub fn new(log: &Logger, init: AdapterInit) -> Result<Self, ConfigError> {
        init.config.validate()?;
        Ok(Self::build(log, init, PortType::Physical, None))
    }

    pub(crate) fn build(
        log: &Logger,
        init: AdapterInit,
        port_type: PortType,
        parent: Option<Weak<HostInner>>,
    ) -> Self {
        let id = AdapterId::new();
        let log = log.new(slog::o!(
            "component" => "fc_host",
            "host" => id.0,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = HostState {
            flag: HostFlag::Ready,
            ids: IdAllocator::default(),
            bindings: Bindings::new(init.config.bind_type),
            vports: Vec::new(),
            vports_inuse: 0,
        };
        let inner = HostInner {
            id,
            work_q: WorkQueue::new(format!("fc_wq_{}", id.0), &log),
            devloss_q: WorkQueue::new(format!("fc_dl_{}", id.0), &log),
            scan_q: WorkQueue::new(format!("scsi_wq_{}", id.0), &log),
            pending_scans: AtomicU64::new(0),
            config: init.config,
            port_type,
            node_name: init.node_name,
            port_name: init.port_name,
            driver: init.driver,
            stack: init.stack,
            state: Mutex::new(state),
            transitions: tokio::sync::Mutex::new(()),
            events,
            parent,
            log,
        };
        info!(inner.log, "adapter ready";
            "port_type" => %port_type,
            "port_name" => %inner.port_name,
            "bind_type" => %inner.config.bind_type,
        );
        Self(Arc::new(inner))
    }

    pub fn id(&self) -> AdapterId {
        self.0.id
    }

    pub fn node_name(&self) -> Wwn {
        self.0.node_name
    }

    pub fn port_name(&self) -> Wwn {
        self.0.port_name
    }

    pub fn port_type(&self) -> PortType {
        self.0.port_type
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.0.config
    }

    pub fn flag(&self) -> HostFlag {
        self.0.flag()
    }

    /// The physical adapter this one is layered on, if it is virtual and the
    /// parent still exists.
    pub fn parent(&self) -> Option<Adapter> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(Adapter)
    }

    /// Number of target scans queued but not yet finished.
    pub fn pending_scans(&self) -> u64 {
        self.0.pending_scans.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.0.events.subscribe()
    }

    /// Wait for all queued teardown work to finish.
    pub async fn flush_work(&self) {
        self.0.work_q.flush().await
    }

    /// Wait for any timer expiry that has already been queued.
    pub async fn flush_devloss(&self) {
        self.0.devloss_q.flush().await
    }

    pub async fn flush_scans(&self) {
        self.0.scan_q.flush().await
    }

    pub fn rport(&self, handle: RemotePortHandle) -> Option<RemotePortInfo> {
        let state = self.0.state.lock().unwrap();
        state.bindings.get(handle.number()).map(|p| p.info(self.0.id))
    }

    /// Snapshot of the remote ports currently visible or in their grace
    /// period.
    pub fn rports(&self) -> Vec<RemotePortInfo> {
        let state = self.0.state.lock().unwrap();
        let ports =
            state.bindings.active().map(|p| p.info(self.0.id)).collect();
        ports
    }

    pub fn bindings(&self) -> BindingsInfo {
        let state = self.0.state.lock().unwrap();
        state.bindings.snapshot(self.0.id)
    }

    pub fn target_address(
        &self,
        handle: RemotePortHandle,
    ) -> Option<TargetAddress> {
        let state = self.0.state.lock().unwrap();
        state.bindings.get(handle.number()).and_then(|p| p.address(self.0.id))
    }

    /// Find the active remote port with the given port name.
    pub fn find_rport(&self, port_name: Wwn) -> Option<RemotePortHandle> {
        let state = self.0.state.lock().unwrap();
        let found = state
            .bindings
            .active()
            .find(|p| p.ids.port_name == port_name)
            .map(|p| p.handle());
        found
    }

    /// Tear down everything under the adapter.
    ///
    /// Every virtual adapter is terminated and every remote port (active or
    /// bound) is deleted; the call returns once all of that work, and any
    /// outstanding timer expiry or scan, has finished. Later calls are
    /// no-ops.
    pub async fn host_removed(&self) {
        let inner = &self.0;
        let _serial = inner.transitions.lock().await;
        {
            let mut state = inner.state.lock().unwrap();
            if state.flag != HostFlag::Ready {
                warn!(inner.log, "adapter already removed");
                return;
            }
            state.flag = HostFlag::Removing;
            info!(inner.log, "removing adapter";
                "rports" => state.bindings.len(),
                "vports" => state.vports.len(),
            );

            for entry in state.vports.iter() {
                inner.work_q.queue(vport::forced_terminate(
                    Arc::downgrade(inner),
                    entry.number,
                ));
            }
            for mut port in state.bindings.drain_all() {
                port.state = RportState::Deleted;
                inner
                    .work_q
                    .queue(teardown::final_delete(Arc::downgrade(inner), port));
            }
        }

        inner.devloss_q.flush().await;
        inner.work_q.flush().await;
        inner.scan_q.flush().await;

        inner.state.lock().unwrap().flag = HostFlag::Removed;
        info!(inner.log, "adapter removed");
    }
}
