// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The binding registry: the adapter's `active` and `bound` remote ports.
//!
//! A remote port lives in `active` while it is visible or inside its devloss
//! grace period. Once the grace period runs out, the port is stripped down to
//! the identity fields its adapter's [`BindType`] needs and moved to `bound`,
//! where it keeps its numeric target id reserved for the endpoint's return.

use serde::Serialize;

use super::{RemotePort, RemotePortInfo, RportState};
use crate::config::BindType;
use crate::ids::{AdapterId, RemotePortIdentity, RportNumber, TargetId};

pub(crate) struct Bindings {
    bind_type: BindType,
    active: Vec<RemotePort>,
    bound: Vec<RemotePort>,
}

/// Serializable snapshot of an adapter's binding registry.
#[derive(Clone, Debug, Serialize)]
pub struct BindingsInfo {
    pub bind_type: BindType,
    pub active: Vec<RemotePortInfo>,
    pub bound: Vec<RemotePortInfo>,
}

impl Bindings {
    pub(crate) fn new(bind_type: BindType) -> Self {
        Self { bind_type, active: Vec::new(), bound: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len() + self.bound.len()
    }

    pub(crate) fn active(&self) -> impl Iterator<Item = &RemotePort> {
        self.active.iter()
    }

    pub(crate) fn insert(&mut self, port: RemotePort) {
        self.active.push(port);
    }

    /// Blocked port in `active` which `ids` names on `channel`.
    pub(crate) fn find_blocked(
        &self,
        channel: u32,
        ids: &RemotePortIdentity,
    ) -> Option<RportNumber> {
        self.active
            .iter()
            .find(|p| {
                p.state == RportState::Blocked
                    && p.channel == channel
                    && self.bind_type.matches(&p.ids, ids)
            })
            .map(|p| p.number)
    }

    /// Port in `active` that is already live (or being created) for `ids`,
    /// i.e. a duplicate appearance.
    ///
    /// Live ports are only ever the same port when their port names agree.
    /// The bind type decides how a lost endpoint is recognized on its return,
    /// and two ports sharing a node name are both live at once.
    pub(crate) fn find_live(
        &self,
        channel: u32,
        ids: &RemotePortIdentity,
    ) -> Option<RportNumber> {
        self.active
            .iter()
            .find(|p| {
                matches!(p.state, RportState::Online | RportState::Creating)
                    && p.channel == channel
                    && p.ids.port_name == ids.port_name
            })
            .map(|p| p.number)
    }

    /// Bound record reserving an identity for `ids`. Never matches when the
    /// adapter keeps no persistent bindings.
    pub(crate) fn find_bound(
        &self,
        channel: u32,
        ids: &RemotePortIdentity,
    ) -> Option<RportNumber> {
        if self.bind_type == BindType::None {
            return None;
        }
        self.bound
            .iter()
            .find(|p| {
                p.channel == channel && self.bind_type.matches(&p.ids, ids)
            })
            .map(|p| p.number)
    }

    pub(crate) fn get(&self, number: RportNumber) -> Option<&RemotePort> {
        self.active
            .iter()
            .chain(self.bound.iter())
            .find(|p| p.number == number)
    }

    pub(crate) fn get_mut(
        &mut self,
        number: RportNumber,
    ) -> Option<&mut RemotePort> {
        self.active
            .iter_mut()
            .chain(self.bound.iter_mut())
            .find(|p| p.number == number)
    }

    pub(crate) fn active_mut(
        &mut self,
        number: RportNumber,
    ) -> Option<&mut RemotePort> {
        self.active.iter_mut().find(|p| p.number == number)
    }

    pub(crate) fn remove_active(
        &mut self,
        number: RportNumber,
    ) -> Option<RemotePort> {
        let idx = self.active.iter().position(|p| p.number == number)?;
        Some(self.active.remove(idx))
    }

    /// Remove a port from whichever list holds it.
    pub(crate) fn remove(&mut self, number: RportNumber) -> Option<RemotePort> {
        if let Some(port) = self.remove_active(number) {
            return Some(port);
        }
        let idx = self.bound.iter().position(|p| p.number == number)?;
        Some(self.bound.remove(idx))
    }

    /// Move a port from `active` to the tail of `bound`.
    pub(crate) fn demote(
        &mut self,
        number: RportNumber,
    ) -> Option<&mut RemotePort> {
        let port = self.remove_active(number)?;
        self.bound.push(port);
        self.bound.last_mut()
    }

    /// Move a port from `bound` to the tail of `active`.
    pub(crate) fn promote(
        &mut self,
        number: RportNumber,
    ) -> Option<&mut RemotePort> {
        let idx = self.bound.iter().position(|p| p.number == number)?;
        let port = self.bound.remove(idx);
        self.active.push(port);
        self.active.last_mut()
    }

    /// Empty both lists, active ports first.
    pub(crate) fn drain_all(&mut self) -> Vec<RemotePort> {
        let mut ports: Vec<RemotePort> = self.active.drain(..).collect();
        ports.append(&mut self.bound);
        ports
    }

    /// Is `target` on `channel` held by any port, live or bound?
    pub(crate) fn target_in_use(&self, channel: u32, target: TargetId) -> bool {
        self.active
            .iter()
            .chain(self.bound.iter())
            .any(|p| p.channel == channel && p.target_id == Some(target))
    }

    pub(crate) fn snapshot(&self, host: AdapterId) -> BindingsInfo {
        BindingsInfo {
            bind_type: self.bind_type,
            active: self.active.iter().map(|p| p.info(host)).collect(),
            bound: self.bound.iter().map(|p| p.info(host)).collect(),
        }
    }
}
