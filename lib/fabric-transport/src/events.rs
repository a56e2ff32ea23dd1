// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::driver::TargetAddress;
use crate::ids::{AdapterId, VportNumber, Wwn};

static EVENT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Next process-wide event number. Numbers start at 1.
pub fn next_event_number() -> u32 {
    EVENT_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Notification published by an adapter when its set of targets or virtual
/// adapters changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterEvent {
    pub number: u32,
    pub host: AdapterId,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NewTarget { address: TargetAddress, port_name: Wwn },
    RemovedTarget { address: TargetAddress, port_name: Wwn },
    NewVport { number: VportNumber, vhost: AdapterId },
    RemovedVport { number: VportNumber, vhost: AdapterId },
}
