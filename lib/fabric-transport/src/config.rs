// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{PortId, RemotePortIdentity, RportRoles, Wwn};

/// Devloss timeout applied to new remote ports, in seconds.
pub const DEFAULT_DEV_LOSS_TMO: u32 = 10;

/// Upper bound on any devloss or link timeout, in seconds.
pub const DEFAULT_MAX_DEV_LOSS_TMO: u32 = 600;

/// How a rediscovered remote port is matched to an existing identity.
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
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BindType {
    #[default]
    ByWwpn,
    ByWwnn,
    ById,
    /// No persistent binding: ports lost past their devloss timeout release
    /// their target id for good. Blocked ports are still matched by port
    /// name.
    None,
}

impl BindType {
    /// Does `candidate` name the same endpoint as `ids` under this policy?
    pub(crate) fn matches(
        self,
        candidate: &RemotePortIdentity,
        ids: &RemotePortIdentity,
    ) -> bool {
        match self {
            BindType::ByWwpn | BindType::None => {
                candidate.port_name == ids.port_name
            }
            BindType::ByWwnn => candidate.node_name == ids.node_name,
            BindType::ById => candidate.port_id == ids.port_id,
        }
    }

    /// Strip an identity down to what this policy needs in order to
    /// recognize the endpoint when it returns.
    pub(crate) fn reset_for_binding(
        self,
        ids: &RemotePortIdentity,
    ) -> RemotePortIdentity {
        let mut kept = RemotePortIdentity {
            node_name: Wwn::UNKNOWN,
            port_name: Wwn::UNKNOWN,
            port_id: PortId::UNKNOWN,
            roles: RportRoles::empty(),
        };
        match self {
            BindType::ByWwpn => kept.port_name = ids.port_name,
            BindType::ByWwnn => kept.node_name = ids.node_name,
            BindType::ById => kept.port_id = ids.port_id,
            BindType::None => {
                kept.node_name = ids.node_name;
                kept.port_name = ids.port_name;
                kept.port_id = ids.port_id;
            }
        }
        kept
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dev_loss_tmo of {value}s is outside 1..={max}")]
    DevLossTmo { value: u32, max: u32 },

    #[error(
        "fast_io_fail_tmo of {value}s is not below dev_loss_tmo {dev_loss_tmo}s"
    )]
    FastIoFailTmo { value: i32, dev_loss_tmo: u32 },

    #[error("link_timeout of {value}s exceeds {max}s")]
    LinkTimeout { value: u32, max: u32 },
}

/// Transport settings for one adapter, fixed at adapter setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    pub bind_type: BindType,

    /// Grace period (seconds) a lost target port is held blocked before its
    /// logical target is torn down.
    pub dev_loss_tmo: u32,

    /// Seconds after loss at which in-flight I/O is aborted early. Zero or
    /// negative disables.
    pub fast_io_fail_tmo: Option<i32>,

    pub max_dev_loss_tmo: u32,

    /// Adapter-wide override for the devloss timeout. A nonzero value is used
    /// in place of the per-port setting when a port is lost.
    pub link_timeout: Option<u32>,

    /// Number of virtual adapters this adapter may host.
    pub max_vports: u32,

    /// Remove logical targets on devloss expiry. When false they are marked
    /// offline instead, and only removed when the adapter goes away.
    pub remove_on_dev_loss: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bind_type: BindType::default(),
            dev_loss_tmo: DEFAULT_DEV_LOSS_TMO,
            fast_io_fail_tmo: None,
            max_dev_loss_tmo: DEFAULT_MAX_DEV_LOSS_TMO,
            link_timeout: None,
            max_vports: 0,
            remove_on_dev_loss: true,
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_dev_loss_tmo(self.dev_loss_tmo)?;
        if let Some(value) = self.fast_io_fail_tmo {
            if value > 0 && value as u32 >= self.dev_loss_tmo {
                return Err(ConfigError::FastIoFailTmo {
                    value,
                    dev_loss_tmo: self.dev_loss_tmo,
                });
            }
        }
        if let Some(value) = self.link_timeout {
            if value > self.max_dev_loss_tmo {
                return Err(ConfigError::LinkTimeout {
                    value,
                    max: self.max_dev_loss_tmo,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_dev_loss_tmo(
        &self,
        value: u32,
    ) -> Result<(), ConfigError> {
        if value == 0 || value > self.max_dev_loss_tmo {
            return Err(ConfigError::DevLossTmo {
                value,
                max: self.max_dev_loss_tmo,
            });
        }
        Ok(())
    }

    /// Devloss delay to arm for a port whose own timeout is `dev_loss_tmo`.
    pub(crate) fn effective_dev_loss_tmo(&self, dev_loss_tmo: u32) -> u32 {
        self.link_timeout.filter(|t| *t != 0).unwrap_or(dev_loss_tmo)
    }
}

/// Normalize a fast-fail setting: anything not strictly positive disables it.
pub(crate) fn fast_io_fail_secs(value: Option<i32>) -> Option<u32> {
    value.filter(|v| *v > 0).map(|v| v as u32)
}
