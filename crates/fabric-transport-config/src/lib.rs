// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use fabric_transport::{AdapterConfig, RportRoles, Wwn};

/// Configuration for a standalone adapter run: the adapter's transport
/// settings, its own names, and the fabric events to replay against it.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,

    pub host: Host,

    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

/// Names of the local (physical) port.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Host {
    pub node_name: Wwn,
    pub port_name: Wwn,
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Target,
    Initiator,
    Ip,
}

impl From<Role> for RportRoles {
    fn from(value: Role) -> Self {
        match value {
            Role::Target => RportRoles::FCP_TARGET,
            Role::Initiator => RportRoles::FCP_INITIATOR,
            Role::Ip => RportRoles::IP_PORT,
        }
    }
}

/// Fold a role list into the flag set the transport uses.
pub fn roles(list: &[Role]) -> RportRoles {
    list.iter().fold(RportRoles::empty(), |acc, r| acc | RportRoles::from(*r))
}

/// One fabric event (or pause) in a replay script.
///
/// Remote port steps apply to the physical adapter unless `vport` names a
/// virtual adapter created earlier in the script.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    Appear {
        #[serde(default)]
        vport: Option<String>,
        #[serde(default)]
        channel: u32,
        wwnn: Wwn,
        wwpn: Wwn,
        port_id: u32,
        roles: Vec<Role>,
    },
    Disappear {
        #[serde(default)]
        vport: Option<String>,
        wwpn: Wwn,
    },
    RoleChange {
        #[serde(default)]
        vport: Option<String>,
        wwpn: Wwn,
        roles: Vec<Role>,
    },
    Remove {
        #[serde(default)]
        vport: Option<String>,
        wwpn: Wwn,
    },
    Wait {
        secs: u64,
    },
    VportCreate {
        name: String,
        wwnn: Wwn,
        wwpn: Wwn,
        #[serde(default)]
        legacy: bool,
    },
    VportTerminate {
        name: String,
    },
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid adapter configuration: {0}")]
    Adapter(#[from] fabric_transport::ConfigError),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    cfg.adapter.validate()?;
    Ok(cfg)
}
