// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use fabric_transport::{
    Adapter, AdapterInit, PortId, RemotePortHandle, RemotePortIdentity,
    VirtualAdapter, VportArgs, Wwn,
};
use fabric_transport_config::{roles, Config, ScriptStep};
use slog::{error, info, o, warn, Drain, Logger};
use tokio::sync::broadcast::error::RecvError;

mod backend;

use backend::{LoggingDriver, LoggingStack};

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

/// Replays a script against one physical adapter and the virtual adapters
/// the script creates on it.
struct Replay {
    adapter: Adapter,
    vports: BTreeMap<String, VirtualAdapter>,
    log: Logger,
}

impl Replay {
    fn target(&self, vport: Option<&str>) -> anyhow::Result<&Adapter> {
        match vport {
            None => Ok(&self.adapter),
            Some(name) => self
                .vports
                .get(name)
                .map(VirtualAdapter::adapter)
                .ok_or_else(|| anyhow!("no vport named {name:?}")),
        }
    }

    fn rport(
        &self,
        vport: Option<&str>,
        wwpn: Wwn,
    ) -> anyhow::Result<(&Adapter, RemotePortHandle)> {
        let adapter = self.target(vport)?;
        let handle = adapter
            .find_rport(wwpn)
            .ok_or_else(|| anyhow!("no remote port {wwpn}"))?;
        Ok((adapter, handle))
    }

    async fn step(&mut self, step: ScriptStep) -> anyhow::Result<()> {
        match step {
            ScriptStep::Appear {
                vport,
                channel,
                wwnn,
                wwpn,
                port_id,
                roles: r,
            } => {
                let adapter = self.target(vport.as_deref())?;
                let ids = RemotePortIdentity::new(
                    wwnn,
                    wwpn,
                    PortId(port_id),
                    roles(&r),
                );
                let handle = adapter
                    .port_appeared(channel, ids)
                    .await
                    .with_context(|| format!("adding remote port {wwpn}"))?;
                let address = adapter
                    .target_address(handle)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!(self.log, "remote port present";
                    "rport" => handle.number().0,
                    "address" => address);
            }
            ScriptStep::Disappear { vport, wwpn } => {
                let (adapter, handle) = self.rport(vport.as_deref(), wwpn)?;
                adapter.port_disappeared(handle).await;
            }
            ScriptStep::RoleChange { vport, wwpn, roles: r } => {
                let (adapter, handle) = self.rport(vport.as_deref(), wwpn)?;
                adapter.port_role_changed(handle, roles(&r)).await;
            }
            ScriptStep::Remove { vport, wwpn } => {
                let (adapter, handle) = self.rport(vport.as_deref(), wwpn)?;
                adapter.remote_port_remove(handle).await;
            }
            ScriptStep::Wait { secs } => {
                info!(self.log, "waiting"; "secs" => secs);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            ScriptStep::VportCreate { name, wwnn, wwpn, legacy } => {
                if self.vports.contains_key(&name) {
                    return Err(anyhow!("vport {name:?} already exists"));
                }
                let vport = self
                    .adapter
                    .vport_create(VportArgs {
                        node_name: wwnn,
                        port_name: wwpn,
                        legacy,
                    })
                    .await
                    .with_context(|| format!("creating vport {name:?}"))?;
                info!(self.log, "vport created";
                    "name" => &name,
                    "vhost" => vport.adapter().id().0);
                self.vports.insert(name, vport);
            }
            ScriptStep::VportTerminate { name } => {
                let vport = self
                    .vports
                    .get(&name)
                    .ok_or_else(|| anyhow!("no vport named {name:?}"))?;
                vport
                    .terminate()
                    .await
                    .with_context(|| format!("terminating vport {name:?}"))?;
                self.vports.remove(&name);
            }
        }
        Ok(())
    }
}

fn dump(adapter: &Adapter, label: &str) -> anyhow::Result<()> {
    let bindings = serde_json::to_string_pretty(&adapter.bindings())
        .context("serializing bindings")?;
    println!("# {label}\n{bindings}");
    Ok(())
}

async fn run(config: Config, settle: u64, log: &Logger) -> anyhow::Result<()> {
    let adapter = Adapter::new(
        log,
        AdapterInit {
            config: config.adapter,
            node_name: config.host.node_name,
            port_name: config.host.port_name,
            driver: Arc::new(LoggingDriver::new(log)),
            stack: Arc::new(LoggingStack::new(log)),
        },
    )
    .context("adapter setup")?;

    let mut events = adapter.subscribe_events();
    let event_log = log.new(o!("component" => "events"));
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => info!(event_log, "adapter event";
                    "number" => ev.number,
                    "host" => ev.host.0,
                    "kind" => ?ev.kind),
                Err(RecvError::Lagged(n)) => {
                    warn!(event_log, "dropped adapter events"; "count" => n)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut replay = Replay {
        adapter: adapter.clone(),
        vports: BTreeMap::new(),
        log: log.clone(),
    };
    for (i, step) in config.script.into_iter().enumerate() {
        if let Err(e) = replay.step(step).await {
            error!(log, "script step failed"; "step" => i, "error" => ?e);
        }
    }

    if settle > 0 {
        tokio::time::sleep(Duration::from_secs(settle)).await;
    }
    adapter.flush_devloss().await;
    adapter.flush_work().await;
    adapter.flush_scans().await;
    dump(&adapter, "after script")?;

    adapter.host_removed().await;
    dump(&adapter, "after host removal")?;
    Ok(())
}

#[derive(clap::Parser)]
/// Replay scripted fabric events against a single adapter.
struct Args {
    /// Adapter configuration and event script (TOML).
    #[clap(value_name = "CONFIG", action)]
    config: PathBuf,

    /// Seconds to let timers run after the last script step.
    #[clap(short, long, default_value_t = 0, action)]
    settle: u64,
}

fn main() -> anyhow::Result<()> {
    let Args { config, settle } = Args::parse();

    let (log, _log_async_guard) = build_log();

    let config = fabric_transport_config::parse(&config)
        .with_context(|| format!("parsing {}", config.display()))?;

    // Create tokio runtime, we don't use the tokio::main macro
    // since the logger guard must outlive it.
    let rt =
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(config, settle, &log))
}
