// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, Context, Result};
use bgp_session::config::{GlobalConfig, ListenerConfig, PeerConfig};
use bgp_session::engine::SessionEngine;
use bgp_session::ipc::{channel, Endpoint, FromParent, ToParent};
use bgp_session::log::{init_file_logger, init_logger};
use bgp_session::mrt::MrtConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use slog::{error, info, warn, Logger};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod rde;

#[derive(Parser, Debug)]
#[command(version, about = "BGP session engine", long_about = None)]
struct Cli {
    /// Configuration file, JSON.
    #[arg(short, long, env = "BGPSD_CONFIG")]
    config: PathBuf,

    /// Write bunyan logs to this file instead of stdout.
    #[arg(short, long)]
    log_file: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    global: GlobalConfig,
    listeners: Vec<ListenerConfig>,
    peers: Vec<PeerConfig>,
    mrt: Vec<MrtFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MrtFile {
    #[serde(flatten)]
    conf: MrtConfig,
    path: PathBuf,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let log = match &args.log_file {
        Some(f) => init_file_logger(f)
            .with_context(|| format!("open log file {f}"))?,
        None => init_logger(),
    };

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read {}", args.config.display()))?;
    let conf: DaemonConfig =
        serde_json::from_str(&raw).context("parse configuration")?;

    let result = run(conf, &log);
    if let Err(e) = &result {
        error!(log, "bgpsd exiting: {e:#}");
    }
    result
}

fn run(conf: DaemonConfig, log: &Logger) -> Result<()> {
    let (ours, engine_side) = channel::<FromParent, ToParent>()?;
    let (rde_session, rde_side) = channel()?;

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        ctrlc::set_handler(move || quit.store(true, Ordering::SeqCst))
            .context("install signal handler")?;
    }

    let engine_log = log.clone();
    let global = conf.global.clone();
    let engine = std::thread::Builder::new()
        .name("session-engine".into())
        .spawn(move || {
            let mut engine =
                SessionEngine::new(global, engine_side, engine_log);
            engine.run()
        })?;

    let rde_log = log.clone();
    std::thread::Builder::new()
        .name("rde".into())
        .spawn(move || rde::run(rde_side, rde_log))?;

    ours.send(FromParent::RdeChannel(rde_session))?;
    configure(&ours, conf)?;

    loop {
        if quit.load(Ordering::SeqCst) {
            info!(log, "shutdown requested");
            // the engine may already be gone
            let _ = ours.send(FromParent::Shutdown);
            break;
        }
        match ours.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(msg)) => handle_engine(&ours, msg, log),
            Ok(None) => {}
            Err(_) => {
                warn!(log, "session engine channel closed");
                break;
            }
        }
    }

    engine
        .join()
        .map_err(|_| anyhow!("session engine panicked"))?
        .context("session engine")
}

/// Hand the engine a full configuration as one reconfiguration round.
fn configure(
    ep: &Endpoint<FromParent, ToParent>,
    conf: DaemonConfig,
) -> Result<()> {
    ep.send(FromParent::ReconfConf(Box::new(conf.global)))?;
    for p in conf.peers {
        ep.send(FromParent::ReconfPeer(Box::new(p)))?;
    }
    for l in conf.listeners {
        ep.send(FromParent::ReconfListener(l))?;
    }
    ep.send(FromParent::ReconfDone)?;

    for m in conf.mrt {
        let file = open_dump(&m.path)?;
        ep.send(FromParent::MrtOpen { conf: m.conf, file })?;
    }
    Ok(())
}

fn open_dump(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open MRT dump {}", path.display()))
}

fn handle_engine(
    ep: &Endpoint<FromParent, ToParent>,
    msg: ToParent,
    log: &Logger,
) {
    match msg {
        ToParent::Demote { group, level } => {
            info!(log, "demote {group} by {level}");
        }
        ToParent::PfkeyReload { peer_id } => {
            info!(log, "no TCP keys to reload for peer {peer_id}");
        }
        ToParent::SessionDependOn { ifname } => {
            // interface state is not tracked here, report every link as up
            let reply = FromParent::SessionDependOn { ifname, up: true };
            if let Err(e) = ep.send(reply) {
                warn!(log, "depend-on reply: {e}");
            }
        }
        ToParent::ReconfDone => {
            info!(log, "configuration loaded");
        }
    }
}
