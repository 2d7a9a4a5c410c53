//! Entry point for the sortwatch acquisition daemon. Parses args, loads
//! the machines file, runs the coordinator until ctrl-c.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sortwatch_core::{Coordinator, CoreConfig, MachineConfig, WsConnector};

/// Ordered machine list consumed at startup, one supervisor each.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MachinesFile {
    #[serde(default)]
    machines: Vec<MachineConfig>,
    #[serde(default)]
    version: u32,
}

#[derive(Debug)]
struct ParsedArgs {
    machines_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    flush_secs: Option<u64>,
    check: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "sortwatchd".into());
    let usage = |prog: &str| {
        format!("Usage: {prog} [--data-dir DIR|-d DIR] [--flush-secs N] [--check] MACHINES_JSON")
    };

    let mut machines_path: Option<PathBuf> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut flush_secs: Option<u64> = None;
    let mut check = false;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "--data-dir" | "-d" => {
                data_dir = it.next().map(PathBuf::from);
            }
            "--flush-secs" => {
                let v = it.next().ok_or_else(|| usage(&prog))?;
                flush_secs = Some(v.parse().map_err(|_| format!("bad --flush-secs: {v}"))?);
            }
            "--check" => {
                check = true;
            }
            _ if arg.starts_with("--data-dir=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        data_dir = Some(PathBuf::from(v));
                    }
                }
            }
            _ if arg.starts_with('-') => return Err(usage(&prog)),
            _ => {
                if machines_path.is_none() {
                    machines_path = Some(PathBuf::from(arg));
                } else {
                    return Err(usage(&prog));
                }
            }
        }
    }
    Ok(ParsedArgs {
        machines_path,
        data_dir,
        flush_secs,
        check,
    })
}

fn load_machines(path: &PathBuf) -> anyhow::Result<MachinesFile> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading machines file {}", path.display()))?;
    let parsed: MachinesFile = serde_json::from_str(&data)
        .with_context(|| format!("parsing machines file {}", path.display()))?;
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };

    let Some(machines_path) = parsed.machines_path else {
        eprintln!("No machines file given. Try --help.");
        std::process::exit(2);
    };
    let machines_file = load_machines(&machines_path)?;

    // Persisted settings, then env, then CLI flags.
    let mut config = CoreConfig::load();
    if let Some(dir) = parsed.data_dir {
        config.data_dir = dir;
    }
    if let Some(secs) = parsed.flush_secs {
        config.flush_interval_secs = secs;
    }

    if parsed.check {
        for m in &machines_file.machines {
            m.validate()
                .with_context(|| format!("machine '{}'", m.name))?;
        }
        println!(
            "ok: {} machine(s), data dir {}",
            machines_file.machines.len(),
            config.data_dir.display()
        );
        return Ok(());
    }

    let coordinator = Coordinator::new(config, WsConnector)?;

    // Connect everything that was saved; a machine that can't be added
    // (bad config, duplicate name) is skipped, the rest still start.
    let total = machines_file.machines.len();
    let mut added = 0usize;
    for machine in machines_file.machines {
        let name = machine.name.clone();
        match coordinator.add_machine(machine).await {
            Ok(()) => added += 1,
            Err(e) => warn!(machine = %name, error = %e, "skipping machine"),
        }
    }
    info!(added, total, "startup auto-connection scheduled");

    coordinator.spawn_flush_loop();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    coordinator.shutdown().await;
    Ok(())
}
