//! nncpd: tosses, checks and reassembles the spool of an NNCP node.
//!
//! Usage: nncpd [toss|check|reass] [NODE...]
//!        nncpd dump FILE.nncp.meta...

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use nncp_core::config::NncpConfig;
use nncp_core::{Node, NodeId};
use nncp_toss::chunked::{read_meta, reassemble_dir, ReassReport, ReassembleOptions};
use nncp_toss::{check, toss, Context, TossError, TossOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Toss,
    Check,
    Reass,
    Dump,
}

impl Mode {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "toss" => Some(Mode::Toss),
            "check" => Some(Mode::Check),
            "reass" => Some(Mode::Reass),
            "dump" => Some(Mode::Dump),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1).peekable();
    let mode = match args.peek().and_then(|a| Mode::parse(a)) {
        Some(mode) => {
            args.next();
            mode
        }
        None => Mode::Toss,
    };
    let names: Vec<String> = args.collect();
    if mode == Mode::Dump {
        return dump(&names);
    }

    let path = NncpConfig::write_default_if_missing().context("failed to prepare config")?;
    let config = NncpConfig::load().with_context(|| format!("failed to load {}", path.display()))?;
    let resolved = config.resolve().context("invalid configuration")?;
    init_tracing(&resolved.log);

    let ctx = Arc::new(Context::from_resolved(&resolved).context("failed to open spool")?);
    let nodes = select_nodes(&ctx, &names)?;
    let opts = TossOptions::from_config(&resolved.toss);
    let cycle = Duration::from_secs(resolved.toss.cycle);
    tracing::info!(?mode, node = %ctx.local.id, nodes = nodes.len(), "nncpd starting");

    let mut bad = false;
    loop {
        bad |= run_pass(&ctx, mode, &nodes, opts).await;
        if cycle.is_zero() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(cycle) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    if bad {
        tracing::warn!("finished with errors");
        std::process::exit(1);
    }
    Ok(())
}

/// Human output on stderr, JSON lines appended to the configured log file.
fn init_tracing(log: &Path) {
    let json = match OpenOptions::new().create(true).append(true).open(log) {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file)),
        ),
        Err(e) => {
            eprintln!("nncpd: cannot open log {}: {e}", log.display());
            None
        }
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(json)
        .init();
}

fn select_nodes(ctx: &Context, names: &[String]) -> Result<Vec<Arc<Node>>> {
    if names.is_empty() {
        let mut all: Vec<_> = ctx.neighbours.iter().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        return Ok(all);
    }
    names
        .iter()
        .map(|name| ctx.neighbours.resolve(name).with_context(|| format!("invalid node {name}")))
        .collect()
}

/// One pass over every node, one blocking task per node. Returns whether
/// anything went wrong.
async fn run_pass(ctx: &Arc<Context>, mode: Mode, nodes: &[Arc<Node>], opts: TossOptions) -> bool {
    if mode == Mode::Reass {
        let ctx = ctx.clone();
        let nodes = nodes.to_vec();
        return match tokio::task::spawn_blocking(move || reass(&ctx, &nodes)).await {
            Ok(report) => report.is_bad(),
            Err(e) => {
                tracing::error!(error = %e, "reassembly task failed");
                true
            }
        };
    }

    let mut tasks = Vec::with_capacity(nodes.len());
    for node in nodes {
        let ctx = ctx.clone();
        let id = node.id;
        let name = node.name.clone();
        let task = tokio::task::spawn_blocking(move || node_pass(&ctx, mode, &id, &opts));
        tasks.push((name, task));
    }

    let mut bad = false;
    for (name, task) in tasks {
        match task.await {
            Ok(Ok(node_bad)) => bad |= node_bad,
            Ok(Err(TossError::Lock(e))) if e.is_busy() => {
                tracing::info!(node = %name, "already running elsewhere");
            }
            Ok(Err(e)) => {
                tracing::error!(node = %name, error = %e, "pass failed");
                bad = true;
            }
            Err(e) => {
                tracing::error!(node = %name, error = %e, "task failed");
                bad = true;
            }
        }
    }
    bad
}

fn node_pass(ctx: &Context, mode: Mode, node: &NodeId, opts: &TossOptions) -> Result<bool, TossError> {
    match mode {
        Mode::Toss => Ok(toss(ctx, node, opts)?.is_bad()),
        Mode::Check => Ok(check(ctx, node)?.is_bad()),
        Mode::Reass | Mode::Dump => Ok(false),
    }
}

/// Reassemble under each selected node's incoming directory, once per
/// directory.
fn reass(ctx: &Context, nodes: &[Arc<Node>]) -> ReassReport {
    let mut dirs: Vec<_> = nodes.iter().filter_map(|n| n.incoming.clone()).collect();
    dirs.sort();
    dirs.dedup();
    let mut report = ReassReport::default();
    for dir in dirs {
        report.merge(reassemble_dir(&dir, ReassembleOptions::default()));
    }
    tracing::info!(
        node = %ctx.local.id,
        complete = report.complete,
        pending = report.pending,
        bad = report.bad,
        "reassembly finished"
    );
    report
}

/// Print decoded meta files as JSON.
fn dump(paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        anyhow::bail!("usage: nncpd dump FILE.nncp.meta...");
    }
    for path in paths {
        let meta = read_meta(Path::new(path)).with_context(|| format!("failed to read {path}"))?;
        println!("{}", serde_json::to_string_pretty(&meta.summary())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse() {
        assert_eq!(Mode::parse("toss"), Some(Mode::Toss));
        assert_eq!(Mode::parse("check"), Some(Mode::Check));
        assert_eq!(Mode::parse("reass"), Some(Mode::Reass));
        assert_eq!(Mode::parse("dump"), Some(Mode::Dump));
        assert_eq!(Mode::parse("alice"), None);
    }
}
