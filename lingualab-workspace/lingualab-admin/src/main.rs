use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lingualab_core::commands::{Commands, ensure_layout, workspace_root};

#[derive(Parser)]
#[command(
    name = "lingualab-admin",
    about = "Operator tools for LinguaLab study workspaces"
)]
struct Cli {
    /// Workspace root (defaults to $LINGUALAB_ROOT, then ./.lingualab)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the workspace skeleton and default config
    Init,
    /// Write canonical analytics records for one or all sessions
    Consolidate {
        #[arg(long)]
        session: Option<String>,
    },
    /// Build the cross-session report
    Aggregate {
        /// Re-run consolidation for every session first
        #[arg(long)]
        reconsolidate: bool,
    },
    /// Mark silent sessions as abandoned
    Sweep {
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// List presence rows and capacity
    Presence,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lingualab_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = workspace_root(cli.root.as_deref());
    tracing::debug!(root = %root.display(), "workspace root resolved");
    match cli.cmd {
        Cmd::Init => init(&root),
        Cmd::Consolidate { session } => consolidate(&root, session.as_deref(), cli.json),
        Cmd::Aggregate { reconsolidate } => aggregate(&root, reconsolidate, cli.json),
        Cmd::Sweep { older_than_secs } => sweep(&root, older_than_secs.map(Duration::from_secs)),
        Cmd::Presence => presence(&root, cli.json),
    }
}

fn init(root: &std::path::Path) -> Result<()> {
    let report = ensure_layout(root).with_context(|| format!("init {}", root.display()))?;
    for c in &report.created {
        println!("created  {c}");
    }
    for e in &report.existed {
        println!("exists   {e}");
    }
    println!("workspace ready at {}", report.root.display());
    Ok(())
}

fn consolidate(root: &std::path::Path, session: Option<&str>, json: bool) -> Result<()> {
    let cmds = Commands::open(root)?;
    let report = cmds.consolidate(session)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for w in &report.written {
        let tag = if w.complete { "complete" } else { "partial" };
        println!("{:<9} {}  {}", tag, w.session_id, w.path.display());
    }
    for f in &report.failed {
        eprintln!("failed    {}  {}", f.session_id, f.error);
    }
    anyhow::ensure!(
        report.failed.is_empty(),
        "{} session(s) could not be consolidated",
        report.failed.len()
    );
    Ok(())
}

fn aggregate(root: &std::path::Path, reconsolidate: bool, json: bool) -> Result<()> {
    let cmds = Commands::open(root)?;
    let (report, path) = cmds.aggregate(reconsolidate)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{} scanned, {} included ({} incomplete), {} in progress, {} failed",
        report.sessions_scanned,
        report.included,
        report.incomplete,
        report.in_progress.len(),
        report.failed.len()
    );
    for (cell, g) in &report.by_condition_language {
        let acc = g
            .knowledge_accuracy
            .mean
            .map(|m| format!("{m:.3}"))
            .unwrap_or_else(|| "-".into());
        println!("  {cell:<18} n={:<3} accuracy={acc}", g.sessions);
    }
    println!("report written to {}", path.display());
    Ok(())
}

fn sweep(root: &std::path::Path, older_than: Option<Duration>) -> Result<()> {
    let cmds = Commands::open(root)?;
    let n = cmds.sweep(older_than)?;
    println!("{n} session(s) marked abandoned");
    Ok(())
}

fn presence(root: &std::path::Path, json: bool) -> Result<()> {
    let cmds = Commands::open(root)?;
    let now = Utc::now();
    let rows = cmds.presence(now)?;
    let cap = cmds.capacity(now)?;
    if json {
        let out = serde_json::json!({ "sessions": rows, "capacity": cap });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for v in &rows {
        let r = &v.record;
        let age = (now - r.last_seen).num_seconds();
        println!(
            "{:<34} {:<3} {:<10} {:<18} {}{} last_seen={}s ago",
            r.session_id,
            r.language_code,
            r.status,
            r.current_page,
            if v.live { "live" } else { "stale" },
            if r.is_in_phase { " in-phase" } else { "" },
            age
        );
    }
    if cap.enabled {
        println!(
            "capacity: {}/{} in phase, {} active, wait ~{} min",
            cap.in_phase, cap.max, cap.active_sessions, cap.estimated_wait_minutes
        );
    } else {
        println!("capacity gate disabled; {} active", cap.active_sessions);
    }
    Ok(())
}
