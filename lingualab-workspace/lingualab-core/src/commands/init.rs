// lingualab-core/src/commands/init.rs

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

/// Resolve the workspace root: explicit flag, then `LINGUALAB_ROOT`, then `.lingualab`.
pub fn workspace_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    std::env::var_os("LINGUALAB_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".lingualab"))
}

/// Create the workspace skeleton under `root`. Idempotent; existing files are never touched.
pub fn ensure_layout(root: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(root, "", &mut created, &mut existed)?;
    ensure_dir(root, "sessions", &mut created, &mut existed)?;
    ensure_dir(root, "registry", &mut created, &mut existed)?;
    ensure_dir(root, "analytics", &mut created, &mut existed)?;
    ensure_dir(root, "logbook", &mut created, &mut existed)?;

    ensure_file(
        root,
        "config.toml",
        Some(DEFAULT_CONFIG_TOML),
        &mut created,
        &mut existed,
    )?;

    let init_event = format!(
        r#"{{"timestamp":"{}","event":"system_init","agent":"system","details":{{"layout":"cohort/session","version":"{}"}}}}"#,
        Utc::now().to_rfc3339(),
        env!("CARGO_PKG_VERSION"),
    );
    ensure_seeded_jsonl(
        &root.join("logbook"),
        "actions.jsonl",
        &init_event,
        &mut created,
        &mut existed,
    )?;

    if !created.is_empty() {
        tracing::info!(root = %root.display(), created = ?created, "workspace initialized");
    }
    Ok(InitReport {
        root: root.to_path_buf(),
        created,
        existed,
    })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: Option<&str>,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    let bytes = content_if_absent.unwrap_or("").as_bytes();
    write_atomic(&p, bytes).with_context(|| format!("write {:?}", p))?;
    created.push(rel_file.to_string());
    Ok(())
}

fn ensure_seeded_jsonl(
    dir: &Path,
    file: &str,
    init_line: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = dir.join(file);
    if !p.exists() {
        ensure_file(dir, file, Some(&(init_line.to_string() + "\n")), created, existed)?;
        return Ok(());
    }
    existed.push(file.to_string());
    // Present but empty: seed it.
    if fs::metadata(&p)?.len() == 0 {
        let mut f = OpenOptions::new().append(true).open(&p)?;
        f.write_all(init_line.as_bytes())?;
        f.write_all(b"\n")?;
    }
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[storage]
sessions_dir = "sessions"
registry_path = "registry/presence.db"
mirror_path = "registry/mirror.db"
aggregate_report = "analytics/aggregate_report.json"

[logger]
flush_every = 10
mirror_enabled = true

[presence]
heartbeat_interval_secs = 20
liveness_timeout_secs = 60
busy_timeout_ms = 5000

[capacity]
enabled = true
max_concurrent = 2
avg_learning_minutes = 30

[audit]
enabled = true
path = "logbook/actions.jsonl"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabConfig;

    #[test]
    fn second_run_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_layout(dir.path()).unwrap();
        assert!(first.created.contains(&"config.toml".to_string()));
        assert!(first.created.contains(&"sessions".to_string()));

        let second = ensure_layout(dir.path()).unwrap();
        assert!(second.created.is_empty());
    }

    #[test]
    fn seeded_config_matches_defaults() {
        let dir = tempfile::tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();
        let cfg = LabConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.capacity.max_concurrent, 2);
        assert_eq!(cfg.presence.liveness_timeout_secs, 60);
        assert_eq!(cfg.storage.sessions_dir, dir.path().join("sessions"));
    }
}
