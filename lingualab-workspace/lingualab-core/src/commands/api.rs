// src/commands/api.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::LabContext;
use crate::error::LabResult;
use crate::services::aggregate::{AggregateAnalyzer, AggregateMode, AggregateReport, FailedSession};
use crate::services::artifacts::SessionLayout;
use crate::services::audit::Severity;
use crate::services::capacity::{CapacityGate, CapacityStatus};
use crate::services::consolidator::Consolidator;
use crate::services::presence::PresenceRecord;

/// Operator-facing entry points over one workspace.
pub struct Commands {
    ctx: LabContext,
}

#[derive(Debug, Serialize)]
pub struct ConsolidatedSession {
    pub session_id: String,
    pub path: PathBuf,
    pub complete: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidationReport {
    pub written: Vec<ConsolidatedSession>,
    pub failed: Vec<FailedSession>,
}

#[derive(Debug, Serialize)]
pub struct PresenceView {
    #[serde(flatten)]
    pub record: PresenceRecord,
    pub live: bool,
}

impl Commands {
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self {
            ctx: LabContext::open(root)?,
        })
    }

    pub fn from_context(ctx: LabContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &LabContext {
        &self.ctx
    }

    /// Consolidate one session, or every session when `session_id` is `None`.
    /// Per-session failures are collected, not propagated.
    pub fn consolidate(&self, session_id: Option<&str>) -> LabResult<ConsolidationReport> {
        let consolidator = Consolidator::new(&self.ctx);
        let layouts = match session_id {
            Some(id) => vec![SessionLayout::locate(self.ctx.sessions_dir(), id)?],
            None => SessionLayout::discover(self.ctx.sessions_dir()),
        };

        let mut report = ConsolidationReport::default();
        for layout in layouts {
            match consolidator.consolidate_layout(&layout) {
                Ok(record) => report.written.push(ConsolidatedSession {
                    session_id: record.session.session_id,
                    path: layout.analytics_path(),
                    complete: record.data_quality.complete,
                }),
                Err(e) => report.failed.push(FailedSession {
                    session_id: layout.session_id(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// Build the cross-session report and write it to the configured path.
    pub fn aggregate(&self, reconsolidate: bool) -> LabResult<(AggregateReport, PathBuf)> {
        let mode = if reconsolidate {
            AggregateMode::Reconsolidate
        } else {
            AggregateMode::ReuseExisting
        };
        let analyzer = AggregateAnalyzer::new(&self.ctx);
        let report = analyzer.aggregate(mode);
        let path = self.ctx.config.storage.aggregate_report.clone();
        analyzer.write_report(&report, &path)?;
        Ok((report, path))
    }

    /// Mark silent sessions abandoned. Defaults to the configured liveness timeout.
    pub fn sweep(&self, older_than: Option<Duration>) -> LabResult<usize> {
        let timeout = older_than.unwrap_or_else(|| self.ctx.config.presence.liveness_timeout());
        let registry = self.ctx.open_registry()?;
        let swept = registry.sweep(timeout, Utc::now())?;
        self.ctx.audit.record_action(
            "commands",
            "sweep_applied",
            &json!({ "timeout_secs": timeout.as_secs(), "swept": swept }),
            if swept > 0 { Severity::Medium } else { Severity::Low },
        );
        Ok(swept)
    }

    pub fn presence(&self, now: DateTime<Utc>) -> LabResult<Vec<PresenceView>> {
        let timeout = self.ctx.config.presence.liveness_timeout();
        let registry = self.ctx.open_registry()?;
        Ok(registry
            .list()?
            .into_iter()
            .map(|record| PresenceView {
                live: record.is_live(now, timeout),
                record,
            })
            .collect())
    }

    pub fn capacity(&self, now: DateTime<Utc>) -> LabResult<CapacityStatus> {
        let registry = self.ctx.open_registry()?;
        let gate = CapacityGate::new(
            &registry,
            &self.ctx.config.capacity,
            self.ctx.config.presence.liveness_timeout(),
        );
        Ok(gate.status_at(now))
    }
}
