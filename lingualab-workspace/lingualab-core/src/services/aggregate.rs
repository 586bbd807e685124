// src/services/aggregate.rs
//! Cross-session report over canonical records, grouped by condition,
//! language arm and their combination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::context::LabContext;
use crate::error::LabResult;
use crate::services::artifacts::{SessionLayout, read_header};
use crate::services::audit::{AuditLog, Severity};
use crate::services::consolidator::{CanonicalRecord, Consolidator, read_canonical};
use crate::services::scoring::{METRIC_PLACES, round_to};
use crate::utils::fsio::{JsonRead, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Use canonical records already on disk; sessions without one are in progress.
    ReuseExisting,
    /// Re-run consolidation for every session first.
    Reconsolidate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub n: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    /// Sample standard deviation; absent below two samples.
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Stats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut xs: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
        let n = xs.len();
        if n == 0 {
            return Self::default();
        }
        xs.sort_by(f64::total_cmp);
        let mean = xs.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            xs[n / 2]
        } else {
            (xs[n / 2 - 1] + xs[n / 2]) / 2.0
        };
        let std_dev = (n > 1).then(|| {
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            round_to(var.sqrt(), METRIC_PLACES)
        });
        Self {
            n,
            mean: Some(round_to(mean, METRIC_PLACES)),
            median: Some(round_to(median, METRIC_PLACES)),
            std_dev,
            min: xs.first().copied(),
            max: xs.last().copied(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub sessions: usize,
    pub complete_sessions: usize,
    pub knowledge_accuracy: Stats,
    pub session_minutes: Stats,
    pub learning_minutes: Stats,
    pub user_interactions: Stats,
    pub slide_share: Stats,
    pub ueq: BTreeMap<String, Stats>,
}

#[derive(Default)]
struct GroupSamples {
    sessions: usize,
    complete: usize,
    accuracy: Vec<f64>,
    session_minutes: Vec<f64>,
    learning_minutes: Vec<f64>,
    interactions: Vec<f64>,
    slide_share: Vec<f64>,
    ueq: BTreeMap<String, Vec<f64>>,
}

impl GroupSamples {
    fn add(&mut self, r: &CanonicalRecord) {
        let m = &r.summary_metrics;
        self.sessions += 1;
        if r.data_quality.complete {
            self.complete += 1;
        }
        self.accuracy.extend(m.knowledge_accuracy);
        self.session_minutes.push(m.total_session_minutes);
        self.learning_minutes
            .push(m.learning_efficiency.learning_seconds / 60.0);
        self.interactions.push(m.engagement.user_interactions as f64);
        self.slide_share.extend(m.engagement.slide_share);
        for (scale, mean) in &m.ueq_scale_means {
            self.ueq.entry(scale.clone()).or_default().push(*mean);
        }
    }

    fn summarize(&self) -> GroupSummary {
        GroupSummary {
            sessions: self.sessions,
            complete_sessions: self.complete,
            knowledge_accuracy: Stats::from_samples(&self.accuracy),
            session_minutes: Stats::from_samples(&self.session_minutes),
            learning_minutes: Stats::from_samples(&self.learning_minutes),
            user_interactions: Stats::from_samples(&self.interactions),
            slide_share: Stats::from_samples(&self.slide_share),
            ueq: self
                .ueq
                .iter()
                .map(|(k, v)| (k.clone(), Stats::from_samples(v)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSession {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub generated_at: DateTime<Utc>,
    pub sessions_scanned: usize,
    pub included: usize,
    pub incomplete: usize,
    pub in_progress: Vec<String>,
    pub failed: Vec<FailedSession>,
    pub overall: GroupSummary,
    pub by_condition: BTreeMap<String, GroupSummary>,
    pub by_language: BTreeMap<String, GroupSummary>,
    /// Keyed `"<condition>/<language>"`.
    pub by_condition_language: BTreeMap<String, GroupSummary>,
}

pub struct AggregateAnalyzer {
    sessions_dir: PathBuf,
    consolidator: Consolidator,
    audit: AuditLog,
}

impl AggregateAnalyzer {
    pub fn new(ctx: &LabContext) -> Self {
        Self {
            sessions_dir: ctx.sessions_dir().to_path_buf(),
            consolidator: Consolidator::new(ctx),
            audit: ctx.audit.clone(),
        }
    }

    pub fn aggregate(&self, mode: AggregateMode) -> AggregateReport {
        let layouts = SessionLayout::discover(&self.sessions_dir);
        let mut records = Vec::new();
        let mut in_progress = Vec::new();
        let mut failed = Vec::new();

        for layout in &layouts {
            let id = layout.session_id();
            let outcome = match mode {
                AggregateMode::Reconsolidate => self.consolidator.consolidate_layout(layout).map(Some),
                AggregateMode::ReuseExisting => match read_canonical(layout) {
                    JsonRead::Present(r) => Ok(Some(r)),
                    // No record yet. A header-less directory is broken rather than pending.
                    JsonRead::Missing => read_header(layout).map(|_| None),
                    JsonRead::Malformed(e) => {
                        tracing::warn!(session_id = %id, error = %e, "stale canonical record; rebuilding");
                        self.consolidator.consolidate_layout(layout).map(Some)
                    }
                },
            };
            match outcome {
                Ok(Some(r)) => records.push(r),
                Ok(None) => in_progress.push(id),
                Err(e) => failed.push(FailedSession {
                    session_id: id,
                    error: e.to_string(),
                }),
            }
        }

        let mut overall = GroupSamples::default();
        let mut by_condition: BTreeMap<String, GroupSamples> = BTreeMap::new();
        let mut by_language: BTreeMap<String, GroupSamples> = BTreeMap::new();
        let mut by_cell: BTreeMap<String, GroupSamples> = BTreeMap::new();
        for r in &records {
            let cond = r.session.condition.as_str();
            let lang = r.session.language_code.as_str();
            overall.add(r);
            by_condition.entry(cond.to_string()).or_default().add(r);
            by_language.entry(lang.to_string()).or_default().add(r);
            by_cell.entry(format!("{cond}/{lang}")).or_default().add(r);
        }
        let summarize = |m: BTreeMap<String, GroupSamples>| -> BTreeMap<String, GroupSummary> {
            m.into_iter().map(|(k, g)| (k, g.summarize())).collect()
        };

        let report = AggregateReport {
            generated_at: Utc::now(),
            sessions_scanned: layouts.len(),
            included: records.len(),
            incomplete: records.iter().filter(|r| !r.data_quality.complete).count(),
            in_progress,
            failed,
            overall: overall.summarize(),
            by_condition: summarize(by_condition),
            by_language: summarize(by_language),
            by_condition_language: summarize(by_cell),
        };
        tracing::info!(
            scanned = report.sessions_scanned,
            included = report.included,
            in_progress = report.in_progress.len(),
            failed = report.failed.len(),
            "aggregate built"
        );
        report
    }

    pub fn write_report(&self, report: &AggregateReport, path: &Path) -> LabResult<()> {
        write_json_atomic(path, report)?;
        self.audit.record_action(
            "aggregate",
            "report_written",
            &serde_json::json!({
                "path": path.display().to_string(),
                "included": report.included,
                "failed": report.failed.len(),
            }),
            if report.failed.is_empty() { Severity::Low } else { Severity::Medium },
        );
        Ok(())
    }
}
