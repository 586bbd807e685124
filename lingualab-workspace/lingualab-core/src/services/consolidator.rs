// src/services/consolidator.rs
//! Merge one session's artifacts into its canonical analytics record.
//!
//! - Total over artifact presence: absent or malformed artifacts become empty
//!   sections and are listed under `data_quality`.
//! - Only a missing (or unreadable) header is fatal.
//! - Each artifact is read once; its digest and its parsed content come from
//!   the same bytes, so a concurrent producer cannot tear a section.
//! - Output is deterministic for identical inputs apart from `generated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::context::LabContext;
use crate::error::{LabError, LabResult};
use crate::services::artifacts::{ArtifactKind, KnowledgeTestArtifact, SessionLayout, read_header};
use crate::services::audit::{AuditLog, Severity};
use crate::services::learning_log::{InteractionCounts, LearningLogArtifact};
use crate::services::mirror::{MirrorKind, MirrorRow, MirrorStore, mirror_best_effort};
use crate::services::page_timer::LEARNING_PAGE;
use crate::services::scoring::{
    Grade, ItemScore, KnowledgeTestSummary, evaluate_ueq, ratio, round_to,
    score_knowledge_test,
};
use crate::session::{Condition, LanguageCode, SessionHeader};
use crate::utils::fsio::{JsonRead, read_json_opt, write_json_atomic};

pub const CANONICAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub pseudonym: String,
    pub language_code: LanguageCode,
    pub condition: Condition,
    pub created_at: DateTime<Utc>,
    pub layout_version: u32,
}

impl From<&SessionHeader> for SessionInfo {
    fn from(h: &SessionHeader) -> Self {
        Self {
            session_id: h.session_id.clone(),
            pseudonym: h.pseudonym.clone(),
            language_code: h.language_code,
            condition: h.condition,
            created_at: h.created_at,
            layout_version: h.layout_version,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeTestSection {
    pub results: Vec<ItemScore>,
    pub summary: KnowledgeTestSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionSection {
    pub counts: InteractionCounts,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UeqSection {
    pub answers: BTreeMap<String, u8>,
    pub scale_means: BTreeMap<String, f64>,
    pub grades: BTreeMap<String, Grade>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub slide_explanations: u64,
    pub manual_chat: u64,
    pub user_interactions: u64,
    pub slide_share: Option<f64>,
    pub slide_to_chat_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningEfficiency {
    pub learning_seconds: f64,
    pub interactions_per_minute: Option<f64>,
    pub seconds_per_interaction: Option<f64>,
    /// Knowledge-test accuracy per learning minute.
    pub accuracy_per_learning_minute: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub total_session_seconds: f64,
    pub total_session_minutes: f64,
    pub knowledge_accuracy: Option<f64>,
    pub engagement: Engagement,
    pub learning_efficiency: LearningEfficiency,
    pub ueq_scale_means: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub file: String,
    pub bytes: u64,
    pub blake3: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedArtifact {
    pub kind: ArtifactKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub complete: bool,
    pub missing: Vec<ArtifactKind>,
    pub malformed: Vec<MalformedArtifact>,
    pub warnings: Vec<String>,
}

/// `analytics/final_research_analytics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub session: SessionInfo,
    pub profile: Value,
    pub knowledge_test: KnowledgeTestSection,
    pub learning_logs: InteractionSection,
    pub ueq: UeqSection,
    pub page_timings: BTreeMap<String, f64>,
    pub summary_metrics: SummaryMetrics,
    /// Keyed by artifact kind label.
    pub sources: BTreeMap<String, SourceInfo>,
    pub data_quality: DataQuality,
}

impl CanonicalRecord {
    fn empty(header: &SessionHeader, generated_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: CANONICAL_SCHEMA_VERSION,
            generated_at,
            session: SessionInfo::from(header),
            profile: json!({}),
            knowledge_test: KnowledgeTestSection::default(),
            learning_logs: InteractionSection::default(),
            ueq: UeqSection::default(),
            page_timings: BTreeMap::new(),
            summary_metrics: SummaryMetrics::default(),
            sources: BTreeMap::new(),
            data_quality: DataQuality::default(),
        }
    }

    /// One merge arm per artifact variant.
    fn merge(&mut self, section: Section) {
        match section {
            Section::Profile(v) => self.profile = v,
            Section::KnowledgeTest(s) => self.knowledge_test = s,
            Section::LearningLogs(s) => self.learning_logs = s,
            Section::Ueq(s) => self.ueq = s,
            Section::PageTimings(t) => self.page_timings = t,
        }
    }

    fn derive_metrics(&mut self) {
        let total: f64 = self.page_timings.values().sum();
        let learning = self.page_timings.get(LEARNING_PAGE).copied().unwrap_or(0.0);
        let counts = &self.learning_logs.counts;
        let slides = counts.slide_explanations as f64;
        let chats = counts.manual_chat as f64;
        let users = counts.user_interactions as f64;
        let accuracy = self.knowledge_test.summary.accuracy;

        self.summary_metrics = SummaryMetrics {
            total_session_seconds: round_to(total, 1),
            total_session_minutes: round_to(total / 60.0, 2),
            knowledge_accuracy: accuracy,
            engagement: Engagement {
                slide_explanations: counts.slide_explanations,
                manual_chat: counts.manual_chat,
                user_interactions: counts.user_interactions,
                slide_share: ratio(slides, slides + chats),
                slide_to_chat_ratio: ratio(slides, chats),
            },
            learning_efficiency: LearningEfficiency {
                learning_seconds: round_to(learning, 1),
                interactions_per_minute: ratio(users, learning / 60.0),
                seconds_per_interaction: ratio(learning, users),
                accuracy_per_learning_minute: accuracy.and_then(|a| ratio(a, learning / 60.0)),
            },
            ueq_scale_means: self.ueq.scale_means.clone(),
        };
    }

    /// Identical modulo `generated_at`.
    pub fn same_content(&self, other: &CanonicalRecord) -> bool {
        let mut a = self.clone();
        a.generated_at = other.generated_at;
        &a == other
    }
}

/// Parsed form of one artifact.
enum Section {
    Profile(Value),
    KnowledgeTest(KnowledgeTestSection),
    LearningLogs(InteractionSection),
    Ueq(UeqSection),
    PageTimings(BTreeMap<String, f64>),
}

impl Section {
    fn parse(kind: ArtifactKind, bytes: &[u8]) -> Result<Self, String> {
        let err = |e: serde_json::Error| e.to_string();
        match kind {
            ArtifactKind::Profile => {
                let v: Value = serde_json::from_slice(bytes).map_err(err)?;
                if !v.is_object() {
                    return Err("expected a JSON object".into());
                }
                Ok(Section::Profile(v))
            }
            ArtifactKind::KnowledgeTest => {
                let a: KnowledgeTestArtifact = serde_json::from_slice(bytes).map_err(err)?;
                // Always rescored from the items; stored results are informational.
                let (results, summary) = score_knowledge_test(&a.items);
                Ok(Section::KnowledgeTest(KnowledgeTestSection { results, summary }))
            }
            ArtifactKind::LearningLogs => {
                let a: LearningLogArtifact = serde_json::from_slice(bytes).map_err(err)?;
                Ok(Section::LearningLogs(InteractionSection {
                    counts: InteractionCounts::from_events(&a.events),
                    first_event_at: a.events.iter().map(|e| e.timestamp).min(),
                    last_event_at: a.events.iter().map(|e| e.timestamp).max(),
                }))
            }
            ArtifactKind::Ueq => {
                #[derive(Deserialize)]
                struct Raw {
                    answers: BTreeMap<String, u8>,
                    #[serde(default)]
                    submitted_at: Option<DateTime<Utc>>,
                    #[serde(default)]
                    comment: Option<String>,
                }
                let raw: Raw = serde_json::from_slice(bytes).map_err(err)?;
                // Scores are recomputed; what the participant submitted is kept as is.
                let eval = evaluate_ueq(&raw.answers);
                Ok(Section::Ueq(UeqSection {
                    answers: raw.answers,
                    scale_means: eval.scale_means,
                    grades: eval.grades,
                    complete: eval.complete,
                    submitted_at: raw.submitted_at,
                    comment: raw.comment,
                }))
            }
            ArtifactKind::PageTimings => {
                let raw: BTreeMap<String, f64> = serde_json::from_slice(bytes).map_err(err)?;
                if let Some((page, _)) = raw.iter().find(|(_, v)| **v < 0.0) {
                    return Err(format!("negative duration for page {page:?}"));
                }
                Ok(Section::PageTimings(
                    raw.into_iter().map(|(k, v)| (k, round_to(v, 1))).collect(),
                ))
            }
        }
    }
}

enum Loaded {
    Missing,
    Malformed(String),
    Present(Section, SourceInfo),
}

fn load(layout: &SessionLayout, kind: ArtifactKind) -> Loaded {
    let path = layout.artifact_path(kind);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Malformed(format!("read failed: {e}")),
    };
    match Section::parse(kind, &bytes) {
        Ok(section) => Loaded::Present(
            section,
            SourceInfo {
                file: format!("{}/{}", kind.subdir(), kind.file_name()),
                bytes: bytes.len() as u64,
                blake3: blake3::hash(&bytes).to_hex().to_string(),
            },
        ),
        Err(e) => Loaded::Malformed(e),
    }
}

/// Build the record without writing it.
pub fn build_record(layout: &SessionLayout, generated_at: DateTime<Utc>) -> LabResult<CanonicalRecord> {
    let header = read_header(layout)?;
    if header.session_id != layout.session_id() {
        return Err(LabError::MalformedHeader {
            path: layout.header_path(),
            reason: format!(
                "header names {} but directory is {}",
                header.session_id,
                layout.session_id()
            ),
        });
    }

    let mut record = CanonicalRecord::empty(&header, generated_at);
    for kind in ArtifactKind::ALL {
        match load(layout, kind) {
            Loaded::Present(section, source) => {
                record.merge(section);
                record.sources.insert(kind.as_str().to_string(), source);
            }
            Loaded::Missing => record.data_quality.missing.push(kind),
            Loaded::Malformed(error) => record
                .data_quality
                .malformed
                .push(MalformedArtifact { kind, error }),
        }
    }

    let dq = &mut record.data_quality;
    if record.knowledge_test.summary.items > 0
        && record.knowledge_test.summary.answered < record.knowledge_test.summary.items
    {
        dq.warnings.push(format!(
            "{} of {} knowledge-test items unanswered",
            record.knowledge_test.summary.items - record.knowledge_test.summary.answered,
            record.knowledge_test.summary.items
        ));
    }
    if record.sources.contains_key(ArtifactKind::Ueq.as_str()) && !record.ueq.complete {
        dq.warnings.push("ueq responses incomplete; some scales omitted".into());
    }
    if record.sources.contains_key(ArtifactKind::PageTimings.as_str())
        && !record.page_timings.contains_key(LEARNING_PAGE)
    {
        dq.warnings.push(format!("no time recorded on page {LEARNING_PAGE:?}"));
    }
    dq.complete = dq.missing.is_empty() && dq.malformed.is_empty();

    record.derive_metrics();
    Ok(record)
}

/// Read a previously written canonical record.
pub fn read_canonical(layout: &SessionLayout) -> JsonRead<CanonicalRecord> {
    read_json_opt(&layout.analytics_path())
}

pub struct Consolidator {
    sessions_dir: PathBuf,
    audit: AuditLog,
    mirror: Option<std::sync::Arc<dyn MirrorStore>>,
}

impl Consolidator {
    pub fn new(ctx: &LabContext) -> Self {
        Self {
            sessions_dir: ctx.sessions_dir().to_path_buf(),
            audit: ctx.audit.clone(),
            mirror: ctx.mirror(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn consolidate(&self, session_id: &str) -> LabResult<CanonicalRecord> {
        let layout = SessionLayout::locate(&self.sessions_dir, session_id)?;
        self.consolidate_layout(&layout)
    }

    /// Build and atomically write the canonical record. Safe to rerun at any time.
    pub fn consolidate_layout(&self, layout: &SessionLayout) -> LabResult<CanonicalRecord> {
        let record = match build_record(layout, Utc::now()) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(session_id = %layout.session_id(), error = %e, "consolidation failed");
                self.audit.record_action(
                    "consolidator",
                    "consolidation_failed",
                    &json!({ "session_id": layout.session_id(), "error": e.to_string() }),
                    Severity::High,
                );
                return Err(e);
            }
        };
        write_json_atomic(&layout.analytics_path(), &record)?;

        let dq = &record.data_quality;
        tracing::info!(
            session_id = %record.session.session_id,
            complete = dq.complete,
            missing = dq.missing.len(),
            malformed = dq.malformed.len(),
            "canonical record written"
        );
        self.audit.record_action(
            "consolidator",
            "session_consolidated",
            &json!({
                "session_id": record.session.session_id,
                "complete": dq.complete,
                "missing": dq.missing,
                "malformed": dq.malformed.iter().map(|m| m.kind).collect::<Vec<_>>(),
            }),
            if dq.complete { Severity::Low } else { Severity::Medium },
        );
        mirror_best_effort(
            self.mirror.as_deref(),
            &MirrorRow::new(
                record.session.session_id.clone(),
                MirrorKind::SessionOverview,
                json!({
                    "session_id": record.session.session_id,
                    "pseudonym": record.session.pseudonym,
                    "language_code": record.session.language_code,
                    "condition": record.session.condition,
                    "created_at": record.session.created_at.to_rfc3339(),
                    "summary_metrics": record.summary_metrics,
                    "data_complete": dq.complete,
                }),
            ),
        );
        Ok(record)
    }
}
