// src/services/artifacts.rs
//! On-disk session layout and the artifact producers that write into it.
//!
//! ```text
//! <sessions_dir>/<cohort>/<session_id>/
//!   meta/session.json                 header, written once
//!   meta/page_durations.json          page timings
//!   meta/experiment_meta.json         free-form experiment metadata
//!   profile/original_profile.json     intake with real name (never mirrored)
//!   profile/pseudonymized_profile.json
//!   knowledge_test/knowledge_test_results.json
//!   learning_logs/learning_interactions.json
//!   ueq/ueq_responses.json
//!   analytics/final_research_analytics.json
//! ```
//!
//! Every write is atomic. Producers never read each other's artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{LabError, LabResult};
use crate::services::audit::Severity;
use crate::services::identity::Session;
use crate::services::mirror::{MirrorKind, MirrorRow, mirror_best_effort};
use crate::services::redact::{scrub_name, scrub_name_value};
use crate::services::scoring::{
    ItemScore, KnowledgeTestSummary, TestItem, UeqEvaluation, evaluate_ueq, score_knowledge_test,
};
use crate::session::{LanguageCode, Pseudonym, SessionHeader};
use crate::utils::fsio::{JsonRead, read_json_opt, write_json_atomic};
use crate::utils::path::is_plain_component;

pub const SESSION_SUBDIRS: [&str; 6] = [
    "profile",
    "knowledge_test",
    "learning_logs",
    "ueq",
    "analytics",
    "meta",
];

pub const HEADER_FILE: &str = "session.json";
pub const ORIGINAL_PROFILE_FILE: &str = "original_profile.json";
pub const EXPERIMENT_META_FILE: &str = "experiment_meta.json";
pub const CANONICAL_FILE: &str = "final_research_analytics.json";

/// Intake keys that identify the participant and never reach the pseudonymized copy.
const IDENTIFYING_KEYS: [&str; 4] = ["name", "full_name", "real_name", "email"];

/// The independently produced artifacts the consolidator merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Profile,
    KnowledgeTest,
    LearningLogs,
    Ueq,
    PageTimings,
}

impl ArtifactKind {
    /// Canonical order; `data_quality.missing` follows it.
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Profile,
        ArtifactKind::KnowledgeTest,
        ArtifactKind::LearningLogs,
        ArtifactKind::Ueq,
        ArtifactKind::PageTimings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Profile => "profile",
            ArtifactKind::KnowledgeTest => "knowledge_test",
            ArtifactKind::LearningLogs => "learning_logs",
            ArtifactKind::Ueq => "ueq",
            ArtifactKind::PageTimings => "page_timings",
        }
    }

    pub fn subdir(&self) -> &'static str {
        match self {
            ArtifactKind::Profile => "profile",
            ArtifactKind::KnowledgeTest => "knowledge_test",
            ArtifactKind::LearningLogs => "learning_logs",
            ArtifactKind::Ueq => "ueq",
            ArtifactKind::PageTimings => "meta",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Profile => "pseudonymized_profile.json",
            ArtifactKind::KnowledgeTest => "knowledge_test_results.json",
            ArtifactKind::LearningLogs => "learning_interactions.json",
            ArtifactKind::Ueq => "ueq_responses.json",
            ArtifactKind::PageTimings => "page_durations.json",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths inside one session namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionLayout {
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory name, which is the session id.
    pub fn session_id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn header_path(&self) -> PathBuf {
        self.dir.join("meta").join(HEADER_FILE)
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.subdir()).join(kind.file_name())
    }

    pub fn original_profile_path(&self) -> PathBuf {
        self.dir.join("profile").join(ORIGINAL_PROFILE_FILE)
    }

    pub fn experiment_meta_path(&self) -> PathBuf {
        self.dir.join("meta").join(EXPERIMENT_META_FILE)
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.dir.join("analytics").join(CANONICAL_FILE)
    }

    /// Find a session directory by id under any cohort (or flat under `sessions_dir`).
    pub fn locate(sessions_dir: &Path, session_id: &str) -> LabResult<SessionLayout> {
        Pseudonym::parse(session_id)?;
        for lang in LanguageCode::ALL {
            let dir = sessions_dir.join(lang.cohort()).join(session_id);
            if dir.is_dir() {
                return Ok(Self::new(dir));
            }
        }
        let flat = sessions_dir.join(session_id);
        if flat.is_dir() {
            return Ok(Self::new(flat));
        }
        Err(LabError::SessionNotFound(session_id.to_string()))
    }

    /// Every directory under `sessions_dir` whose name is a well-formed session id,
    /// sorted by path.
    pub fn discover(sessions_dir: &Path) -> Vec<SessionLayout> {
        let mut out: Vec<SessionLayout> = WalkDir::new(sessions_dir)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter(|e| Pseudonym::parse(&e.file_name().to_string_lossy()).is_ok())
            .map(|e| SessionLayout::new(e.into_path()))
            .collect();
        out.sort();
        out
    }
}

/// Read the immutable header. Absent means the namespace is unusable.
pub fn read_header(layout: &SessionLayout) -> LabResult<SessionHeader> {
    let path = layout.header_path();
    match read_json_opt::<SessionHeader>(&path) {
        JsonRead::Present(h) => Ok(h),
        JsonRead::Missing => Err(LabError::MissingHeader {
            session_id: layout.session_id(),
            path,
        }),
        JsonRead::Malformed(reason) => Err(LabError::MalformedHeader { path, reason }),
    }
}

/// Demographic intake as collected, before pseudonymization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileIntake {
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub answers: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeTestArtifact {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub language_code: Option<LanguageCode>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub items: Vec<TestItem>,
    #[serde(default)]
    pub results: Vec<ItemScore>,
    #[serde(default)]
    pub summary: KnowledgeTestSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UeqArtifact {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub language_code: Option<LanguageCode>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub answers: BTreeMap<String, u8>,
    #[serde(flatten)]
    pub evaluation: UeqEvaluation,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Session {
    /// Store the intake twice: the original (with real name) stays local and
    /// segregated; the pseudonymized copy references only the fake name.
    pub fn save_profile(&mut self, intake: &ProfileIntake) -> LabResult<PathBuf> {
        let layout = self.layout().clone();
        let fake = self.pseudonym().fake_name();
        let real_name = intake
            .real_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let original = json!({
            "session_id": self.id(),
            "real_name": real_name,
            "answers": intake.answers,
            "captured_at": Utc::now().to_rfc3339(),
        });
        write_json_atomic(&layout.original_profile_path(), &original)?;

        let mut answers = Value::Object(
            intake
                .answers
                .iter()
                .filter(|(k, _)| !IDENTIFYING_KEYS.contains(&k.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        if let Some(name) = real_name.as_deref() {
            scrub_name_value(&mut answers, name, &fake);
        }
        let pseudonymized = json!({
            "session_id": self.id(),
            "pseudonym": fake,
            "language_code": self.language(),
            "condition": self.condition(),
            "answers": answers,
        });
        let path = layout.artifact_path(ArtifactKind::Profile);
        write_json_atomic(&path, &pseudonymized)?;
        self.real_name = real_name;

        mirror_best_effort(
            self.mirror(),
            &MirrorRow::new(
                self.id(),
                MirrorKind::SessionOverview,
                self.overview_payload(json!({ "profile": answers })),
            ),
        );
        self.audit().record_action(
            "producer",
            "profile_saved",
            &json!({ "session_id": self.id() }),
            Severity::Low,
        );
        Ok(path)
    }

    pub fn save_knowledge_test(&self, items: &[TestItem]) -> LabResult<PathBuf> {
        let (results, summary) = score_knowledge_test(items);
        let artifact = KnowledgeTestArtifact {
            session_id: self.id().to_string(),
            language_code: Some(self.language()),
            submitted_at: Some(Utc::now()),
            items: items.to_vec(),
            results,
            summary,
        };
        let path = self.layout().artifact_path(ArtifactKind::KnowledgeTest);
        write_json_atomic(&path, &artifact)?;

        mirror_best_effort(
            self.mirror(),
            &MirrorRow::new(
                self.id(),
                MirrorKind::TestResults,
                json!({
                    "language_code": self.language(),
                    "summary": artifact.summary,
                    "results": artifact.results,
                }),
            ),
        );
        self.audit().record_action(
            "producer",
            "knowledge_test_saved",
            &json!({ "session_id": self.id(), "items": artifact.summary.items }),
            Severity::Low,
        );
        Ok(path)
    }

    pub fn save_ueq(&self, answers: &BTreeMap<String, u8>, comment: Option<&str>) -> LabResult<PathBuf> {
        let evaluation = evaluate_ueq(answers);
        let comment = comment.map(|c| match self.real_name() {
            Some(name) => scrub_name(c, name, &self.pseudonym().fake_name()),
            None => c.to_string(),
        });
        let artifact = UeqArtifact {
            session_id: self.id().to_string(),
            language_code: Some(self.language()),
            submitted_at: Some(Utc::now()),
            answers: answers.clone(),
            evaluation,
            comment,
        };
        let path = self.layout().artifact_path(ArtifactKind::Ueq);
        write_json_atomic(&path, &artifact)?;

        mirror_best_effort(
            self.mirror(),
            &MirrorRow::new(
                self.id(),
                MirrorKind::UeqScores,
                json!({
                    "language_code": self.language(),
                    "scale_means": artifact.evaluation.scale_means,
                    "grades": artifact.evaluation.grades,
                    "complete": artifact.evaluation.complete,
                }),
            ),
        );
        self.audit().record_action(
            "producer",
            "ueq_saved",
            &json!({ "session_id": self.id(), "complete": artifact.evaluation.complete }),
            Severity::Low,
        );
        Ok(path)
    }

    /// Write page durations (seconds per page).
    pub fn save_page_timings(&self, durations: &BTreeMap<String, f64>) -> LabResult<PathBuf> {
        let path = self.layout().artifact_path(ArtifactKind::PageTimings);
        write_json_atomic(&path, durations)?;
        Ok(path)
    }

    /// Write an auxiliary JSON file under `meta/`. The header name is reserved.
    pub fn write_meta_json(&self, name: &str, value: &Value) -> LabResult<PathBuf> {
        if !is_plain_component(name) || name == HEADER_FILE {
            return Err(LabError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to write meta file {name:?}"),
            )));
        }
        let path = self.layout().dir().join("meta").join(name);
        write_json_atomic(&path, value)?;
        Ok(path)
    }

    /// Merge `fields` into `meta/experiment_meta.json`; later keys win.
    pub fn update_experiment_meta(&self, fields: &Map<String, Value>) -> LabResult<PathBuf> {
        let mut current = match self.experiment_meta() {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        for (k, v) in fields {
            current.insert(k.clone(), v.clone());
        }
        self.write_meta_json(EXPERIMENT_META_FILE, &Value::Object(current))
    }

    pub fn experiment_meta(&self) -> Option<Value> {
        match read_json_opt::<Value>(&self.layout().experiment_meta_path()) {
            JsonRead::Present(v) => Some(v),
            JsonRead::Missing => None,
            JsonRead::Malformed(e) => {
                tracing::warn!(session_id = %self.id(), error = %e, "experiment meta unreadable");
                None
            }
        }
    }
}
