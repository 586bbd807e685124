// src/services/learning_log.rs
//! Buffered learning-interaction logger.
//!
//! - Events are buffered in memory and flushed to
//!   `learning_logs/learning_interactions.json` every `flush_every` events,
//!   at phase transitions and on drop.
//! - A flush merges the buffer into whatever is already on disk, keyed by the
//!   event's sequence number, so repeated flushes never duplicate events.
//!   Buffered events whose numbers were taken by another writer in the
//!   meantime are renumbered past the on-disk maximum.
//! - The real name, once known, is scrubbed from every event at flush,
//!   including events recorded before it was learned.
//! - Nothing here propagates an error to the caller. Failures are logged and
//!   retried on the next flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::services::artifacts::ArtifactKind;
use crate::services::audit::{AuditLog, Severity};
use crate::services::identity::Session;
use crate::services::mirror::{MirrorKind, MirrorRow, MirrorStore, mirror_best_effort};
use crate::services::redact::{scrub_name, scrub_name_value};
use crate::session::LanguageCode;
use crate::utils::fsio::{JsonRead, read_json_opt, write_json_atomic};

/// What kind of exchange an event records. Older labels are folded in on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InteractionKind {
    SlideExplanation,
    ManualChat,
    /// Context priming sent to the assistant; not a user interaction.
    PrimeContext,
    Other,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::SlideExplanation => "slide_explanation",
            InteractionKind::ManualChat => "manual_chat",
            InteractionKind::PrimeContext => "prime_context",
            InteractionKind::Other => "other",
        }
    }

    pub fn normalize(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "slide_explanation" | "personalized_explanation" => InteractionKind::SlideExplanation,
            "manual_chat" | "chat" => InteractionKind::ManualChat,
            "prime_context" => InteractionKind::PrimeContext,
            _ => InteractionKind::Other,
        }
    }

    pub fn is_user_interaction(&self) -> bool {
        !matches!(self, InteractionKind::PrimeContext)
    }
}

impl From<String> for InteractionKind {
    fn from(s: String) -> Self {
        InteractionKind::normalize(&s)
    }
}

impl From<InteractionKind> for String {
    fn from(k: InteractionKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<LanguageCode>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: InteractionKind,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub system_response: String,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Caller-facing event, before the logger stamps sequence and time.
#[derive(Debug, Clone, Default)]
pub struct Interaction {
    pub kind: Option<InteractionKind>,
    pub user_input: String,
    pub system_response: String,
    pub metadata: EventMetadata,
}

impl Interaction {
    pub fn new(kind: InteractionKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Build from a free-form label such as `"chat"` or `"personalized_explanation"`.
    pub fn labeled(label: &str) -> Self {
        Self::new(InteractionKind::normalize(label))
    }

    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.user_input = text.into();
        self
    }

    pub fn response(mut self, text: impl Into<String>) -> Self {
        self.system_response = text.into();
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.metadata.latency_ms = Some(ms);
        self
    }

    pub fn slide(mut self, n: u32) -> Self {
        self.metadata.slide_number = Some(n);
        self
    }

    pub fn prompt_category(mut self, c: impl Into<String>) -> Self {
        self.metadata.prompt_category = Some(c.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCounts {
    pub total_events: u64,
    pub user_interactions: u64,
    pub slide_explanations: u64,
    pub manual_chat: u64,
    pub prime_context: u64,
    pub other: u64,
}

impl InteractionCounts {
    pub fn add(&mut self, kind: InteractionKind) {
        self.total_events += 1;
        if kind.is_user_interaction() {
            self.user_interactions += 1;
        }
        match kind {
            InteractionKind::SlideExplanation => self.slide_explanations += 1,
            InteractionKind::ManualChat => self.manual_chat += 1,
            InteractionKind::PrimeContext => self.prime_context += 1,
            InteractionKind::Other => self.other += 1,
        }
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a InteractionEvent>) -> Self {
        let mut c = Self::default();
        for e in events {
            c.add(e.kind);
        }
        c
    }
}

/// On-disk shape of `learning_interactions.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningLogArtifact {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub pseudonym: String,
    #[serde(default)]
    pub language_code: Option<LanguageCode>,
    #[serde(default)]
    pub events: Vec<InteractionEvent>,
}

pub struct LearningLogger {
    session_id: String,
    pseudonym: String,
    language: LanguageCode,
    path: PathBuf,
    flush_every: usize,
    buffer: Vec<InteractionEvent>,
    next_seq: u64,
    counts: InteractionCounts,
    base_meta: Map<String, Value>,
    real_name: Option<String>,
    mirror: Option<Arc<dyn MirrorStore>>,
    mirror_dirty: bool,
    audit: AuditLog,
    failed_flushes: u64,
}

impl LearningLogger {
    /// Attach to a session, continuing any sequence already on disk.
    pub fn open(session: &Session, flush_every: usize) -> Self {
        let path = session.layout().artifact_path(ArtifactKind::LearningLogs);
        let mut next_seq = 1;
        let mut counts = InteractionCounts::default();
        match read_json_opt::<LearningLogArtifact>(&path) {
            JsonRead::Present(existing) => {
                next_seq = existing.events.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
                counts = InteractionCounts::from_events(&existing.events);
            }
            JsonRead::Missing => {}
            JsonRead::Malformed(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "existing learning log unreadable; it will be set aside on first flush");
            }
        }

        let mut base_meta = match session.experiment_meta() {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        base_meta.insert("condition".into(), json!(session.condition()));

        Self {
            session_id: session.id().to_string(),
            pseudonym: session.pseudonym().fake_name(),
            language: session.language(),
            path,
            flush_every,
            buffer: Vec::new(),
            next_seq,
            counts,
            base_meta,
            real_name: session.real_name().map(str::to_string),
            mirror: session.mirror_handle(),
            mirror_dirty: false,
            audit: session.audit().clone(),
            failed_flushes: 0,
        }
    }

    /// Real name to scrub from every event text from now on.
    pub fn redact_name(&mut self, real_name: impl Into<String>) {
        let n = real_name.into();
        self.real_name = (!n.trim().is_empty()).then_some(n);
    }

    /// Buffer one event. Never fails; returns the provisional sequence number,
    /// which a flush may move up if another writer claimed it first.
    pub fn record(&mut self, interaction: Interaction) -> u64 {
        let kind = interaction.kind.unwrap_or(InteractionKind::Other);
        let mut metadata = interaction.metadata;
        if metadata.language_code.is_none() {
            metadata.language_code = Some(self.language);
        }
        for (k, v) in &self.base_meta {
            metadata.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.counts.add(kind);
        let mut event = InteractionEvent {
            seq,
            timestamp: Utc::now(),
            kind,
            user_input: interaction.user_input,
            system_response: interaction.system_response,
            metadata,
        };
        if let Some(name) = self.real_name.as_deref() {
            scrub_event(&mut event, name, &self.pseudonym);
        }
        self.buffer.push(event);
        tracing::trace!(session_id = %self.session_id, seq, %kind, "interaction buffered");

        if self.flush_every > 0 && self.buffer.len() >= self.flush_every {
            self.flush();
        }
        seq
    }

    /// Phase boundaries always flush.
    pub fn phase_transition(&mut self, page: &str) -> Option<PathBuf> {
        tracing::debug!(session_id = %self.session_id, page, "phase transition flush");
        self.flush()
    }

    /// Persist buffered events. `None` when nothing needed writing or the write failed.
    pub fn flush(&mut self) -> Option<PathBuf> {
        if self.buffer.is_empty() && !self.mirror_dirty {
            return None;
        }

        let mut merged: BTreeMap<u64, InteractionEvent> = BTreeMap::new();
        match read_json_opt::<LearningLogArtifact>(&self.path) {
            JsonRead::Present(existing) => {
                merged.extend(existing.events.into_iter().map(|e| (e.seq, e)));
            }
            JsonRead::Missing => {}
            JsonRead::Malformed(e) => self.set_aside_corrupt(&e),
        }
        // Our own earlier flushes already left the buffer, so any overlap is another writer's.
        if let Some(&disk_max) = merged.keys().next_back() {
            if self.buffer.iter().any(|e| merged.contains_key(&e.seq)) {
                tracing::warn!(
                    session_id = %self.session_id,
                    disk_max,
                    pending = self.buffer.len(),
                    "sequence numbers taken by another writer; renumbering buffered events"
                );
                for (i, e) in self.buffer.iter_mut().enumerate() {
                    e.seq = disk_max + 1 + i as u64;
                }
                self.next_seq = disk_max + 1 + self.buffer.len() as u64;
            }
        }
        let wrote = !self.buffer.is_empty();
        merged.extend(self.buffer.iter().cloned().map(|e| (e.seq, e)));
        if let Some(name) = self.real_name.as_deref() {
            for e in merged.values_mut() {
                scrub_event(e, name, &self.pseudonym);
            }
        }

        let artifact = LearningLogArtifact {
            session_id: self.session_id.clone(),
            pseudonym: self.pseudonym.clone(),
            language_code: Some(self.language),
            events: merged.into_values().collect(),
        };

        if wrote {
            if let Err(e) = write_json_atomic(&self.path, &artifact) {
                self.failed_flushes += 1;
                tracing::warn!(
                    session_id = %self.session_id,
                    pending = self.buffer.len(),
                    error = %e,
                    "learning log flush failed; will retry"
                );
                return None;
            }
            tracing::debug!(session_id = %self.session_id, flushed = self.buffer.len(), "learning log flushed");
            self.buffer.clear();
            self.counts = InteractionCounts::from_events(&artifact.events);
            self.mirror_dirty = true;
        }

        if self.mirror_dirty {
            let counts = InteractionCounts::from_events(&artifact.events);
            let row = MirrorRow::new(
                self.session_id.clone(),
                MirrorKind::InteractionSummary,
                json!({
                    "language_code": self.language,
                    "counts": counts,
                    "last_event_at": artifact.events.last().map(|e| e.timestamp.to_rfc3339()),
                }),
            );
            if mirror_best_effort(self.mirror.as_deref(), &row) || self.mirror.is_none() {
                self.mirror_dirty = false;
            }
        }

        wrote.then(|| self.path.clone())
    }

    fn set_aside_corrupt(&self, reason: &str) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let aside = self.path.with_extension(format!("corrupt-{stamp}.json"));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {
                tracing::warn!(session_id = %self.session_id, moved_to = %aside.display(), %reason, "corrupt learning log set aside");
                self.audit.record_action(
                    "learning_logger",
                    "corrupt_log_set_aside",
                    &json!({ "session_id": self.session_id, "moved_to": aside.display().to_string() }),
                    Severity::Medium,
                );
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "could not set aside corrupt learning log");
            }
        }
    }

    /// Counts over the log as last seen on disk plus anything still buffered.
    pub fn counts(&self) -> InteractionCounts {
        self.counts
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn scrub_event(e: &mut InteractionEvent, real_name: &str, pseudonym: &str) {
    e.user_input = scrub_name(&e.user_input, real_name, pseudonym);
    e.system_response = scrub_name(&e.system_response, real_name, pseudonym);
    if let Some(c) = e.metadata.prompt_category.as_mut() {
        *c = scrub_name(c, real_name, pseudonym);
    }
    for v in e.metadata.extra.values_mut() {
        scrub_name_value(v, real_name, pseudonym);
    }
}

impl Drop for LearningLogger {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_labels_are_normalized() {
        assert_eq!(
            InteractionKind::normalize("personalized_explanation"),
            InteractionKind::SlideExplanation
        );
        assert_eq!(InteractionKind::normalize("Chat"), InteractionKind::ManualChat);
        assert_eq!(InteractionKind::normalize("weird"), InteractionKind::Other);

        let k: InteractionKind = serde_json::from_str("\"chat\"").unwrap();
        assert_eq!(k, InteractionKind::ManualChat);
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"manual_chat\"");
    }

    #[test]
    fn prime_context_is_not_a_user_interaction() {
        let mut c = InteractionCounts::default();
        c.add(InteractionKind::PrimeContext);
        c.add(InteractionKind::ManualChat);
        c.add(InteractionKind::SlideExplanation);
        assert_eq!(c.total_events, 3);
        assert_eq!(c.user_interactions, 2);
        assert_eq!(c.prime_context, 1);
    }
}
