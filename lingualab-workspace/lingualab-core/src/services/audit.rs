//! services/audit.rs
//! Action logbook: one JSON line per significant lifecycle action.
//!
//! - Writes `logbook/actions.jsonl` under the workspace root.
//! - Lines reference sessions by id/pseudonym only. Callers never pass intake data here.
//! - Write errors are swallowed; the logbook must never break the caller.

use chrono::Utc;
use serde_json::{Value, json};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::LabConfig;
use crate::utils::fsio::append_jsonl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Append-only JSONL action log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
        }
    }

    pub fn from_config(cfg: &LabConfig) -> Self {
        Self {
            path: cfg.audit.path.clone(),
            enabled: cfg.audit.enabled,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Record a generic action event.
    ///
    /// # Arguments
    /// * `agent`: Logical component name (e.g., `"allocator"`, `"consolidator"`).
    /// * `action`: Short verb label (e.g., `"session_allocated"`, `"sweep_applied"`).
    /// * `details`: Arbitrary JSON payload (ids, counts).
    /// * `severity`: for quick triage.
    pub fn record_action(&self, agent: &str, action: &str, details: &Value, severity: Severity) {
        if !self.enabled {
            return;
        }
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "id": Uuid::new_v4().to_string(),
            "event": "action",
            "agent": agent,
            "action": action,
            "severity": severity.as_str(),
            "details": details,
        });
        if let Err(e) = append_jsonl(&self.path, &entry) {
            tracing::warn!(error = %e, path = %self.path.display(), "audit append failed");
        }
    }
}
