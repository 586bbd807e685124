// src/services/mirror.rs
//! Remote-style mirror of pseudonymized session rows.
//!
//! - One row per `(session_id, kind)`. A later write merges its top-level
//!   keys into the stored payload, so fields from different producers
//!   accumulate on the same row.
//! - Local files stay authoritative. A failed mirror write is logged and
//!   otherwise ignored, see [`mirror_best_effort`].
//! - There is deliberately no row kind for the original intake profile.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::LabResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    SessionOverview,
    UeqScores,
    TestResults,
    InteractionSummary,
}

impl MirrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorKind::SessionOverview => "session_overview",
            MirrorKind::UeqScores => "ueq_scores",
            MirrorKind::TestResults => "test_results",
            MirrorKind::InteractionSummary => "interaction_summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_overview" => Some(MirrorKind::SessionOverview),
            "ueq_scores" => Some(MirrorKind::UeqScores),
            "test_results" => Some(MirrorKind::TestResults),
            "interaction_summary" => Some(MirrorKind::InteractionSummary),
            _ => None,
        }
    }
}

impl fmt::Display for MirrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub session_id: String,
    pub kind: MirrorKind,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl MirrorRow {
    pub fn new(session_id: impl Into<String>, kind: MirrorKind, payload: Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// Sink for pseudonymized rows. Implementations may be remote and flaky.
pub trait MirrorStore: Send + Sync {
    fn upsert(&self, row: &MirrorRow) -> Result<()>;

    fn name(&self) -> &str {
        "mirror"
    }
}

/// Push a row, swallowing (but logging) any failure. Returns whether it landed.
pub fn mirror_best_effort(store: Option<&dyn MirrorStore>, row: &MirrorRow) -> bool {
    let Some(store) = store else {
        return false;
    };
    match store.upsert(row) {
        Ok(()) => {
            tracing::debug!(session_id = %row.session_id, kind = %row.kind, "mirrored");
            true
        }
        Err(e) => {
            tracing::warn!(
                session_id = %row.session_id,
                kind = %row.kind,
                store = store.name(),
                error = %e,
                "mirror write failed; local artifact remains authoritative"
            );
            false
        }
    }
}

/// SQLite-backed mirror used when no external store is wired in.
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    pub fn open(path: &Path, busy_timeout: Duration) -> LabResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS mirror_rows (
              session_id  TEXT NOT NULL,
              kind        TEXT NOT NULL,
              payload     TEXT NOT NULL,   -- JSON
              updated_at  TEXT NOT NULL,   -- RFC3339 UTC
              PRIMARY KEY (session_id, kind)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> LabResult<T>) -> LabResult<T> {
        let guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    pub fn get(&self, session_id: &str, kind: MirrorKind) -> LabResult<Option<MirrorRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT payload, updated_at FROM mirror_rows WHERE session_id = ?1 AND kind = ?2",
                    (session_id, kind.as_str()),
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((payload, updated_at)) = row else {
                return Ok(None);
            };
            Ok(Some(MirrorRow {
                session_id: session_id.to_string(),
                kind,
                payload: serde_json::from_str(&payload)?,
                updated_at: parse_ts(&updated_at),
            }))
        })
    }

    /// Every row for one session, ordered by kind.
    pub fn rows_for(&self, session_id: &str) -> LabResult<Vec<MirrorRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, payload, updated_at FROM mirror_rows WHERE session_id = ?1 ORDER BY kind",
            )?;
            let raw = stmt
                .query_map([session_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut out = Vec::with_capacity(raw.len());
            for (kind, payload, updated_at) in raw {
                let Some(kind) = MirrorKind::parse(&kind) else {
                    continue;
                };
                out.push(MirrorRow {
                    session_id: session_id.to_string(),
                    kind,
                    payload: serde_json::from_str(&payload)?,
                    updated_at: parse_ts(&updated_at),
                });
            }
            Ok(out)
        })
    }
}

impl MirrorStore for SqliteMirror {
    fn upsert(&self, row: &MirrorRow) -> Result<()> {
        let updated_at = row.updated_at.to_rfc3339();
        self.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT payload FROM mirror_rows WHERE session_id = ?1 AND kind = ?2",
                    (&row.session_id, row.kind.as_str()),
                    |r| r.get(0),
                )
                .optional()?;
            let mut payload = match stored.as_deref().map(serde_json::from_str::<Value>) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    tracing::warn!(session_id = %row.session_id, kind = %row.kind, error = %e, "stored mirror payload unreadable; replacing it");
                    Value::Null
                }
                None => Value::Null,
            };
            merge_payload(&mut payload, &row.payload);
            tx.execute(
                r#"
                INSERT INTO mirror_rows(session_id, kind, payload, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id, kind) DO UPDATE SET
                  payload    = excluded.payload,
                  updated_at = excluded.updated_at
                "#,
                (
                    &row.session_id,
                    row.kind.as_str(),
                    serde_json::to_string(&payload)?,
                    &updated_at,
                ),
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite-mirror"
    }
}

/// Top-level keys of `incoming` overwrite those in `stored`; anything that is
/// not an object on either side is replaced wholesale.
fn merge_payload(stored: &mut Value, incoming: &Value) {
    match (stored.as_object_mut(), incoming.as_object()) {
        (Some(base), Some(more)) => {
            for (k, v) in more {
                base.insert(k.clone(), v.clone());
            }
        }
        _ => *stored = incoming.clone(),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}
