// src/services/presence.rs
//! Shared presence registry: one row per session with liveness and phase state.
//!
//! - SQLite in WAL mode with a busy timeout; every process opens its own
//!   connection and all mutations are single upsert/update statements.
//! - Heartbeats only touch `last_seen` and `current_page`. They never change
//!   status and never revive a terminal row.
//! - Status moves `active -> completed | abandoned` and then stays put.

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::LabResult;
use crate::session::{LanguageCode, SessionStatus};

/// Page recorded for a freshly started session.
pub const INITIAL_PAGE: &str = "login";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub session_id: String,
    pub language_code: String,
    pub current_page: String,
    pub last_seen: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub is_in_phase: bool,
    pub status: SessionStatus,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    /// Active and heard from within `timeout`.
    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == SessionStatus::Active && to_ms(now) - to_ms(self.last_seen) < timeout_ms(timeout)
    }

    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = r.get("status")?;
        Ok(Self {
            session_id: r.get("session_id")?,
            language_code: r.get("language_code")?,
            current_page: r.get("current_page")?,
            last_seen: from_ms(r.get("last_seen_ms")?),
            started_at: from_ms(r.get("started_at_ms")?),
            is_in_phase: r.get::<_, i64>("is_in_phase")? != 0,
            // Unknown labels can only come from a foreign writer; treat them as closed.
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Abandoned),
            ended_at: r.get::<_, Option<i64>>("ended_at_ms")?.map(from_ms),
        })
    }
}

/// Payload of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub session_id: String,
    pub language_code: LanguageCode,
    pub current_page: String,
}

impl Beacon {
    pub fn new(session_id: impl Into<String>, language_code: LanguageCode, page: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            language_code,
            current_page: page.into(),
        }
    }
}

pub struct PresenceRegistry {
    pub(crate) db: Connection,
}

impl PresenceRegistry {
    /// Open/create the registry and ensure schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> LabResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        db.busy_timeout(busy_timeout)?;
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS presence (
              session_id     TEXT PRIMARY KEY,
              language_code  TEXT NOT NULL,
              current_page   TEXT NOT NULL,
              last_seen_ms   INTEGER NOT NULL,   -- unix millis UTC
              started_at_ms  INTEGER NOT NULL,
              is_in_phase    INTEGER NOT NULL DEFAULT 0,
              status         TEXT NOT NULL DEFAULT 'active',
              ended_at_ms    INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_presence_status_seen ON presence(status, last_seen_ms);
            "#,
        )?;
        Ok(Self { db })
    }

    /// Register a session as active. Re-registering an active session just
    /// refreshes `last_seen`; terminal sessions are left alone.
    pub fn mark_started(&self, session_id: &str, language: LanguageCode, now: DateTime<Utc>) -> LabResult<()> {
        self.db.execute(
            r#"
            INSERT INTO presence(session_id, language_code, current_page, last_seen_ms, started_at_ms, is_in_phase, status)
            VALUES (?1, ?2, ?3, ?4, ?4, 0, 'active')
            ON CONFLICT(session_id) DO UPDATE SET
              last_seen_ms = excluded.last_seen_ms
            WHERE presence.status = 'active'
            "#,
            (session_id, language.as_str(), INITIAL_PAGE, to_ms(now)),
        )?;
        tracing::debug!(session_id, "presence started");
        Ok(())
    }

    /// Upsert liveness. Returns false when the row is terminal and was left untouched.
    pub fn heartbeat(&self, beacon: &Beacon, now: DateTime<Utc>) -> LabResult<bool> {
        let changed = self.db.execute(
            r#"
            INSERT INTO presence(session_id, language_code, current_page, last_seen_ms, started_at_ms, is_in_phase, status)
            VALUES (?1, ?2, ?3, ?4, ?4, 0, 'active')
            ON CONFLICT(session_id) DO UPDATE SET
              last_seen_ms = excluded.last_seen_ms,
              current_page = excluded.current_page
            WHERE presence.status = 'active'
            "#,
            (
                &beacon.session_id,
                beacon.language_code.as_str(),
                &beacon.current_page,
                to_ms(now),
            ),
        )?;
        Ok(changed > 0)
    }

    /// Flag (or clear) membership of the capacity-limited phase. Active rows only.
    pub fn set_in_phase(&self, session_id: &str, in_phase: bool, now: DateTime<Utc>) -> LabResult<bool> {
        let changed = self.db.execute(
            r#"
            UPDATE presence
               SET is_in_phase = ?2,
                   last_seen_ms = MAX(last_seen_ms, ?3)
             WHERE session_id = ?1 AND status = 'active'
            "#,
            (session_id, in_phase as i64, to_ms(now)),
        )?;
        Ok(changed > 0)
    }

    /// `active -> completed`. True only for the call that performed the transition.
    pub fn mark_completed(&self, session_id: &str, now: DateTime<Utc>) -> LabResult<bool> {
        let changed = self.db.execute(
            r#"
            UPDATE presence
               SET status = 'completed',
                   ended_at_ms = ?2
             WHERE session_id = ?1 AND status = 'active'
            "#,
            (session_id, to_ms(now)),
        )?;
        if changed > 0 {
            tracing::info!(session_id, "session completed");
        }
        Ok(changed > 0)
    }

    /// Mark every active session silent for longer than `timeout` as abandoned.
    pub fn sweep(&self, timeout: Duration, now: DateTime<Utc>) -> LabResult<usize> {
        let cutoff = to_ms(now) - timeout_ms(timeout);
        let swept = self.db.execute(
            r#"
            UPDATE presence
               SET status = 'abandoned',
                   ended_at_ms = ?2
             WHERE status = 'active' AND last_seen_ms < ?1
            "#,
            (cutoff, to_ms(now)),
        )?;
        if swept > 0 {
            tracing::info!(swept, "stale sessions marked abandoned");
        }
        Ok(swept)
    }

    pub fn get(&self, session_id: &str) -> LabResult<Option<PresenceRecord>> {
        let rec = self
            .db
            .query_row(
                "SELECT * FROM presence WHERE session_id = ?1",
                [session_id],
                PresenceRecord::from_row,
            )
            .optional()?;
        Ok(rec)
    }

    /// All rows, oldest first.
    pub fn list(&self) -> LabResult<Vec<PresenceRecord>> {
        let mut stmt = self
            .db
            .prepare("SELECT * FROM presence ORDER BY started_at_ms, session_id")?;
        let rows = stmt
            .query_map([], PresenceRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active sessions heard from within `timeout`.
    pub fn count_active(&self, now: DateTime<Utc>, timeout: Duration) -> LabResult<usize> {
        let cutoff = to_ms(now) - timeout_ms(timeout);
        let n: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM presence WHERE status = 'active' AND last_seen_ms > ?1",
            [cutoff],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Live sessions currently in the limited phase, optionally ignoring one.
    pub fn count_live_in_phase(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
        excluding: Option<&str>,
    ) -> LabResult<usize> {
        let cutoff = to_ms(now) - timeout_ms(timeout);
        let n: i64 = self.db.query_row(
            r#"
            SELECT COUNT(*) FROM presence
             WHERE status = 'active'
               AND is_in_phase = 1
               AND last_seen_ms > ?1
               AND session_id <> ?2
            "#,
            (cutoff, excluding.unwrap_or("")),
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn timeout_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

// ---------- background heartbeat ----------

/// Where a heartbeat goes. The registry is the real sink; tests swap in others.
pub trait BeatSink: Send + 'static {
    fn beat(&mut self, beacon: &Beacon, now: DateTime<Utc>) -> LabResult<()>;
}

/// Opens its own registry connection lazily on the heartbeat thread and
/// reopens it after a failure.
pub struct RegistrySink {
    path: PathBuf,
    busy_timeout: Duration,
    registry: Option<PresenceRegistry>,
}

impl RegistrySink {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            registry: None,
        }
    }
}

impl BeatSink for RegistrySink {
    fn beat(&mut self, beacon: &Beacon, now: DateTime<Utc>) -> LabResult<()> {
        if self.registry.is_none() {
            self.registry = Some(PresenceRegistry::open(&self.path, self.busy_timeout)?);
        }
        let Some(reg) = self.registry.as_ref() else {
            return Ok(());
        };
        if let Err(e) = reg.heartbeat(beacon, now) {
            self.registry = None;
            return Err(e);
        }
        Ok(())
    }
}

enum HeartbeatMsg {
    Page(String),
    Stop,
}

pub struct HeartbeatTask;

impl HeartbeatTask {
    /// Beat into the shared registry every `interval` until stopped.
    pub fn spawn(registry_path: &Path, busy_timeout: Duration, beacon: Beacon, interval: Duration) -> HeartbeatHandle {
        Self::spawn_with(RegistrySink::new(registry_path, busy_timeout), beacon, interval)
    }

    /// Beat into any sink. Failures are logged and the loop keeps going.
    pub fn spawn_with<S: BeatSink>(mut sink: S, mut beacon: Beacon, interval: Duration) -> HeartbeatHandle {
        let (tx, rx) = bounded::<HeartbeatMsg>(16);
        let join = std::thread::spawn(move || {
            let mut beats = 0u64;
            loop {
                match sink.beat(&beacon, Utc::now()) {
                    Ok(()) => beats += 1,
                    Err(e) => {
                        tracing::warn!(session_id = %beacon.session_id, error = %e, "heartbeat failed");
                    }
                }
                match rx.recv_timeout(interval) {
                    Ok(HeartbeatMsg::Page(p)) => beacon.current_page = p,
                    Ok(HeartbeatMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            tracing::debug!(session_id = %beacon.session_id, beats, "heartbeat stopped");
            beats
        });
        HeartbeatHandle {
            tx,
            join: Some(join),
        }
    }
}

/// Owner of a running heartbeat thread. Dropping it stops the thread.
pub struct HeartbeatHandle {
    tx: Sender<HeartbeatMsg>,
    join: Option<JoinHandle<u64>>,
}

impl HeartbeatHandle {
    /// Report a page change; the next beat goes out immediately.
    pub fn set_page(&self, page: &str) {
        let _ = self.tx.send(HeartbeatMsg::Page(page.to_string()));
    }

    /// Stop and join. Returns the number of successful beats.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        let _ = self.tx.send(HeartbeatMsg::Stop);
        match self.join.take() {
            Some(j) => j.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
