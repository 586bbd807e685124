// src/services/identity.rs
//! Pseudonym minting and session-namespace allocation.
//!
//! - A session id is `<YYYYmmdd_HHMMSS>_<First>_<Last>` drawn from fixed pools.
//! - An id is claimed with an exclusive create of `sessions/.claims/<id>`, then
//!   its cohort directory with an exclusive `create_dir`. Two allocators racing
//!   for the same id, in any cohorts, can never both win.
//! - The header (`meta/session.json`) is written with `create_new` before any
//!   other artifact and is never rewritten.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Value, json};
use std::fs::{self, OpenOptions};
use std::io;
use std::sync::Arc;

use crate::context::LabContext;
use crate::error::{LabError, LabResult};
use crate::services::artifacts::{SESSION_SUBDIRS, SessionLayout, read_header};
use crate::services::audit::{AuditLog, Severity};
use crate::services::mirror::{MirrorKind, MirrorRow, MirrorStore, mirror_best_effort};
use crate::session::{Condition, LAYOUT_VERSION, LanguageCode, Pseudonym, SessionHeader};
use crate::utils::fsio::{JsonRead, read_json_opt, write_json_create_new};

pub const FIRST_NAMES: [&str; 26] = [
    "Alex", "Blake", "Casey", "Dana", "Eden", "Finley", "Gray", "Harper", "Indigo", "Jordan",
    "Kai", "Logan", "Morgan", "Nova", "Oakley", "Parker", "Quinn", "River", "Sage", "Taylor",
    "Unity", "Vale", "Winter", "Xen", "Yael", "Zephyr",
];

pub const LAST_NAMES: [&str; 26] = [
    "Adams", "Brooks", "Chen", "Davis", "Evans", "Fischer", "Garcia", "Hughes", "Ivanov",
    "Jensen", "Kim", "Lopez", "Miller", "Novak", "Ortiz", "Patel", "Quinn", "Rossi", "Silva",
    "Tanaka", "Ueda", "Varga", "Weber", "Xu", "Young", "Zhang",
];

const DEFAULT_MAX_ATTEMPTS: usize = 16;

/// Flat directory of zero-byte claim markers, one per allocated id.
pub const CLAIMS_DIR: &str = ".claims";

/// Mints pseudonyms and claims a fresh namespace for each new participant.
pub struct Allocator<'a> {
    ctx: &'a LabContext,
    first_names: &'a [&'a str],
    last_names: &'a [&'a str],
    max_attempts: usize,
}

impl<'a> Allocator<'a> {
    pub fn new(ctx: &'a LabContext) -> Self {
        Self {
            ctx,
            first_names: &FIRST_NAMES,
            last_names: &LAST_NAMES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Restrict the name pools (tests use single-entry pools to force collisions).
    pub fn with_name_pools(mut self, first: &'a [&'a str], last: &'a [&'a str]) -> Self {
        self.first_names = first;
        self.last_names = last;
        self
    }

    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn allocate(&self, language: LanguageCode, condition: Condition) -> LabResult<Session> {
        self.allocate_with(language, condition, &mut rand::thread_rng(), Utc::now())
    }

    /// Deterministic variant: caller supplies the RNG and the clock reading.
    pub fn allocate_with<R: Rng>(
        &self,
        language: LanguageCode,
        condition: Condition,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> LabResult<Session> {
        if self.first_names.is_empty() || self.last_names.is_empty() {
            return Err(LabError::NamespaceExhausted(0));
        }
        let sessions_dir = self.ctx.sessions_dir();
        let cohort_dir = sessions_dir.join(language.cohort());
        let claims_dir = sessions_dir.join(CLAIMS_DIR);
        fs::create_dir_all(&cohort_dir)?;
        fs::create_dir_all(&claims_dir)?;

        let mut claimed = None;
        for attempt in 1..=self.max_attempts {
            let first = self.first_names[rng.gen_range(0..self.first_names.len())];
            let last = self.last_names[rng.gen_range(0..self.last_names.len())];
            let pseudonym = Pseudonym::new(now, first, last);
            let session_id = pseudonym.session_id();

            // Ids are unique across cohorts, not just within one.
            if SessionLayout::locate(sessions_dir, &session_id).is_ok() {
                tracing::debug!(%session_id, attempt, "pseudonym taken in another cohort; redrawing");
                continue;
            }
            // Claim marker is shared by all cohorts; it is what makes the id unique.
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(claims_dir.join(&session_id))
            {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(%session_id, attempt, "pseudonym claimed concurrently; redrawing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            let dir = cohort_dir.join(&session_id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    claimed = Some((pseudonym, SessionLayout::new(dir)));
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(%session_id, attempt, "pseudonym collision; redrawing");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let Some((pseudonym, layout)) = claimed else {
            tracing::error!(attempts = self.max_attempts, "session namespace exhausted");
            return Err(LabError::NamespaceExhausted(self.max_attempts));
        };

        for sub in SESSION_SUBDIRS {
            fs::create_dir_all(layout.dir().join(sub))?;
        }

        let header = SessionHeader {
            layout_version: LAYOUT_VERSION,
            session_id: pseudonym.session_id(),
            pseudonym: pseudonym.fake_name(),
            language_code: language,
            condition,
            created_at: now,
        };
        let header_path = layout.header_path();
        match write_json_create_new(&header_path, &header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LabError::HeaderExists(header_path));
            }
            Err(e) => return Err(e.into()),
        }

        let session = Session {
            header,
            pseudonym,
            layout,
            audit: self.ctx.audit.clone(),
            mirror: self.ctx.mirror(),
            real_name: None,
        };

        mirror_best_effort(
            session.mirror(),
            &MirrorRow::new(
                session.id(),
                MirrorKind::SessionOverview,
                session.overview_payload(Value::Null),
            ),
        );
        self.ctx.audit.record_action(
            "allocator",
            "session_allocated",
            &json!({
                "session_id": session.id(),
                "language_code": language,
                "condition": condition,
            }),
            Severity::Low,
        );
        tracing::info!(session_id = %session.id(), %language, %condition, "session allocated");
        Ok(session)
    }
}

/// Handle to one participant's namespace. Producers write through it.
pub struct Session {
    header: SessionHeader,
    pseudonym: Pseudonym,
    layout: SessionLayout,
    audit: AuditLog,
    mirror: Option<Arc<dyn MirrorStore>>,
    pub(crate) real_name: Option<String>,
}

impl Session {
    /// Re-open an existing session by id (e.g. after a process restart).
    pub fn open(ctx: &LabContext, session_id: &str) -> LabResult<Self> {
        let layout = SessionLayout::locate(ctx.sessions_dir(), session_id)?;
        Self::from_layout(ctx, layout)
    }

    pub fn from_layout(ctx: &LabContext, layout: SessionLayout) -> LabResult<Self> {
        let header = read_header(&layout)?;
        let pseudonym = Pseudonym::parse(&header.session_id)?;
        let real_name = stored_real_name(&layout);
        Ok(Self {
            header,
            pseudonym,
            layout,
            audit: ctx.audit.clone(),
            mirror: ctx.mirror(),
            real_name,
        })
    }

    pub fn id(&self) -> &str {
        &self.header.session_id
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn pseudonym(&self) -> &Pseudonym {
        &self.pseudonym
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn language(&self) -> LanguageCode {
        self.header.language_code
    }

    pub fn condition(&self) -> Condition {
        self.header.condition
    }

    /// Real name captured at intake, kept in memory only for scrubbing.
    pub fn real_name(&self) -> Option<&str> {
        self.real_name.as_deref()
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub(crate) fn mirror(&self) -> Option<&dyn MirrorStore> {
        self.mirror.as_deref()
    }

    pub(crate) fn mirror_handle(&self) -> Option<Arc<dyn MirrorStore>> {
        self.mirror.clone()
    }

    /// Pseudonymous overview row. `extra` is merged in when it is an object.
    pub(crate) fn overview_payload(&self, extra: Value) -> Value {
        let mut v = json!({
            "session_id": self.header.session_id,
            "pseudonym": self.header.pseudonym,
            "language_code": self.header.language_code,
            "condition": self.header.condition,
            "created_at": self.header.created_at.to_rfc3339(),
        });
        if let (Some(base), Value::Object(more)) = (v.as_object_mut(), extra) {
            base.extend(more);
        }
        v
    }
}

/// Real name from the segregated intake file, so a reopened session keeps scrubbing.
fn stored_real_name(layout: &SessionLayout) -> Option<String> {
    match read_json_opt::<Value>(&layout.original_profile_path()) {
        JsonRead::Present(v) => v
            .get("real_name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        JsonRead::Missing => None,
        JsonRead::Malformed(e) => {
            tracing::warn!(session_id = %layout.session_id(), error = %e, "original profile unreadable; real name not recovered");
            None
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.header.session_id)
            .field("dir", &self.layout.dir())
            .finish()
    }
}
