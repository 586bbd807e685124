// src/session.rs
//! Core session vocabulary: language arms, experimental condition, lifecycle
//! status, the pseudonym and the immutable session header.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LabError, LabResult};

/// Bumped whenever the on-disk session layout changes shape.
pub const LAYOUT_VERSION: u32 = 1;

/// `strftime` pattern of the timestamp half of a session id.
pub const SESSION_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageCode {
    En,
    De,
    Nl,
    Tr,
    Sq,
    Hi,
}

impl LanguageCode {
    pub const ALL: [LanguageCode; 6] = [
        LanguageCode::En,
        LanguageCode::De,
        LanguageCode::Nl,
        LanguageCode::Tr,
        LanguageCode::Sq,
        LanguageCode::Hi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageCode::En => "en",
            LanguageCode::De => "de",
            LanguageCode::Nl => "nl",
            LanguageCode::Tr => "tr",
            LanguageCode::Sq => "sq",
            LanguageCode::Hi => "hi",
        }
    }

    pub fn parse(code: &str) -> LabResult<Self> {
        let code = code.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == code)
            .ok_or(LabError::UnknownLanguage(code))
    }

    /// Directory that groups every session of this language arm.
    pub fn cohort(&self) -> &'static str {
        match self {
            LanguageCode::En => "english_cohort",
            LanguageCode::De => "german_cohort",
            LanguageCode::Nl => "dutch_cohort",
            LanguageCode::Tr => "turkish_cohort",
            LanguageCode::Sq => "albanian_cohort",
            LanguageCode::Hi => "hindi_cohort",
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Experimental arm, fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Personalized,
    Generic,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Personalized => "personalized",
            Condition::Generic => "generic",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }

    /// Only `active -> completed` and `active -> abandoned` are legal. Terminal
    /// states never change again.
    pub fn transition(self, to: SessionStatus) -> LabResult<SessionStatus> {
        match (self, to) {
            (SessionStatus::Active, SessionStatus::Completed)
            | (SessionStatus::Active, SessionStatus::Abandoned) => Ok(to),
            (from, to) => Err(LabError::IllegalTransition { from, to }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Fake identity minted at session start: `(timestamp, first_last)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pseudonym {
    pub timestamp: String,
    pub first: String,
    pub last: String,
}

impl Pseudonym {
    pub fn new(created_at: DateTime<Utc>, first: &str, last: &str) -> Self {
        Self {
            timestamp: created_at.format(SESSION_TS_FORMAT).to_string(),
            first: first.to_string(),
            last: last.to_string(),
        }
    }

    pub fn fake_name(&self) -> String {
        format!("{}_{}", self.first, self.last)
    }

    pub fn session_id(&self) -> String {
        format!("{}_{}_{}", self.timestamp, self.first, self.last)
    }

    /// Parse `<YYYYmmdd>_<HHMMSS>_<First>_<Last>`.
    pub fn parse(session_id: &str) -> LabResult<Self> {
        let invalid = || LabError::InvalidSessionId(session_id.to_string());
        let parts: Vec<&str> = session_id.split('_').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let timestamp = format!("{}_{}", parts[0], parts[1]);
        NaiveDateTime::parse_from_str(&timestamp, SESSION_TS_FORMAT).map_err(|_| invalid())?;
        let name_ok = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic());
        if !name_ok(parts[2]) || !name_ok(parts[3]) {
            return Err(invalid());
        }
        Ok(Self {
            timestamp,
            first: parts[2].to_string(),
            last: parts[3].to_string(),
        })
    }
}

/// `meta/session.json`. Written exactly once, before any other artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub layout_version: u32,
    pub session_id: String,
    pub pseudonym: String,
    pub language_code: LanguageCode,
    pub condition: Condition,
    pub created_at: DateTime<Utc>,
}
