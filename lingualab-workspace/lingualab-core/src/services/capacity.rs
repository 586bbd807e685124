// src/services/capacity.rs
//! Soft admission control for the capacity-limited learning phase.
//!
//! The gate counts live in-phase sessions in the presence registry and admits
//! while that count is below `max_concurrent`. Count-then-set is not atomic
//! across processes, so two simultaneous entrants may both be admitted; the
//! limit is advisory. Registry failures admit (fail open).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::CapacityConfig;
use crate::services::presence::PresenceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    Admitted,
    AlreadyInPhase,
    GateDisabled,
    AtCapacity,
    UnknownSession,
    SessionClosed,
    RegistryUnavailable(String),
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionReason::Admitted => f.write_str("admitted"),
            AdmissionReason::AlreadyInPhase => f.write_str("already in phase"),
            AdmissionReason::GateDisabled => f.write_str("capacity gate disabled"),
            AdmissionReason::AtCapacity => f.write_str("at capacity"),
            AdmissionReason::UnknownSession => f.write_str("session not registered"),
            AdmissionReason::SessionClosed => f.write_str("session already ended"),
            AdmissionReason::RegistryUnavailable(e) => write!(f, "registry unavailable ({e}); admitted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub reason: AdmissionReason,
    /// Live in-phase sessions after this decision, including the caller if admitted.
    pub in_phase: usize,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityStatus {
    pub enabled: bool,
    pub in_phase: usize,
    pub max: usize,
    pub slots_available: usize,
    pub active_sessions: usize,
    /// Rough wait in minutes when full; zero when a slot is free.
    pub estimated_wait_minutes: u32,
}

pub struct CapacityGate<'a> {
    registry: &'a PresenceRegistry,
    cfg: CapacityConfig,
    liveness_timeout: Duration,
}

impl<'a> CapacityGate<'a> {
    pub fn new(registry: &'a PresenceRegistry, cfg: &CapacityConfig, liveness_timeout: Duration) -> Self {
        Self {
            registry,
            cfg: cfg.clone(),
            liveness_timeout,
        }
    }

    pub fn try_enter_limited_phase(&self, session_id: &str) -> Admission {
        self.try_enter_at(session_id, Utc::now())
    }

    pub fn try_enter_at(&self, session_id: &str, now: DateTime<Utc>) -> Admission {
        let max = self.cfg.max_concurrent;
        let decision = |admitted: bool, reason: AdmissionReason, in_phase: usize| Admission {
            admitted,
            reason,
            in_phase,
            max,
        };

        if !self.cfg.enabled {
            self.flag(session_id, true, now);
            return decision(true, AdmissionReason::GateDisabled, 0);
        }

        let record = match self.registry.get(session_id) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "capacity check failed open");
                return decision(true, AdmissionReason::RegistryUnavailable(e.to_string()), 0);
            }
        };
        let Some(record) = record else {
            return decision(false, AdmissionReason::UnknownSession, 0);
        };
        if record.status.is_terminal() {
            return decision(false, AdmissionReason::SessionClosed, 0);
        }

        let others = match self
            .registry
            .count_live_in_phase(now, self.liveness_timeout, Some(session_id))
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "capacity count failed open");
                self.flag(session_id, true, now);
                return decision(true, AdmissionReason::RegistryUnavailable(e.to_string()), 0);
            }
        };

        if record.is_in_phase {
            self.flag(session_id, true, now);
            return decision(true, AdmissionReason::AlreadyInPhase, others + 1);
        }
        if others < max {
            self.flag(session_id, true, now);
            tracing::info!(session_id, in_phase = others + 1, max, "admitted to limited phase");
            return decision(true, AdmissionReason::Admitted, others + 1);
        }
        tracing::info!(session_id, in_phase = others, max, "limited phase full");
        decision(false, AdmissionReason::AtCapacity, others)
    }

    /// Clear the in-phase flag. Returns whether a row changed.
    pub fn leave_limited_phase(&self, session_id: &str) -> bool {
        self.flag(session_id, false, Utc::now())
    }

    pub fn status(&self) -> CapacityStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CapacityStatus {
        let max = self.cfg.max_concurrent;
        let in_phase = self
            .registry
            .count_live_in_phase(now, self.liveness_timeout, None)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "capacity status unavailable");
                0
            });
        let active_sessions = self
            .registry
            .count_active(now, self.liveness_timeout)
            .unwrap_or(0);
        let slots_available = if self.cfg.enabled {
            max.saturating_sub(in_phase)
        } else {
            usize::MAX
        };
        CapacityStatus {
            enabled: self.cfg.enabled,
            in_phase,
            max,
            slots_available,
            active_sessions,
            estimated_wait_minutes: if slots_available == 0 {
                self.cfg.avg_learning_minutes / 2
            } else {
                0
            },
        }
    }

    fn flag(&self, session_id: &str, in_phase: bool, now: DateTime<Utc>) -> bool {
        match self.registry.set_in_phase(session_id, in_phase, now) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(session_id, in_phase, error = %e, "could not update in-phase flag");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LanguageCode;

    #[test]
    fn disabled_gate_always_admits() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PresenceRegistry::open(&dir.path().join("p.db"), Duration::from_secs(1)).unwrap();
        let cfg = CapacityConfig {
            enabled: false,
            max_concurrent: 0,
            avg_learning_minutes: 30,
        };
        reg.mark_started("s", LanguageCode::En, Utc::now()).unwrap();
        let gate = CapacityGate::new(&reg, &cfg, Duration::from_secs(60));
        let a = gate.try_enter_limited_phase("s");
        assert!(a.admitted);
        assert_eq!(a.reason, AdmissionReason::GateDisabled);
        assert!(reg.get("s").unwrap().unwrap().is_in_phase);
    }

    #[test]
    fn unknown_session_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PresenceRegistry::open(&dir.path().join("p.db"), Duration::from_secs(1)).unwrap();
        let gate = CapacityGate::new(&reg, &CapacityConfig::default(), Duration::from_secs(60));
        let a = gate.try_enter_limited_phase("ghost");
        assert!(!a.admitted);
        assert_eq!(a.reason, AdmissionReason::UnknownSession);
    }
}
