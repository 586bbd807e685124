// src/services/lifecycle.rs
//! Session start and termination as seen from the participant flow.

use chrono::Utc;
use serde_json::json;

use crate::context::LabContext;
use crate::error::LabResult;
use crate::services::audit::Severity;
use crate::services::consolidator::{CanonicalRecord, Consolidator};
use crate::services::identity::Session;
use crate::services::learning_log::LearningLogger;
use crate::services::mirror::{MirrorKind, MirrorRow, mirror_best_effort};
use crate::services::page_timer::PageTimer;
use crate::services::presence::{Beacon, HeartbeatHandle, HeartbeatTask, PresenceRegistry};

/// Register a freshly allocated session in the presence registry.
pub fn start_session(session: &Session, registry: &PresenceRegistry) -> LabResult<()> {
    registry.mark_started(session.id(), session.language(), Utc::now())
}

/// Keep the session's presence row fresh from a background thread, at the
/// configured interval, until the handle is stopped or dropped.
pub fn start_heartbeat(ctx: &LabContext, session: &Session, page: &str) -> HeartbeatHandle {
    let presence = &ctx.config.presence;
    HeartbeatTask::spawn(
        &ctx.config.storage.registry_path,
        presence.busy_timeout(),
        Beacon::new(session.id(), session.language(), page),
        presence.heartbeat_interval(),
    )
}

/// Termination step: flush producers, mark the session completed exactly once
/// and write the canonical record.
///
/// Registry trouble is logged and does not stop consolidation; the local
/// artifacts are what the record is built from.
pub fn finish_session(
    session: &Session,
    logger: &mut LearningLogger,
    timer: &mut PageTimer,
    registry: Option<&PresenceRegistry>,
    consolidator: &Consolidator,
) -> LabResult<CanonicalRecord> {
    logger.flush();
    if let Err(e) = timer.dump(session) {
        tracing::warn!(session_id = %session.id(), error = %e, "page timings not written");
    }

    if let Some(reg) = registry {
        match reg.mark_completed(session.id(), Utc::now()) {
            Ok(true) => {
                session.audit().record_action(
                    "lifecycle",
                    "session_completed",
                    &json!({ "session_id": session.id() }),
                    Severity::Low,
                );
            }
            Ok(false) => {
                tracing::info!(session_id = %session.id(), "session was already terminal; status unchanged");
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "could not mark session completed");
            }
        }
    }

    let record = consolidator.consolidate_layout(session.layout())?;
    mirror_best_effort(
        session.mirror(),
        &MirrorRow::new(
            session.id(),
            MirrorKind::SessionOverview,
            session.overview_payload(json!({
                "status": "completed",
                "summary_metrics": record.summary_metrics,
                "data_complete": record.data_quality.complete,
            })),
        ),
    );
    Ok(record)
}
