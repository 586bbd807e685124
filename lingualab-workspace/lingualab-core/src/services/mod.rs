// src/services/mod.rs

pub mod aggregate;
pub mod artifacts;
pub mod audit;
pub mod capacity;
pub mod consolidator;  // the only reader of other producers' artifacts
pub mod identity;
pub mod learning_log;
pub mod lifecycle;
pub mod mirror;
pub mod page_timer;
pub mod presence;      // shared SQLite registry, one connection per thread
pub mod redact;
pub mod scoring;

// Public API
pub use aggregate::{AggregateAnalyzer, AggregateMode, AggregateReport};
pub use artifacts::{ArtifactKind, ProfileIntake, SessionLayout};
pub use audit::{AuditLog, Severity};
pub use capacity::{Admission, AdmissionReason, CapacityGate, CapacityStatus};
pub use consolidator::{CanonicalRecord, Consolidator};
pub use identity::{Allocator, Session};
pub use learning_log::{Interaction, InteractionKind, LearningLogger};
pub use mirror::{MirrorKind, MirrorRow, MirrorStore, SqliteMirror};
pub use page_timer::PageTimer;
pub use presence::{Beacon, HeartbeatHandle, HeartbeatTask, PresenceRecord, PresenceRegistry};
