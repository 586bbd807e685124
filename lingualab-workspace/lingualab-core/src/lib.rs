//! LinguaLab core: session namespaces, learning-interaction logging, presence
//! and capacity tracking, and consolidation of per-session artifacts into
//! canonical analytics records.

pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod services;
pub mod session;
pub mod utils;

pub use context::LabContext;
pub use error::{LabError, LabResult};
pub use session::{Condition, LanguageCode, SessionStatus};
