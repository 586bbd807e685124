// src/commands/mod.rs
pub mod init;
mod api;

pub use api::{Commands, ConsolidationReport, PresenceView};
pub use init::{InitReport, ensure_layout, workspace_root};
