// src/context.rs
//! Explicit wiring for everything a session producer needs: resolved config,
//! the audit log and the optional mirror. Passed by reference instead of
//! living in process-wide globals.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commands::init::ensure_layout;
use crate::config::LabConfig;
use crate::error::LabResult;
use crate::services::audit::AuditLog;
use crate::services::mirror::{MirrorStore, SqliteMirror};
use crate::services::presence::PresenceRegistry;

#[derive(Clone)]
pub struct LabContext {
    root: PathBuf,
    pub config: LabConfig,
    pub audit: AuditLog,
    mirror: Option<Arc<dyn MirrorStore>>,
}

impl LabContext {
    /// Initialize `root` if needed, load its config and open the default mirror.
    ///
    /// A mirror that cannot be opened is logged and left out; sessions still run.
    pub fn open(root: &Path) -> Result<Self> {
        ensure_layout(root)?;
        let config = LabConfig::load(root)?;
        let mut ctx = Self::from_config(root, config);
        if ctx.config.logger.mirror_enabled {
            match SqliteMirror::open(&ctx.config.storage.mirror_path, ctx.config.presence.busy_timeout()) {
                Ok(m) => ctx.mirror = Some(Arc::new(m)),
                Err(e) => tracing::warn!(error = %e, "mirror unavailable; continuing without it"),
            }
        }
        Ok(ctx)
    }

    /// Context over an already-resolved config, without a mirror.
    pub fn from_config(root: &Path, config: LabConfig) -> Self {
        let audit = AuditLog::from_config(&config);
        Self {
            root: root.to_path_buf(),
            config,
            audit,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorStore>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.config.storage.sessions_dir
    }

    pub fn mirror(&self) -> Option<Arc<dyn MirrorStore>> {
        self.mirror.clone()
    }

    /// Fresh registry connection. Each thread should hold its own.
    pub fn open_registry(&self) -> LabResult<PresenceRegistry> {
        PresenceRegistry::open(
            &self.config.storage.registry_path,
            self.config.presence.busy_timeout(),
        )
    }
}

impl std::fmt::Debug for LabContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabContext")
            .field("root", &self.root)
            .field("mirror", &self.mirror.as_ref().map(|m| m.name().to_string()))
            .finish()
    }
}
