// src/services/page_timer.rs
//! Wall-clock time spent per page, accumulated across revisits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::error::LabResult;
use crate::services::identity::Session;
use crate::services::scoring::round_to;

/// Page that counts as the learning phase in derived metrics.
pub const LEARNING_PAGE: &str = "learning";

#[derive(Debug, Default)]
pub struct PageTimer {
    current: Option<(String, Instant)>,
    totals: BTreeMap<String, f64>,
}

impl PageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, page: &str) {
        self.start_at(page, Instant::now());
    }

    /// Switch to `page`, closing whatever page was open.
    pub fn start_at(&mut self, page: &str, now: Instant) {
        self.stop_at(now);
        self.current = Some((page.to_string(), now));
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    pub fn stop_at(&mut self, now: Instant) {
        if let Some((page, since)) = self.current.take() {
            let secs = now.saturating_duration_since(since).as_secs_f64();
            *self.totals.entry(page).or_insert(0.0) += secs;
        }
    }

    pub fn current_page(&self) -> Option<&str> {
        self.current.as_ref().map(|(p, _)| p.as_str())
    }

    /// Totals so far, rounded to 0.1 s. The open page is not included.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .map(|(k, v)| (k.clone(), round_to(*v, 1)))
            .collect()
    }

    /// Close the open page and write `meta/page_durations.json`.
    pub fn dump(&mut self, session: &Session) -> LabResult<PathBuf> {
        self.stop();
        let path = session.save_page_timings(&self.snapshot())?;
        tracing::debug!(session_id = %session.id(), pages = self.totals.len(), "page timings written");
        Ok(path)
    }
}
