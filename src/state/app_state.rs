//! State shared with the HTTP handlers

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::Phase;
use crate::{services::PasteDb, tasks::CycleReport};

/// Read-only view of the service handed to every request handler.
///
/// Handlers never mutate lifecycle state; they only observe the phase and
/// the most recent reap cycle through watch channels.
#[derive(Debug, Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    pub db: Arc<PasteDb>,
    phase: watch::Receiver<Phase>,
    last_reap: watch::Receiver<Option<CycleReport>>,
}

impl AppState {
    pub fn new(
        db: Arc<PasteDb>,
        phase: watch::Receiver<Phase>,
        last_reap: watch::Receiver<Option<CycleReport>>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            started_at: Utc::now(),
            db,
            phase,
            last_reap,
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Summary of the last completed reap cycle, if any ran yet
    pub fn last_reap(&self) -> Option<CycleReport> {
        self.last_reap.borrow().clone()
    }

    /// Calculate server uptime as a formatted string
    pub fn get_uptime(&self) -> String {
        let duration = self.start_time.elapsed();
        let hours = duration.as_secs() / 3600;
        let minutes = (duration.as_secs() % 3600) / 60;
        let seconds = duration.as_secs() % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
