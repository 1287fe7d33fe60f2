//! Background tasks module
//!
//! This module contains background tasks that run alongside the HTTP server.

pub mod reaper;

// Re-export main types
pub use reaper::{reap_cycle, CycleReport, Reaper, ReaperStop};
