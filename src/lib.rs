//! Paste Server - lifecycle-managed backend for a paste and image host
//!
//! This library brings the service's collaborators up in dependency order,
//! runs the request server alongside a periodic orphaned-image reaper, and
//! shuts both down in order when a termination signal arrives.

pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod services;
pub mod state;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use api::create_router;
pub use config::{Config, Settings};
pub use error::{BringUpError, LifecycleError, ServeError};
pub use lifecycle::{Components, Lifecycle, RunExit, ShutdownReport};
pub use server::{DrainOutcome, RequestServer, ServerHandle, ServerMonitor};
pub use tasks::{reap_cycle, CycleReport, Reaper, ReaperStop};
pub use utils::signals::{ChannelSignals, OsSignals, Termination, TerminationSource};
