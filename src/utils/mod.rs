//! Utility functions module
//!
//! This module contains utility functions used throughout the application.

pub mod signals;

// Re-export main types
pub use signals::{ChannelSignals, OsSignals, SignalSender, Termination, TerminationSource};
