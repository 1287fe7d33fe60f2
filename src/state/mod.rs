//! State management module
//!
//! This module contains the lifecycle phase machine, the request server's
//! observable state, and the shared state handed to HTTP handlers.

pub mod app_state;
pub mod phase;
pub mod server_state;

// Re-export main types
pub use app_state::AppState;
pub use phase::Phase;
pub use server_state::ServerState;
