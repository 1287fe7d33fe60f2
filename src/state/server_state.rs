//! Observable state of the request server

use serde::Serialize;

/// Externally visible states of the request server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    NotStarted,
    Serving,
    Draining,
    Stopped,
}
