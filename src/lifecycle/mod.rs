//! Lifecycle controller
//!
//! # Flow
//! ```text
//! initialize:  limits → storage → database descriptor → upload dir → database → router
//! run:         start reaper → start request server → wait for termination
//! shutdown:    cancel token → stop reaper → drain request server
//! ```
//!
//! Phases only move forward (see [`Phase`]). The reaper is always fully
//! stopped before the server starts draining, so no reap work begins while
//! the last requests are still in flight.

pub mod startup;

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Settings,
    error::{LifecycleError, ServeError},
    server::{DrainOutcome, ServerHandle, ServerMonitor},
    state::Phase,
    tasks::{Reaper, ReaperStop},
    utils::{Termination, TerminationSource},
};

pub use startup::{bring_up, Components};

/// Why [`Lifecycle::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// A termination signal arrived.
    Signal(Termination),
    /// The termination source closed; treated like a signal.
    SourceClosed,
    /// The request server stopped on a transport error.
    ServerFailed,
}

/// What happened during [`Lifecycle::shutdown`].
#[derive(Debug)]
pub struct ShutdownReport {
    pub reaper: ReaperStop,
    pub drain: DrainOutcome,
    /// Transport error that ended the run, if that is why we shut down.
    pub server_error: Option<ServeError>,
}

impl ShutdownReport {
    /// True when the process should exit with status zero.
    pub fn is_success(&self) -> bool {
        self.server_error.is_none()
    }

    /// Process exit status. A forced drain still counts as a clean exit;
    /// only a transport failure of the request server is fatal.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

struct Running {
    reaper: Reaper,
    server: ServerHandle,
    drain_timeout: Duration,
    reaper_stop_timeout: Option<Duration>,
}

/// Brings the service up, runs it until told to stop, and tears it down.
///
/// Owns the process-wide cancellation token. Subsystems only ever get child
/// tokens, so nothing but the controller can cancel it, and once cancelled
/// it stays cancelled.
pub struct Lifecycle {
    phase_tx: watch::Sender<Phase>,
    token: CancellationToken,
    components: Option<Components>,
    running: Option<Running>,
    server_error: Option<ServeError>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Uninitialized);
        Self {
            phase_tx,
            token: CancellationToken::new(),
            components: None,
            running: None,
            server_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Observe the request server, once components exist.
    pub fn server_monitor(&self) -> Option<ServerMonitor> {
        match (&self.components, &self.running) {
            (Some(components), _) => Some(components.server.monitor()),
            (None, Some(running)) => Some(running.server.monitor()),
            (None, None) => None,
        }
    }

    fn advance(&self, operation: &'static str, next: Phase) -> Result<(), LifecycleError> {
        let phase = self.phase();
        if !phase.can_advance_to(next) {
            return Err(LifecycleError::InvalidPhase { operation, phase });
        }
        self.phase_tx.send_replace(next);
        info!(from = %phase, to = %next, "Lifecycle phase changed");
        Ok(())
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), LifecycleError> {
        let phase = self.phase();
        if phase != expected {
            return Err(LifecycleError::InvalidPhase { operation, phase });
        }
        Ok(())
    }

    /// Bring up every collaborator from `settings`. Callable once.
    ///
    /// On failure the controller moves straight to [`Phase::Stopped`].
    pub async fn initialize(&mut self, settings: &Settings) -> Result<(), LifecycleError> {
        self.advance("initialize", Phase::Initializing)?;
        info!("Initializing service");

        match bring_up(settings, self.phase_tx.subscribe()).await {
            Ok(components) => {
                self.components = Some(components);
                Ok(())
            }
            Err(e) => {
                error!("Bring-up failed: {}", e);
                self.advance("initialize", Phase::Stopped)?;
                Err(e.into())
            }
        }
    }

    /// Initialize with components that were assembled elsewhere.
    pub fn initialize_with(&mut self, components: Components) -> Result<(), LifecycleError> {
        self.advance("initialize", Phase::Initializing)?;
        self.components = Some(components);
        Ok(())
    }

    /// Start the reaper, then the request server, then wait.
    ///
    /// Returns on the first termination event or when the server fails on
    /// its own. Further events are left unread.
    pub async fn run(&mut self, signals: &mut dyn TerminationSource) -> Result<RunExit, LifecycleError> {
        self.expect_phase("run", Phase::Initializing)?;
        let Some(components) = self.components.take() else {
            return Err(LifecycleError::InvalidPhase {
                operation: "run",
                phase: self.phase(),
            });
        };
        let Components {
            mut reaper,
            server,
            reap_interval,
            drain_timeout,
            reaper_stop_timeout,
        } = components;

        if let Err(e) = reaper.start(reap_interval, self.token.child_token()) {
            error!("Failed to start image reaper: {}", e);
            self.advance("run", Phase::Stopped)?;
            return Err(e.into());
        }

        let server = server.serve();
        self.advance("run", Phase::Running)?;

        let running = self.running.insert(Running {
            reaper,
            server,
            drain_timeout,
            reaper_stop_timeout,
        });

        let outcome = tokio::select! {
            event = signals.recv() => Ok(event),
            err = running.server.failed() => Err(err),
        };

        let exit = match outcome {
            Ok(Some(termination)) => {
                info!("Received {}, shutting down", termination);
                RunExit::Signal(termination)
            }
            Ok(None) => {
                warn!("Termination source closed, shutting down");
                RunExit::SourceClosed
            }
            Err(e) => {
                error!("Request server failed, shutting down: {}", e);
                self.server_error = Some(e);
                RunExit::ServerFailed
            }
        };
        Ok(exit)
    }

    /// Cancel, stop the reaper, then drain the request server. Runs once.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, LifecycleError> {
        self.advance("shutdown", Phase::ShuttingDown)?;
        let Some(mut running) = self.running.take() else {
            self.advance("shutdown", Phase::Stopped)?;
            return Ok(ShutdownReport {
                reaper: ReaperStop::Idle,
                drain: DrainOutcome::Clean,
                server_error: self.server_error.take(),
            });
        };

        self.token.cancel();

        let reaper = match running.reaper_stop_timeout {
            Some(timeout) => running.reaper.stop_within(timeout).await,
            None => running.reaper.stop().await,
        };

        let drain = running.server.shutdown(running.drain_timeout).await;
        if drain == DrainOutcome::Forced {
            warn!("Shutdown deadline exceeded, connections were force-closed");
        }

        self.advance("shutdown", Phase::Stopped)?;
        info!("Shutdown complete");

        Ok(ShutdownReport {
            reaper,
            drain,
            server_error: self.server_error.take(),
        })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
