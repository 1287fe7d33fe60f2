//! Termination event sources for graceful shutdown

use std::{fmt, io};

use async_trait::async_trait;
use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use tokio::sync::mpsc;
use tracing::info;

/// Why the process is being asked to stop. Both kinds shut down identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupt => f.write_str("SIGINT"),
            Termination::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Something the lifecycle controller can block on until it should stop.
#[async_trait]
pub trait TerminationSource: Send {
    /// Wait for the next termination event. `None` means the source is gone.
    async fn recv(&mut self) -> Option<Termination>;
}

/// SIGINT and SIGTERM from the operating system.
pub struct OsSignals {
    signals: Signals,
    handle: Handle,
}

impl OsSignals {
    /// Register handlers for SIGTERM and SIGINT.
    pub fn new() -> io::Result<Self> {
        let signals = Signals::new([SIGTERM, SIGINT])?;
        let handle = signals.handle();
        Ok(Self { signals, handle })
    }
}

impl Drop for OsSignals {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[async_trait]
impl TerminationSource for OsSignals {
    async fn recv(&mut self) -> Option<Termination> {
        while let Some(signal) = self.signals.next().await {
            info!("Received signal: {}", signal);
            match signal {
                SIGINT => return Some(Termination::Interrupt),
                SIGTERM => return Some(Termination::Terminate),
                _ => continue,
            }
        }
        None
    }
}

/// Synthetic termination events, for embedding and tests.
pub struct ChannelSignals {
    rx: mpsc::UnboundedReceiver<Termination>,
}

/// Sending half of [`ChannelSignals`].
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Termination>,
}

impl ChannelSignals {
    pub fn new() -> (SignalSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalSender { tx }, Self { rx })
    }
}

impl SignalSender {
    /// Deliver an event. Returns false once the receiving side is gone.
    pub fn send(&self, termination: Termination) -> bool {
        self.tx.send(termination).is_ok()
    }
}

#[async_trait]
impl TerminationSource for ChannelSignals {
    async fn recv(&mut self) -> Option<Termination> {
        self.rx.recv().await
    }
}
