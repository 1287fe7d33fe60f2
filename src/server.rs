//! Request server with graceful drain
//!
//! Connections are served by hyper-util's auto (HTTP/1 + HTTP/2) builder,
//! each on its own task in a [`TaskTracker`]. Draining stops the accept
//! loop, asks every connection to finish its in-flight requests, and waits
//! for the tracker to empty. Past the deadline, connections are dropped.

use std::{io, net::SocketAddr, time::Duration};

use axum::Router;
use hyper::{body::Incoming, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::{error::ServeError, state::ServerState};

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainOutcome {
    /// Every in-flight request finished before the deadline.
    Clean,
    /// The deadline passed and remaining connections were closed.
    Forced,
}

/// Read-only view of a request server's state and bound address.
#[derive(Debug, Clone)]
pub struct ServerMonitor {
    state: watch::Receiver<ServerState>,
    local_addr: watch::Receiver<Option<SocketAddr>>,
}

impl ServerMonitor {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Address the listener is bound to, once bound. `None` if binding failed.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != ServerState::NotStarted).await;
        *self.local_addr.borrow()
    }
}

/// A bind address plus the handler graph to serve on it.
pub struct RequestServer {
    addr: String,
    router: Router,
    state_tx: watch::Sender<ServerState>,
    addr_tx: watch::Sender<Option<SocketAddr>>,
    monitor: ServerMonitor,
}

impl RequestServer {
    pub fn new(addr: impl Into<String>, router: Router) -> Self {
        let (state_tx, state_rx) = watch::channel(ServerState::NotStarted);
        let (addr_tx, addr_rx) = watch::channel(None);
        Self {
            addr: addr.into(),
            router,
            state_tx,
            addr_tx,
            monitor: ServerMonitor {
                state: state_rx,
                local_addr: addr_rx,
            },
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Observe this server before and after it starts.
    pub fn monitor(&self) -> ServerMonitor {
        self.monitor.clone()
    }

    /// Start serving on a separate task and return immediately.
    ///
    /// Binding happens on that task; a bind failure is reported through
    /// [`ServerHandle::failed`] like any other transport error.
    pub fn serve(self) -> ServerHandle {
        let (failure_tx, failure_rx) = oneshot::channel();
        let drain = CancellationToken::new();
        let force = CancellationToken::new();

        let task = tokio::spawn(serve_loop(
            self.addr,
            self.router,
            LoopControl {
                state_tx: self.state_tx,
                addr_tx: self.addr_tx,
                failure_tx,
                drain: drain.clone(),
                force: force.clone(),
            },
        ));

        ServerHandle {
            monitor: self.monitor,
            failure: Some(failure_rx),
            drain,
            force,
            task: Some(task),
        }
    }
}

/// Control side of a running request server.
pub struct ServerHandle {
    monitor: ServerMonitor,
    failure: Option<oneshot::Receiver<ServeError>>,
    drain: CancellationToken,
    force: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> ServerMonitor {
        self.monitor.clone()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.monitor.local_addr().await
    }

    /// Resolves only if the server stops on its own because of a transport
    /// error. Cancel safe.
    pub async fn failed(&mut self) -> ServeError {
        if let Some(rx) = self.failure.as_mut() {
            let received = rx.await;
            self.failure = None;
            if let Ok(err) = received {
                return err;
            }
        }
        std::future::pending().await
    }

    /// Stop accepting, let in-flight requests finish for up to `deadline`,
    /// then close whatever is left.
    pub async fn shutdown(&mut self, deadline: Duration) -> DrainOutcome {
        let Some(mut task) = self.task.take() else {
            return DrainOutcome::Clean;
        };

        info!(deadline_secs = deadline.as_secs_f64(), "Draining request server");
        self.drain.cancel();

        match time::timeout(deadline, &mut task).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    error!("Request server task failed: {}", e);
                }
                info!("Request server drained");
                DrainOutcome::Clean
            }
            Err(_) => {
                warn!(
                    deadline_secs = deadline.as_secs_f64(),
                    "Drain deadline exceeded, closing remaining connections"
                );
                self.force.cancel();
                if let Err(e) = task.await {
                    error!("Request server task failed: {}", e);
                }
                DrainOutcome::Forced
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.drain.cancel();
        self.force.cancel();
    }
}

struct LoopControl {
    state_tx: watch::Sender<ServerState>,
    addr_tx: watch::Sender<Option<SocketAddr>>,
    failure_tx: oneshot::Sender<ServeError>,
    drain: CancellationToken,
    force: CancellationToken,
}

async fn serve_loop(addr: String, router: Router, control: LoopControl) {
    let LoopControl {
        state_tx,
        addr_tx,
        failure_tx,
        drain,
        force,
    } = control;

    let listener = match bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            state_tx.send_replace(ServerState::Stopped);
            let _ = failure_tx.send(e);
            return;
        }
    };

    if let Ok(local) = listener.local_addr() {
        addr_tx.send_replace(Some(local));
        info!(address = %local, "Request server listening");
    }
    state_tx.send_replace(ServerState::Serving);

    let tracker = TaskTracker::new();
    let failure = loop {
        tokio::select! {
            _ = drain.cancelled() => break None,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        drain.clone(),
                        force.clone(),
                    ));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!("Ignoring failed accept: {}", e);
                }
                Err(e) => break Some(ServeError::Accept(e)),
            }
        }
    };
    drop(listener);

    if let Some(e) = failure {
        error!("Request server failed: {}", e);
        let _ = failure_tx.send(e);
        drain.cancel();
    }

    state_tx.send_replace(ServerState::Draining);
    tracker.close();
    debug!(connections = tracker.len(), "Waiting for open connections");
    tracker.wait().await;

    state_tx.send_replace(ServerState::Stopped);
    info!("Request server stopped");
}

async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    let parsed: SocketAddr = addr.parse().map_err(|e: std::net::AddrParseError| ServeError::Address {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    TcpListener::bind(parsed).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    drain: CancellationToken,
    force: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        router.clone().call(request)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, "Connection closed with error: {}", e);
                }
                break;
            }
            _ = drain.cancelled(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            _ = force.cancelled() => {
                debug!(peer = %peer, "Force-closing connection");
                break;
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_path(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_then_drains_cleanly() {
        let router = Router::new().route("/", get(|| async { "hello" }));
        let mut handle = RequestServer::new("127.0.0.1:0", router).serve();
        let addr = handle.local_addr().await.unwrap();
        assert_eq!(handle.state(), ServerState::Serving);

        let response = get_path(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        let outcome = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, DrainOutcome::Clean);
        assert_eq!(handle.state(), ServerState::Stopped);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn in_flight_request_completes_during_drain() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                time::sleep(Duration::from_millis(300)).await;
                "done"
            }),
        );
        let mut handle = RequestServer::new("127.0.0.1:0", router).serve();
        let addr = handle.local_addr().await.unwrap();

        let request = tokio::spawn(get_path(addr, "/slow"));
        time::sleep(Duration::from_millis(50)).await;

        let outcome = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, DrainOutcome::Clean);
        let response = request.await.unwrap();
        assert!(response.ends_with("done"));
    }

    #[tokio::test]
    async fn drain_past_deadline_is_forced() {
        let router = Router::new().route(
            "/stuck",
            get(|| async {
                std::future::pending::<()>().await;
                "never"
            }),
        );
        let mut handle = RequestServer::new("127.0.0.1:0", router).serve();
        let addr = handle.local_addr().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let outcome = handle.shutdown(Duration::from_millis(200)).await;
        assert_eq!(outcome, DrainOutcome::Forced);
        assert_eq!(handle.state(), ServerState::Stopped);

        let mut buf = Vec::new();
        let read = stream.read_to_end(&mut buf).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let mut handle = RequestServer::new(addr.to_string(), Router::new()).serve();
        let err = handle.failed().await;
        assert!(matches!(err, ServeError::Bind { .. }));
        assert!(handle.local_addr().await.is_none());
        assert_eq!(handle.shutdown(Duration::from_secs(1)).await, DrainOutcome::Clean);
    }

    #[tokio::test]
    async fn invalid_address_is_reported() {
        let mut handle = RequestServer::new("nowhere", Router::new()).serve();
        assert!(matches!(handle.failed().await, ServeError::Address { .. }));
    }
}
