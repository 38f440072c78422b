// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine.
//!
//! The main orchestrator that ties together:
//! - The listening socket for accepted peers
//! - One outbound connector per configured peer address (bounded backoff)
//! - All live peer sessions via [`crate::session`]
//! - The optional datagram channel via [`crate::udp`]
//!
//! # Architecture
//!
//! The engine owns every socket; the application context only ever touches
//! the map. All waits are readiness waits on the async runtime's multiplexer,
//! no task performs blocking I/O, and no lock is held across I/O. Sessions
//! refer back to the engine only through a [`SessionRegistry`] claim token,
//! never a back-pointer.
//!
//! # Lifecycle
//!
//! 1. `start()` validates config, binds the listener, and spawns the
//!    accept loop, connectors, and datagram task
//! 2. Sessions replicate until error or shutdown
//! 3. `shutdown()` signals every task, which half-close and drain, then
//!    joins them with a bounded timeout

mod types;

pub use types::EngineState;

use crate::config::{PeerAddress, ReplicatorConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::session::{run_session, Direction, SessionRegistry, SessionTuning};
use crate::store::{ReplicatedStore, SharedMap};
use crate::udp::run_datagram;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long `shutdown()` waits for each task to drain and exit.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The replication engine for one node.
///
/// Owns the listener, connectors, sessions, and the optional datagram loop.
/// The application keeps using the map directly; this engine only moves
/// entries between the map and the mesh.
pub struct Replicator<S: ReplicatedStore = SharedMap> {
    config: ReplicatorConfig,
    store: Arc<S>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    registry: Arc<SessionRegistry>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    listen_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

impl<S: ReplicatedStore> Replicator<S> {
    /// Create a new replicator over `store`.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to bind sockets and begin replicating.
    pub fn new(config: ReplicatorConfig, store: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            registry: Arc::new(SessionRegistry::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
            listen_addr: None,
            udp_addr: None,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The bound listener address, once started (useful with `listen_port: 0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// The bound datagram socket address, once started.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Identifiers of peers with an active session.
    pub fn active_peers(&self) -> Vec<u8> {
        self.registry.active_peers()
    }

    /// Start the replicator.
    ///
    /// 1. Validates the configuration
    /// 2. Binds the listener and datagram socket (if configured)
    /// 3. Spawns the accept loop, one connector per peer, and the datagram loop
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        if let Err(e) = self.config.validate() {
            let _ = self.state_tx.send(EngineState::Failed);
            metrics::set_engine_state("Failed");
            return Err(e);
        }

        info!(
            identifier = self.config.identifier,
            peer_count = self.config.peers.len(),
            udp = self.config.udp.is_some(),
            "Starting replicator"
        );
        let _ = self.state_tx.send(EngineState::Connecting);
        metrics::set_engine_state("Connecting");

        let tuning = SessionTuning::from_config(&self.config);

        if let Some(port) = self.config.listen_port {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = self.state_tx.send(EngineState::Failed);
                    metrics::set_engine_state("Failed");
                    return Err(ReplicationError::Config(format!(
                        "failed to bind listener on port {port}: {e}"
                    )));
                }
            };
            self.listen_addr = listener.local_addr().ok();
            info!(addr = ?self.listen_addr, "Listener bound");
            self.spawn_accept_loop(listener, tuning.clone()).await;
        }

        for peer in self.config.peers.clone() {
            self.spawn_connector(peer, tuning.clone()).await;
        }

        if let Some(udp) = self.config.udp.clone() {
            let socket = match UdpSocket::bind(("0.0.0.0", udp.port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    let _ = self.state_tx.send(EngineState::Failed);
                    metrics::set_engine_state("Failed");
                    return Err(ReplicationError::Config(format!(
                        "failed to bind datagram socket on port {}: {e}",
                        udp.port
                    )));
                }
            };
            socket.set_broadcast(true).ok();
            self.udp_addr = socket.local_addr().ok();
            info!(addr = ?self.udp_addr, broadcast = %udp.broadcast_address, "Datagram socket bound");

            let store = Arc::clone(&self.store);
            let shutdown_rx = self.shutdown_rx.clone();
            let tuning = tuning.clone();
            let handle = tokio::spawn(async move {
                run_datagram(socket, udp.broadcast_address, store, tuning, shutdown_rx).await;
            });
            self.tasks.lock().await.push(handle);
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Replicator running");
        Ok(())
    }

    /// Spawn the accept loop for inbound connections.
    async fn spawn_accept_loop(&self, listener: TcpListener, tuning: SessionTuning) {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let tasks = Arc::clone(&self.tasks);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            accept_loop(listener, store, registry, tuning, tasks, shutdown_rx).await;
        });
        debug!("Spawned accept loop");
        self.tasks.lock().await.push(handle);
    }

    /// Spawn an outbound connector for one peer address.
    async fn spawn_connector(&self, peer: PeerAddress, tuning: SessionTuning) {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let retry = self.config.retry.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            connector_loop(peer, store, registry, tuning, retry, shutdown_rx).await;
        });
        debug!("Spawned connector");
        self.tasks.lock().await.push(handle);
    }

    /// Shutdown the replicator gracefully. Idempotent.
    ///
    /// Shutdown sequence:
    /// 1. Signal every task to stop
    /// 2. Sessions half-close output and briefly drain input
    /// 3. Join all tasks with a bounded timeout
    ///
    /// The map remains usable afterwards; no further replication occurs.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replicator");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        metrics::set_active_sessions(0);
        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Replicator stopped");
    }

    /// The node identifier this engine replicates for.
    pub fn identifier(&self) -> u8 {
        self.config.identifier
    }
}

/// Accept inbound connections until shutdown.
async fn accept_loop<S: ReplicatedStore>(
    listener: TcpListener,
    store: Arc<S>,
    registry: Arc<SessionRegistry>,
    tuning: SessionTuning,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let store = Arc::clone(&store);
                    let registry = Arc::clone(&registry);
                    let tuning = tuning.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    let handle = tokio::spawn(async move {
                        // Accepted sessions that fail are simply forgotten;
                        // the dialing side owns the retry.
                        let _ = run_session(
                            stream,
                            Direction::Inbound,
                            store,
                            registry,
                            tuning,
                            shutdown_rx,
                        )
                        .await;
                    });
                    tasks.lock().await.push(handle);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Listener stopped");
}

/// Dial one peer address until shutdown, backing off on failure.
async fn connector_loop<S: ReplicatedStore>(
    peer: PeerAddress,
    store: Arc<S>,
    registry: Arc<SessionRegistry>,
    tuning: SessionTuning,
    retry: RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let addr = peer.to_string();
    let mut attempt: usize = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        attempt += 1;

        let dial = TcpStream::connect((peer.host.as_str(), peer.port));
        match timeout(retry.connection_timeout, dial).await {
            Ok(Ok(stream)) => {
                attempt = 0;
                metrics::record_connect(&addr, true);
                info!(%addr, "Connected to peer");

                let result = run_session(
                    stream,
                    Direction::Outbound,
                    Arc::clone(&store),
                    Arc::clone(&registry),
                    tuning.clone(),
                    shutdown_rx.clone(),
                )
                .await;
                if matches!(result, Err(ReplicationError::Shutdown)) {
                    break;
                }
                // Session closed; pause briefly before redialing.
                if !sleep_or_shutdown(retry.initial_delay, &mut shutdown_rx).await {
                    break;
                }
            }
            Ok(Err(e)) => {
                metrics::record_connect(&addr, false);
                let err = ReplicationError::ConnectFailed {
                    addr: addr.clone(),
                    message: e.to_string(),
                };
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    %addr,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Connect failed, backing off"
                );
                if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(_) => {
                metrics::record_connect(&addr, false);
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    %addr,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    timeout_ms = retry.connection_timeout.as_millis() as u64,
                    "Connect timed out, backing off"
                );
                if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
        }
    }
    info!(%addr, "Connector stopped");
}

/// Sleep for `delay` unless shutdown arrives first; returns `false` on
/// shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
    }
}
