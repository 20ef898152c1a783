use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RelayConfig;
use crate::handler::{ConnectionHandler, ConnectionId};

/// Listening socket plus the registry of live connection handlers.
///
/// A handler sits in the registry from accept until it is fully closed;
/// `close()` uses the registry to tear every live connection down at once.
pub struct Server {
    config: RelayConfig,
    listener: TcpListener,
    running: AtomicBool,
    shutdown: CancellationToken,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionHandler>>>,
}

impl Server {
    /// Bind the listener. A bind failure is fatal for the process: it
    /// propagates out of `main` with no retry.
    pub async fn bind(config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            config,
            listener,
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[allow(dead_code)]
    pub(crate) fn default_target(&self) -> &str {
        &self.config.default_target
    }

    /// Accept loop. Each accepted connection gets its own handler and task;
    /// a transient accept error is logged and the loop keeps going. Exits
    /// when `close()` fires the shutdown token.
    pub async fn run(self: Arc<Self>) {
        loop {
            let (stream, peer) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept error: {} (continuing)", e);
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let handler = Arc::new(ConnectionHandler::new(
                peer,
                self.config.default_target.clone(),
                Arc::clone(&self),
            ));

            // Registration can race close(); a refused handler is closed on
            // the spot so shutdown never leaks a connection.
            if !self.add_connection(Arc::clone(&handler)) {
                handler.close();
                continue;
            }
            tokio::spawn(handler.run(stream));
        }
    }

    /// Register a handler. Refuses (returns `false`) once the server has
    /// stopped running; the running check happens under the registry lock so
    /// a registration either lands before `close()` snapshots the set or
    /// not at all.
    fn add_connection(&self, handler: Arc<ConnectionHandler>) -> bool {
        let mut connections = self.connections.lock().unwrap();
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        connections.insert(handler.id(), handler);
        true
    }

    /// Evict a handler by identity. Called exactly once per handler, at the
    /// end of its `run()`.
    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        self.connections.lock().unwrap().remove(&id);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Stop accepting and close every live connection. The registry is
    /// snapshotted under the lock and the handlers are closed outside it,
    /// so socket teardown never blocks registry operations.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.cancel();

        let snapshot: Vec<Arc<ConnectionHandler>> = {
            let connections = self.connections.lock().unwrap();
            connections.values().cloned().collect()
        };
        for handler in snapshot {
            handler.close();
        }
    }
}
