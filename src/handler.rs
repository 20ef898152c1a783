use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::header;
use crate::relay;
use crate::server::Server;

/// Literal response completing the disguised handshake.
pub const UPGRADE_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";

/// Case-sensitive header naming the real destination.
pub const DESTINATION_HEADER: &str = "X-Real-Host";

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique per-connection label used in logs and as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection failure taxonomy. Every variant is terminal for its
/// connection only; none of them propagate past `run()`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("preamble read failed: {0}")]
    Preamble(std::io::Error),

    #[error("client closed before sending a preamble")]
    EmptyPreamble,

    #[error("malformed destination {0:?}")]
    MalformedTarget(String),

    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        source: std::io::Error,
    },

    #[error("handshake write failed: {0}")]
    Handshake(std::io::Error),

    #[error("closed during setup")]
    Cancelled,
}

/// Owns one client connection through its whole lifecycle:
/// preamble read, destination dial, handshake response, relay, teardown.
///
/// Registered with the server on accept and deregistered exactly once when
/// both sockets are down. `close()` may race `run()` from any task.
pub struct ConnectionHandler {
    id: ConnectionId,
    peer: SocketAddr,
    default_target: String,
    server: Arc<Server>,
    cancel: CancellationToken,
    // One-shot guards so each socket is shut down at most once.
    client_closed: AtomicBool,
    target_closed: AtomicBool,
}

impl ConnectionHandler {
    pub fn new(peer: SocketAddr, default_target: String, server: Arc<Server>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            default_target,
            server,
            cancel: CancellationToken::new(),
            client_closed: AtomicBool::new(false),
            target_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Idempotently tear the connection down. Cancels the handler's token,
    /// which unblocks whatever `run()` is awaiting — the preamble read, the
    /// dial, or the relay — and lets the owning task close both sockets.
    /// Safe to call before the target exists and safe to call repeatedly.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Full per-connection lifecycle. Never returns an error to the caller;
    /// failures are logged with the connection id and kill only this
    /// connection.
    pub async fn run(self: Arc<Self>, client: TcpStream) {
        if let Err(e) = self.handle(client).await {
            match e {
                HandlerError::EmptyPreamble | HandlerError::Cancelled => {
                    info!("Connection #{} {}", self.id, e);
                }
                e => warn!("Connection #{} {}", self.id, e),
            }
        }
        self.close();
        self.server.remove_connection(self.id);
    }

    async fn handle(&self, mut client: TcpStream) -> Result<(), HandlerError> {
        let mut preamble = vec![0u8; relay::BUF_LEN];
        let n = tokio::select! {
            res = client.read(&mut preamble) => match res {
                Ok(n) => n,
                Err(e) => return self.abort_client(client, HandlerError::Preamble(e)).await,
            },
            _ = self.cancel.cancelled() => {
                return self.abort_client(client, HandlerError::Cancelled).await;
            }
        };
        if n == 0 {
            return self.abort_client(client, HandlerError::EmptyPreamble).await;
        }

        // Absent and empty both fall back to the configured default.
        let target = header::extract_header(&preamble[..n], DESTINATION_HEADER)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_target.clone());

        // A destination without a parseable port aborts here; it is never
        // dialed with an empty port.
        if header::split_host_port(&target).is_none() {
            return self
                .abort_client(client, HandlerError::MalformedTarget(target))
                .await;
        }

        info!("Connection #{} {} -> {}", self.id, self.peer, target);

        let target_stream = tokio::select! {
            res = TcpStream::connect(target.clone()) => match res {
                Ok(stream) => stream,
                // The 101 response is never written on a failed dial; the
                // client socket is closed instead of entering the relay.
                Err(source) => {
                    return self
                        .abort_client(client, HandlerError::Dial { target, source })
                        .await;
                }
            },
            _ = self.cancel.cancelled() => {
                return self.abort_client(client, HandlerError::Cancelled).await;
            }
        };

        if let Err(e) = client.write_all(UPGRADE_RESPONSE).await {
            return self.abort_client(client, HandlerError::Handshake(e)).await;
        }
        drop(preamble);

        let outcome = relay::pump(self.id, client, target_stream, self.cancel.clone()).await;
        self.shutdown_client(outcome.client_wr).await;
        self.shutdown_target(outcome.target_wr).await;

        info!(
            "Connection #{} done: {} bytes up, {} bytes down",
            self.id, outcome.from_client, outcome.from_target
        );
        Ok(())
    }

    /// Setup-phase failure: make sure the client socket goes down before
    /// reporting the error. No target exists yet on any of these paths.
    async fn abort_client(
        &self,
        mut client: TcpStream,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        if !self.client_closed.swap(true, Ordering::AcqRel) {
            let _ = client.shutdown().await;
        }
        Err(err)
    }

    async fn shutdown_client(&self, mut wr: OwnedWriteHalf) {
        if !self.client_closed.swap(true, Ordering::AcqRel) {
            let _ = wr.shutdown().await;
        }
    }

    async fn shutdown_target(&self, mut wr: OwnedWriteHalf) {
        if !self.target_closed.swap(true, Ordering::AcqRel) {
            let _ = wr.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn test_server(default_target: &str) -> Arc<Server> {
        let config = RelayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            default_target: default_target.to_string(),
        };
        Arc::new(Server::bind(config).await.unwrap())
    }

    async fn client_pair(server: &Arc<Server>) -> (TcpStream, Arc<ConnectionHandler>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (accepted, peer) = accepted.unwrap();
        let handler = Arc::new(ConnectionHandler::new(
            peer,
            server.default_target().to_string(),
            Arc::clone(server),
        ));
        (connected.unwrap(), handler, accepted)
    }

    #[tokio::test]
    async fn malformed_destination_closes_client_without_response() {
        let server = test_server("127.0.0.1:9").await;
        let (mut client, handler, accepted) = client_pair(&server).await;

        let task = tokio::spawn(Arc::clone(&handler).run(accepted));

        client
            .write_all(b"GET / HTTP/1.1\r\nX-Real-Host: no-port-here\r\n\r\n")
            .await
            .unwrap();

        // Closed without a single response byte.
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        task.await.unwrap();
        assert!(handler.is_closed());
    }

    #[tokio::test]
    async fn dial_failure_closes_client_without_response() {
        // Grab a port that is certainly closed by binding and dropping it.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let server = test_server(&dead_addr.to_string()).await;
        let (mut client, handler, accepted) = client_pair(&server).await;

        let task = tokio::spawn(Arc::clone(&handler).run(accepted));

        // No destination header: the (unreachable) default target is dialed.
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn client_eof_before_preamble_never_dials() {
        // A canary listener as default target: it must never see a
        // connection when the client hangs up before sending anything.
        let canary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let canary_addr = canary.local_addr().unwrap();

        let server = test_server(&canary_addr.to_string()).await;
        let (client, handler, accepted) = client_pair(&server).await;

        drop(client);
        let task = tokio::spawn(Arc::clone(&handler).run(accepted));
        task.await.unwrap();

        let dialed = timeout(Duration::from_millis(200), canary.accept()).await;
        assert!(dialed.is_err(), "EOF before the preamble must not dial");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = test_server("127.0.0.1:9").await;
        let (_client, handler, _accepted) = client_pair(&server).await;

        // Twice before the target exists, once after; never panics.
        handler.close();
        handler.close();
        assert!(handler.is_closed());
        handler.close();
    }

    #[tokio::test]
    async fn close_during_setup_unblocks_the_preamble_read() {
        let server = test_server("127.0.0.1:9").await;
        let (_client, handler, accepted) = client_pair(&server).await;

        let task = tokio::spawn(Arc::clone(&handler).run(accepted));
        handler.close();

        // The handler must exit even though the client never sent a byte.
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
