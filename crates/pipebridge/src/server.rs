//! TCP accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::info;

use crate::access::WorkerAccess;
use crate::relay::{RelayError, RelayOptions, SessionId, SessionSummary, run_session};
use crate::worker::Worker;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 51202;

/// How accepted connections are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptMode {
    /// Serve one connection at a time; the next `accept()` happens only after
    /// the current client disconnected and its socket was closed.
    #[default]
    Sequential,
    /// Serve connections as tasks. Worker rounds are still serialized by the
    /// worker lease, so they never interleave.
    Concurrent,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub mode: AcceptMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            mode: AcceptMode::Sequential,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {addr:?}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("worker failed: {0}")]
    Relay(#[from] RelayError),
}

pub struct Server {
    listener: TcpListener,
    mode: AcceptMode,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let raw = format!("{}:{}", config.host, config.port);
        let addr: SocketAddr = raw
            .parse()
            .map_err(|source| ServerError::Address { addr: raw, source })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            mode: config.mode,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and relay connections until `shutdown` resolves or the worker
    /// fails. A worker failure is returned; client failures are not.
    pub async fn serve<W, F>(
        self,
        access: Arc<WorkerAccess<W>>,
        options: RelayOptions,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        W: Worker + 'static,
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, mode = ?self.mode, "Accepting connections");
        }

        match self.mode {
            AcceptMode::Sequential => self.serve_sequential(access, options, shutdown).await,
            AcceptMode::Concurrent => self.serve_concurrent(access, options, shutdown).await,
        }
    }

    async fn serve_sequential<W, F>(
        self,
        access: Arc<WorkerAccess<W>>,
        options: RelayOptions,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        W: Worker + 'static,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let id = SessionId::new();
            info!(session = %id, %peer, "Client connected");

            let result = tokio::select! {
                _ = &mut shutdown => {
                    info!(session = %id, "Shutdown during active session");
                    break;
                }
                result = handle_connection(stream, id, &access, &options) => result,
            };
            log_session_end(peer, result)?;
        }

        info!("Accept loop stopped");
        Ok(())
    }

    async fn serve_concurrent<W, F>(
        self,
        access: Arc<WorkerAccess<W>>,
        options: RelayOptions,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        W: Worker + 'static,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions: JoinSet<(SocketAddr, Result<SessionSummary, RelayError>)> =
            JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    match joined {
                        Ok((peer, result)) => {
                            if let Err(e) = log_session_end(peer, result) {
                                break Err(e);
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "Session task failed"),
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let id = SessionId::new();
                    info!(session = %id, %peer, active = sessions.len() + 1, "Client connected");

                    let access = Arc::clone(&access);
                    let options = options.clone();
                    sessions.spawn(async move {
                        let result = handle_connection(stream, id, &access, &options).await;
                        (peer, result)
                    });
                }
            }
        };

        if !sessions.is_empty() {
            info!(active = sessions.len(), "Dropping active sessions");
        }
        sessions.shutdown().await;
        info!("Accept loop stopped");
        outcome
    }
}

/// Relay one connection, then close it.
async fn handle_connection<W: Worker>(
    mut stream: TcpStream,
    id: SessionId,
    access: &WorkerAccess<W>,
    options: &RelayOptions,
) -> Result<SessionSummary, RelayError> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(session = %id, error = %e, "Failed to set TCP_NODELAY");
    }
    let result = run_session(&mut stream, access, options, id).await;
    drop(stream);
    result
}

fn log_session_end(
    peer: SocketAddr,
    result: Result<SessionSummary, RelayError>,
) -> Result<(), ServerError> {
    match result {
        Ok(summary) => {
            info!(
                session = %summary.id,
                %peer,
                requests = summary.requests,
                bytes_in = summary.bytes_from_client,
                bytes_out = summary.bytes_to_client,
                end = ?summary.end,
                "Client disconnected"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(%peer, error = %e, "Worker failed during session");
            Err(e.into())
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use super::*;
    use crate::framer::Marker;
    use crate::worker::testing::ScriptedWorker;

    type ServeHandle = tokio::task::JoinHandle<Result<(), ServerError>>;

    async fn start_server(
        worker: ScriptedWorker,
        mode: AcceptMode,
    ) -> (SocketAddr, oneshot::Sender<()>, ServeHandle) {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            mode,
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let access = Arc::new(WorkerAccess::new(worker));
        let options = RelayOptions::new(Marker::new("SimpleDB").unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve(access, options, async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    async fn round(client: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; request.len() + "SimpleDB".len()];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 51202);
        assert_eq!(config.mode, AcceptMode::Sequential);
    }

    #[tokio::test]
    async fn bind_rejects_bad_host() {
        let config = ServerConfig {
            host: "not an address".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(&config).await,
            Err(ServerError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn sequential_mode_does_not_serve_second_client_until_first_leaves() {
        let worker = ScriptedWorker::echo("SimpleDB");
        let received = worker.received();
        let (addr, stop, handle) = start_server(worker, AcceptMode::Sequential).await;

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round(&mut c1, b"A").await, b"ASimpleDB");

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(round(&mut c1, b"C").await, b"CSimpleDB");
        assert_eq!(
            *received.lock().unwrap(),
            vec![b"A".to_vec(), b"C".to_vec()]
        );

        drop(c1);
        let mut buf = [0u8; 9];
        c2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"BSimpleDB");
        assert_eq!(
            *received.lock().unwrap(),
            vec![b"A".to_vec(), b"C".to_vec(), b"B".to_vec()]
        );

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_mode_serves_clients_side_by_side() {
        let worker = ScriptedWorker::new(|req| {
            vec![
                Bytes::copy_from_slice(req),
                Bytes::from_static(b"Simple"),
                Bytes::from_static(b"DB"),
            ]
        });
        let (addr, stop, handle) = start_server(worker, AcceptMode::Concurrent).await;

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        let mut c2 = TcpStream::connect(addr).await.unwrap();

        assert_eq!(round(&mut c1, b"one").await, b"oneSimpleDB");
        assert_eq!(round(&mut c2, b"two").await, b"twoSimpleDB");
        assert_eq!(round(&mut c1, b"three").await, b"threeSimpleDB");

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_error_does_not_stop_accept_loop() {
        let (addr, stop, handle) =
            start_server(ScriptedWorker::echo("SimpleDB"), AcceptMode::Sequential).await;

        let c1 = TcpStream::connect(addr).await.unwrap();
        drop(c1);

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round(&mut c2, b"x").await, b"xSimpleDB");

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn worker_failure_stops_server() {
        let worker = ScriptedWorker::new(|_| Vec::new());
        let (addr, _stop, handle) = start_server(worker, AcceptMode::Sequential).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"SELECT 1;").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ServerError::Relay(_)));
    }

    #[tokio::test]
    async fn worker_failure_stops_concurrent_server() {
        let worker = ScriptedWorker::new(|_| Vec::new());
        let (addr, _stop, handle) = start_server(worker, AcceptMode::Concurrent).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"SELECT 1;").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ServerError::Relay(_)));
    }
}
