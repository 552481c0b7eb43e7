//! Connection relay - one client connection against the shared worker.
//!
//! Each round: read whatever the client sent, forward it to the worker
//! unmodified, then copy worker output back to the client until the marker
//! has gone past. The marker is forwarded like any other output byte.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::access::{AccessError, WorkerAccess};
use crate::framer::Marker;
use crate::worker::{DEFAULT_READ_BUFFER, Worker, WorkerError};

/// Identifies one client connection in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub marker: Marker,
    pub client_buffer_size: usize,
    /// How long a client may stay silent between requests.
    pub client_idle_timeout: Option<Duration>,
    /// How long the worker may take to finish one response.
    pub response_timeout: Option<Duration>,
    /// Mirror every relayed byte to stdout.
    pub echo: bool,
}

impl RelayOptions {
    pub fn new(marker: Marker) -> Self {
        Self {
            marker,
            client_buffer_size: DEFAULT_READ_BUFFER,
            client_idle_timeout: None,
            response_timeout: None,
            echo: false,
        }
    }

    pub fn with_client_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_idle_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

/// Why a session ended without a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    ClientError,
    ClientTimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub requests: u64,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
    pub end: SessionEnd,
}

/// Failures that leave the worker unusable. Fatal to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToWorker,
    FromWorker,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToWorker => "client->worker",
            Direction::FromWorker => "worker->client",
        }
    }
}

/// Diagnostic copy of relayed bytes. Has no effect on the protocol.
struct Mirror {
    session: SessionId,
    stdout: Option<tokio::io::Stdout>,
}

impl Mirror {
    fn new(session: SessionId, echo: bool) -> Self {
        Self {
            session,
            stdout: echo.then(tokio::io::stdout),
        }
    }

    async fn emit(&mut self, direction: Direction, bytes: &[u8]) {
        tracing::trace!(
            target: "pipebridge::wire",
            session = %self.session,
            direction = direction.as_str(),
            len = bytes.len(),
            data = %String::from_utf8_lossy(bytes),
            "Relayed bytes"
        );
        if let Some(stdout) = self.stdout.as_mut() {
            let result = async {
                stdout.write_all(bytes).await?;
                stdout.flush().await
            }
            .await;
            if let Err(e) = result {
                tracing::debug!(error = %e, "Echo to stdout failed, disabling");
                self.stdout = None;
            }
        }
    }
}

struct RoundOutcome {
    forwarded: u64,
    client_error: Option<io::Error>,
}

/// Relay requests from `client` until it disconnects.
///
/// Client-side problems end the session and are reported in the summary.
/// Worker-side problems poison `access` and are returned as errors.
pub async fn run_session<S, W>(
    client: &mut S,
    access: &WorkerAccess<W>,
    options: &RelayOptions,
    id: SessionId,
) -> Result<SessionSummary, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    W: Worker,
{
    let mut mirror = Mirror::new(id, options.echo);
    let mut buf = vec![0u8; options.client_buffer_size.max(1)];
    let mut summary = SessionSummary {
        id,
        requests: 0,
        bytes_from_client: 0,
        bytes_to_client: 0,
        end: SessionEnd::ClientClosed,
    };

    loop {
        let read = match options.client_idle_timeout {
            Some(limit) => tokio::time::timeout(limit, client.read(&mut buf))
                .await
                .ok(),
            None => Some(client.read(&mut buf).await),
        };

        let n = match read {
            None => {
                tracing::debug!(session = %id, "Client idle timeout");
                summary.end = SessionEnd::ClientTimedOut;
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session = %id, error = %e, "Client read failed");
                summary.end = SessionEnd::ClientError;
                break;
            }
            Some(Ok(0)) => {
                summary.end = SessionEnd::ClientClosed;
                break;
            }
            Some(Ok(n)) => n,
        };

        let request = &buf[..n];
        summary.requests += 1;
        summary.bytes_from_client += n as u64;
        tracing::debug!(session = %id, bytes = n, "Request received");
        mirror.emit(Direction::ToWorker, request).await;

        let outcome = relay_round(client, access, request, options, &mut mirror).await?;
        summary.bytes_to_client += outcome.forwarded;

        if let Some(e) = outcome.client_error {
            tracing::warn!(session = %id, error = %e, "Client write failed, response drained");
            summary.end = SessionEnd::ClientError;
            break;
        }
        tracing::debug!(session = %id, bytes = outcome.forwarded, "Response complete");
    }

    Ok(summary)
}

async fn relay_round<S, W>(
    client: &mut S,
    access: &WorkerAccess<W>,
    request: &[u8],
    options: &RelayOptions,
    mirror: &mut Mirror,
) -> Result<RoundOutcome, RelayError>
where
    S: AsyncWrite + Unpin + Send,
    W: Worker,
{
    let mut lease = access.acquire().await?;
    lease.write(request).await?;

    let drain = async {
        let mut framer = options.marker.framer();
        let mut outcome = RoundOutcome {
            forwarded: 0,
            client_error: None,
        };

        loop {
            let chunk = lease.read_chunk().await?;
            mirror.emit(Direction::FromWorker, &chunk).await;

            // Keep reading after a client failure so the next round starts
            // at a response boundary.
            if outcome.client_error.is_none() {
                match client.write_all(&chunk).await {
                    Ok(()) => outcome.forwarded += chunk.len() as u64,
                    Err(e) => outcome.client_error = Some(e),
                }
            }

            if framer.observe(&chunk) {
                break;
            }
        }

        if outcome.client_error.is_none()
            && let Err(e) = client.flush().await
        {
            outcome.client_error = Some(e);
        }
        Ok::<_, WorkerError>(outcome)
    };

    let finished = match options.response_timeout {
        Some(limit) => tokio::time::timeout(limit, drain).await.ok(),
        None => Some(drain.await),
    };

    match finished {
        Some(result) => Ok(result?),
        None => {
            let limit = options.response_timeout.unwrap_or_default();
            let err = WorkerError::ResponseTimeout(limit);
            lease.poison(&err);
            Err(err.into())
        }
    }
}
