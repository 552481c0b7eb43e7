//! Byte-stream access to the backend worker.
//!
//! The bridge only ever writes to the worker's stdin and reads from its
//! stdout. [`Worker`] is that capability and nothing more, so tests can swap
//! the subprocess for a scripted double.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};

/// Default size of a single `read_chunk`.
pub const DEFAULT_READ_BUFFER: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to write to worker: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read from worker: {0}")]
    Read(#[source] std::io::Error),
    #[error("worker closed its output stream")]
    Exited,
    #[error("worker input is closed")]
    InputClosed,
    #[error("worker produced no complete response within {0:?}")]
    ResponseTimeout(Duration),
}

/// Whether the worker process is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited,
}

#[async_trait]
pub trait Worker: Send {
    /// Append bytes to the worker's input stream.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), WorkerError>;

    /// Block until some output is available and return it. Never returns an
    /// empty chunk: end of stream is [`WorkerError::Exited`].
    async fn read_chunk(&mut self) -> Result<Bytes, WorkerError>;

    fn liveness(&mut self) -> Liveness;

    fn is_alive(&mut self) -> bool {
        self.liveness() == Liveness::Running
    }
}

/// A worker reached through an arbitrary reader/writer pair.
pub struct PipeWorker<R, W> {
    output: R,
    input: Option<W>,
    buffer_size: usize,
    exited: bool,
}

impl<R, W> PipeWorker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(output: R, input: W) -> Self {
        Self {
            output,
            input: Some(input),
            buffer_size: DEFAULT_READ_BUFFER,
            exited: false,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Drop the input side so the worker sees end of input.
    pub async fn close_input(&mut self) {
        if let Some(mut input) = self.input.take() {
            let _ = input.shutdown().await;
        }
    }
}

#[async_trait]
impl<R, W> Worker for PipeWorker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
        let input = self.input.as_mut().ok_or(WorkerError::InputClosed)?;
        input.write_all(bytes).await.map_err(WorkerError::Write)?;
        input.flush().await.map_err(WorkerError::Write)
    }

    async fn read_chunk(&mut self) -> Result<Bytes, WorkerError> {
        if self.exited {
            return Err(WorkerError::Exited);
        }
        let mut buf = BytesMut::zeroed(self.buffer_size);
        let n = self.output.read(&mut buf).await.map_err(WorkerError::Read)?;
        if n == 0 {
            self.exited = true;
            return Err(WorkerError::Exited);
        }
        buf.truncate(n);
        Ok(buf.freeze())
    }

    fn liveness(&mut self) -> Liveness {
        if self.exited {
            Liveness::Exited
        } else {
            Liveness::Running
        }
    }
}

/// The spawned worker subprocess and its stdio pipes.
pub struct ProcessWorker {
    pipes: PipeWorker<ChildStdout, ChildStdin>,
    child: Child,
}

impl ProcessWorker {
    pub fn new(child: Child, stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self {
            pipes: PipeWorker::new(stdout, stdin),
            child,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.pipes = self.pipes.with_buffer_size(size);
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub(crate) async fn close_input(&mut self) {
        self.pipes.close_input().await;
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
        self.pipes.write(bytes).await
    }

    async fn read_chunk(&mut self) -> Result<Bytes, WorkerError> {
        self.pipes.read_chunk().await
    }

    fn liveness(&mut self) -> Liveness {
        match self.child.try_wait() {
            Ok(None) => Liveness::Running,
            Ok(Some(status)) => {
                tracing::debug!(%status, "Worker process has exited");
                Liveness::Exited
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll worker status");
                Liveness::Exited
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted worker double.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    type Reply = Box<dyn Fn(&[u8]) -> Vec<Bytes> + Send>;

    /// Records every write and answers each with chunks produced by `reply`.
    pub struct ScriptedWorker {
        pub received: Arc<Mutex<Vec<Vec<u8>>>>,
        pending: VecDeque<Bytes>,
        reply: Reply,
        alive: bool,
    }

    impl ScriptedWorker {
        pub fn new(reply: impl Fn(&[u8]) -> Vec<Bytes> + Send + 'static) -> Self {
            Self {
                received: Arc::new(Mutex::new(Vec::new())),
                pending: VecDeque::new(),
                reply: Box::new(reply),
                alive: true,
            }
        }

        /// Answers every request with `<request>` followed by `marker`.
        pub fn echo(marker: &'static str) -> Self {
            Self::new(move |req| {
                vec![
                    Bytes::copy_from_slice(req),
                    Bytes::from_static(marker.as_bytes()),
                ]
            })
        }

        /// Output queued before any request, e.g. a startup banner.
        pub fn with_startup(mut self, chunks: &[&'static str]) -> Self {
            self.pending
                .extend(chunks.iter().map(|c| Bytes::from_static(c.as_bytes())));
            self
        }

        pub fn received(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
            Arc::clone(&self.received)
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        async fn write(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
            if !self.alive {
                return Err(WorkerError::InputClosed);
            }
            self.received.lock().unwrap().push(bytes.to_vec());
            let chunks = (self.reply)(bytes);
            self.pending.extend(chunks);
            Ok(())
        }

        async fn read_chunk(&mut self) -> Result<Bytes, WorkerError> {
            match self.pending.pop_front() {
                Some(chunk) => Ok(chunk),
                None => {
                    self.alive = false;
                    Err(WorkerError::Exited)
                }
            }
        }

        fn liveness(&mut self) -> Liveness {
            if self.alive {
                Liveness::Running
            } else {
                Liveness::Exited
            }
        }
    }
}
