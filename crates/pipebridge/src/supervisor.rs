//! Worker supervisor - launches the worker and waits for it to be ready.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout piped
//! 2. Read output until the readiness marker appears
//! 3. Hand the ready worker to the composition root
//!
//! The worker is started once and never restarted.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::framer::Marker;
use crate::worker::{DEFAULT_READ_BUFFER, ProcessWorker, Worker, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch worker {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: SpawnError,
    },
    #[error("worker never became ready: {0}")]
    Startup(#[source] WorkerError),
    #[error("worker not ready after {0:?}")]
    ReadyTimeout(Duration),
}

/// Extension point for different ways of launching the worker.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError>;
}

/// Runs `program args...` directly with stdin/stdout piped and stderr inherited.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        Ok(command.spawn()?)
    }
}

pub struct WorkerConfig {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<std::path::PathBuf>,
    pub marker: Marker,
    pub ready_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl WorkerConfig {
    pub fn new(program: impl Into<OsString>, marker: Marker) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            marker,
            ready_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Launch the worker and block until it reports ready.
pub async fn start(config: &WorkerConfig) -> Result<ProcessWorker, SupervisorError> {
    tracing::info!(
        program = %config.program_display(),
        args = ?config.args,
        "Spawning worker subprocess"
    );

    let spawn_err = |source: SpawnError| SupervisorError::Spawn {
        program: config.program_display(),
        source,
    };

    let mut child = config.spawner.spawn(config).map_err(spawn_err)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_err(SpawnError::Other("stdin not captured".to_string())))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_err(SpawnError::Other("stdout not captured".to_string())))?;

    let mut worker =
        ProcessWorker::new(child, stdout, stdin).with_buffer_size(config.read_buffer_size);
    tracing::debug!(pid = ?worker.id(), marker = %config.marker, "Waiting for worker readiness");

    wait_ready(&mut worker, &config.marker, config.ready_timeout).await?;

    tracing::info!(pid = ?worker.id(), "Worker ready");
    Ok(worker)
}

/// Read worker output until `marker` has been observed.
///
/// Startup output is logged line by line and otherwise discarded. With no
/// timeout this waits for as long as the worker stays silent.
pub async fn wait_ready<W: Worker + ?Sized>(
    worker: &mut W,
    marker: &Marker,
    timeout: Option<Duration>,
) -> Result<(), SupervisorError> {
    let wait = async {
        let mut framer = marker.framer();
        loop {
            let chunk = worker.read_chunk().await.map_err(SupervisorError::Startup)?;
            for line in String::from_utf8_lossy(&chunk).lines() {
                tracing::info!(target: "pipebridge::setup", "{}", line);
            }
            if framer.observe(&chunk) {
                return Ok(());
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| SupervisorError::ReadyTimeout(limit))?,
        None => wait.await,
    }
}

/// Stop the worker: close its input, ask it to terminate, then kill it if it
/// is still running after `grace`.
pub async fn shutdown(mut worker: ProcessWorker, grace: Duration) {
    worker.close_input().await;

    #[cfg(unix)]
    if let Some(pid) = worker.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM to worker");
        }
    }

    let child = worker.child_mut();
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%status, "Worker exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
        Err(_) => {
            tracing::warn!(?grace, "Worker did not exit in time, killing");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "Failed to kill worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::ScriptedWorker;

    fn simpledb() -> Marker {
        Marker::new("SimpleDB").unwrap()
    }

    #[tokio::test]
    async fn not_ready_until_marker_chunk() {
        let mut worker = ScriptedWorker::echo("SimpleDB> ")
            .with_startup(&["starting up\n", "SimpleDB ready\n"]);

        wait_ready(&mut worker, &simpledb(), None).await.unwrap();

        // Both startup chunks were consumed, nothing is left over.
        assert!(matches!(
            worker.read_chunk().await,
            Err(WorkerError::Exited)
        ));
    }

    #[tokio::test]
    async fn first_chunk_alone_is_not_ready() {
        let mut worker = ScriptedWorker::echo("SimpleDB> ").with_startup(&["starting up\n"]);

        let err = wait_ready(&mut worker, &simpledb(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Startup(WorkerError::Exited)));
    }

    #[tokio::test]
    async fn marker_split_across_startup_chunks() {
        let mut worker = ScriptedWorker::echo("SimpleDB> ").with_startup(&["loading\nSimp", "leDB> "]);
        wait_ready(&mut worker, &simpledb(), None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_fires_for_silent_worker() {
        let (bridge_in, _worker_stdin) = tokio::io::duplex(64);
        let (_worker_stdout, bridge_out) = tokio::io::duplex(64);
        let mut worker = crate::worker::PipeWorker::new(bridge_out, bridge_in);

        let err = wait_ready(&mut worker, &simpledb(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadyTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn start_fails_for_missing_executable() {
        let config = WorkerConfig::new("/nonexistent/pipebridge-worker", simpledb());
        let Err(err) = start(&config).await else {
            panic!("spawning a missing executable succeeded");
        };
        assert!(matches!(
            err,
            SupervisorError::Spawn {
                source: SpawnError::Spawn(_),
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_shutdown_shell_worker() {
        let config = WorkerConfig::new("sh", simpledb())
            .with_args(["-c", "echo booting; echo 'SimpleDB> '; cat"])
            .with_ready_timeout(Some(Duration::from_secs(10)));

        let mut worker = start(&config).await.unwrap();
        assert!(worker.is_alive());

        worker.write(b"ping\n").await.unwrap();
        let chunk = worker.read_chunk().await.unwrap();
        assert_eq!(&chunk[..], b"ping\n");

        shutdown(worker, Duration::from_secs(5)).await;
    }
}
