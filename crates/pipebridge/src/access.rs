//! Exclusive access to the shared worker.
//!
//! The worker has one stdin and one stdout and no notion of concurrent
//! clients, so exactly one relay round may talk to it at a time. A
//! [`WorkerLease`] is that right. Any worker I/O failure through a lease
//! poisons the access permanently: the stream is no longer aligned with
//! request boundaries and the worker is never restarted.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};

use crate::worker::{Liveness, Worker, WorkerError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("worker is unusable: {0}")]
    Poisoned(String),
}

pub struct WorkerAccess<W> {
    worker: Mutex<W>,
    poisoned: AtomicBool,
    reason: StdMutex<Option<String>>,
}

impl<W: Worker> WorkerAccess<W> {
    pub fn new(worker: W) -> Self {
        Self {
            worker: Mutex::new(worker),
            poisoned: AtomicBool::new(false),
            reason: StdMutex::new(None),
        }
    }

    /// Wait for exclusive use of the worker.
    pub async fn acquire(&self) -> Result<WorkerLease<'_, W>, AccessError> {
        self.check()?;
        let guard = match self.worker.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Worker busy, waiting for lease");
                self.worker.lock().await
            }
        };
        // Poisoned while we were queued.
        self.check()?;
        Ok(WorkerLease {
            worker: guard,
            access: self,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark the worker unusable. The first reason wins.
    pub fn poison(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Ok(mut slot) = self.reason.lock()
            && slot.is_none()
        {
            tracing::error!(%reason, "Worker poisoned");
            *slot = Some(reason);
        }
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn poison_reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Take the worker back, e.g. to shut it down.
    pub fn into_inner(self) -> W {
        self.worker.into_inner()
    }

    fn check(&self) -> Result<(), AccessError> {
        if self.is_poisoned() {
            return Err(AccessError::Poisoned(
                self.poison_reason()
                    .unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        Ok(())
    }
}

/// Exclusive use of the worker for one round. Released on drop.
pub struct WorkerLease<'a, W> {
    worker: MutexGuard<'a, W>,
    access: &'a WorkerAccess<W>,
}

impl<W: Worker> WorkerLease<'_, W> {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
        let result = self.worker.write(bytes).await;
        self.poison_on_err(result)
    }

    pub async fn read_chunk(&mut self) -> Result<Bytes, WorkerError> {
        let result = self.worker.read_chunk().await;
        self.poison_on_err(result)
    }

    pub fn liveness(&mut self) -> Liveness {
        self.worker.liveness()
    }

    /// Poison without an I/O error, e.g. when a response never completed.
    pub fn poison(&self, error: &WorkerError) {
        self.access.poison(error.to_string());
    }

    fn poison_on_err<T>(&self, result: Result<T, WorkerError>) -> Result<T, WorkerError> {
        if let Err(e) = &result {
            self.access.poison(e.to_string());
        }
        result
    }
}
