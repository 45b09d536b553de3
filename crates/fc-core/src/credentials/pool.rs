//! Dedicated worker threads for impersonated operations.
//!
//! Each job runs start to finish on one worker, inside [`run_as_with`], so
//! nothing else executes on that thread while an identity is assumed. Jobs
//! never migrate: the scope is created, used and released on the same stack.

use super::scope::{run_as_with, FatalRestoreError, PrivilegeChangeError};
use super::sys::{CredentialOp, CredentialSyscalls, ThreadCredentials};
use crate::config::ImpersonationConfig;
use crate::logging::event_names;
use fc_common::Identity;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, info_span, trace};

type Job = Box<dyn FnOnce(&dyn CredentialSyscalls) + Send + 'static>;

/// Why an impersonated job produced no value.
#[derive(Debug, Error)]
pub enum ImpersonateError {
    #[error(transparent)]
    Privilege(#[from] PrivilegeChangeError),
    #[error("impersonated operation panicked; identity was restored")]
    BodyPanicked,
    #[error("impersonation pool is shut down")]
    PoolClosed,
    #[error("worker exited before reporting a result")]
    WorkerLost,
}

impl From<ImpersonateError> for fc_common::Error {
    fn from(err: ImpersonateError) -> Self {
        match err {
            ImpersonateError::Privilege(e) => e.into(),
            other => fc_common::Error::PrivilegeChange(other.to_string()),
        }
    }
}

/// Result handle for a submitted job.
///
/// Dropping it requests cancellation. Cancellation is deferred: the body
/// still runs to completion and the worker still restores its identity; the
/// result is discarded.
#[derive(Debug)]
#[must_use = "dropping a PendingOperation discards its result"]
pub struct PendingOperation<T> {
    rx: Receiver<Result<T, ImpersonateError>>,
}

impl<T> PendingOperation<T> {
    /// Block until the job has finished and the worker has restored its
    /// identity.
    pub fn wait(self) -> Result<T, ImpersonateError> {
        self.rx.recv().unwrap_or(Err(ImpersonateError::WorkerLost))
    }
}

/// Fixed set of named OS threads serving impersonated jobs.
pub struct ImpersonationPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ImpersonationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationPool")
            .field("workers", &self.workers.len())
            .field("open", &self.sender.is_some())
            .finish()
    }
}

impl ImpersonationPool {
    /// Spawn workers using the real kernel primitives.
    pub fn new(config: &ImpersonationConfig) -> std::io::Result<Self> {
        Self::with_backend(config, || ThreadCredentials)
    }

    /// Spawn workers, each constructing its own primitives with `backend`
    /// on its own thread.
    pub fn with_backend<S, F>(config: &ImpersonationConfig, backend: F) -> std::io::Result<Self>
    where
        S: CredentialSyscalls + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let backend = Arc::new(backend);
        let verify = config.verify_restore;

        let count = config.workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = Arc::clone(&receiver);
            let backend = Arc::clone(&backend);
            let handle = thread::Builder::new()
                .name(format!("fc-impersonate-{index}"))
                .spawn(move || {
                    let sys = backend();
                    worker_loop(index, &sys, &receiver, verify);
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `body` to run as `identity` on a worker thread.
    pub fn submit<T, F>(&self, identity: Identity, body: F) -> Result<PendingOperation<T>, ImpersonateError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(ImpersonateError::PoolClosed)?;
        let (tx, rx) = mpsc::sync_channel(1);

        let job: Job = Box::new(move |sys| {
            // The scope's Drop restores the identity while the panic unwinds,
            // before catch_unwind returns here.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_as_with(sys, &identity, body)));
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(ImpersonateError::Privilege(err)),
                Err(_) => Err(ImpersonateError::BodyPanicked),
            };
            // A closed receiver is a cancelled operation.
            let _ = tx.send(result);
        });

        sender.send(job).map_err(|_| ImpersonateError::PoolClosed)?;
        Ok(PendingOperation { rx })
    }

    /// Submit and wait.
    pub fn run<T, F>(&self, identity: Identity, body: F) -> Result<T, ImpersonateError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(identity, body)?.wait()
    }

    /// Stop accepting jobs, drain the queue and join every worker.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ImpersonationPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<S: CredentialSyscalls>(
    index: usize,
    sys: &S,
    receiver: &Mutex<Receiver<Job>>,
    verify: bool,
) {
    let _span = info_span!("worker", worker = index).entered();
    let baseline = match sys.current() {
        Ok(state) => Some(state),
        Err(err) => {
            debug!(error = %err, "worker could not snapshot credentials");
            None
        }
    };
    info!(target: event_names::POOL_WORKER_STARTED, "impersonation worker started");

    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        let Ok(job) = job else { break };

        job(sys);

        if let (true, Some(expected)) = (verify, baseline.as_ref()) {
            match sys.current() {
                Ok(actual) if actual == *expected => {
                    trace!("worker credentials match start-up snapshot");
                }
                Ok(actual) => {
                    let fields = expected.diff(&actual);
                    FatalRestoreError::Mismatch {
                        expected: expected.clone(),
                        actual,
                        fields,
                    }
                    .terminate();
                }
                Err(source) => FatalRestoreError::Syscall {
                    op: CredentialOp::Read,
                    expected: expected.clone(),
                    source,
                }
                .terminate(),
            }
        }
    }

    info!(target: event_names::POOL_WORKER_STOPPED, "impersonation worker stopped");
}
