// src/exchange/timer.rs

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use super::errors::{Result, RpcError};

pub const DEFAULT_TIMER_THREAD_NAME: &str = "rpc-response-timeout";

/// Shared one-shot timer backing every pending call's deadline.
///
/// Runs a current-thread tokio runtime on its own named thread. The thread is
/// never joined implicitly, so it does not hold the process open.
pub struct TimeoutScheduler {
    name: String,
    handle: Handle,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Armed deadline. Cancelling it retires the sleeping task early.
#[derive(Debug)]
pub struct DeadlineHandle {
    abort: AbortHandle,
}

impl DeadlineHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl TimeoutScheduler {
    pub fn start(name: &str) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (handle_tx, handle_rx) = mpsc::channel::<std::io::Result<Handle>>();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here drops every deadline still sleeping.
            })
            .map_err(|e| {
                RpcError::SchedulerError(format!("Failed to spawn timer thread: {}", e))
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| {
                RpcError::SchedulerError("Timer thread exited during startup".to_string())
            })?
            .map_err(|e| {
                RpcError::SchedulerError(format!("Failed to build timer runtime: {}", e))
            })?;

        info!(thread = %name, "Timeout scheduler started");

        Ok(Self {
            name: name.to_string(),
            handle,
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `action` once after `delay` unless the returned handle is cancelled first.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> Result<DeadlineHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        })
    }

    fn spawn<Fut>(&self, task: Fut) -> Result<DeadlineHandle>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Held across the check and the spawn so shutdown cannot slip in between.
        let shutdown_tx = self.shutdown_tx.lock();
        if shutdown_tx.is_none() || self.is_shutdown() {
            return Err(RpcError::SchedulerError(format!(
                "Timeout scheduler {} is shut down",
                self.name
            )));
        }
        let join = self.handle.spawn(task);
        Ok(DeadlineHandle {
            abort: join.abort_handle(),
        })
    }

    /// Stops the timer thread. Deadlines still armed never fire. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                debug!(
                    thread = %self.name,
                    "Shutdown requested from the timer thread, not joining"
                );
                return;
            }
            if worker.join().is_err() {
                error!(thread = %self.name, "Timeout scheduler thread panicked");
            }
        }

        info!(thread = %self.name, "Timeout scheduler stopped");
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}
