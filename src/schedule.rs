//! Cancellable timer tasks.
//!
//! Every polling loop in the proctoring core (perception analysis, the devtools heuristic,
//! recording auto-save) and every one-shot timeout runs as one of these tasks. Each task
//! owns exactly one thread and is torn down through its handle, so the owner composes and
//! disposes them without closures sharing mutable outer state.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Cooperative cancellation flag that can also be waited on.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleeps for `timeout` unless cancelled first. Returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let Ok(guard) = lock.lock() else {
            return true;
        };
        match cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((guard, _)) => *guard,
            Err(_) => true,
        }
    }
}

/// Handle to a task running `tick` every `interval` on its own thread.
///
/// Dropping the handle stops the task. Stopping from inside the task's own tick is allowed
/// and does not join (the thread exits after the current tick returns).
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(anyhow!("task '{}' interval must be > 0", name));
        }
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                if thread_cancel.wait_timeout(interval) {
                    break;
                }
                tick();
            })?;
        log::debug!("task {} started (every {:?})", name, interval);
        Ok(Self {
            name: name.to_string(),
            cancel,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if join.thread().id() == std::thread::current().id() {
                return;
            }
            if join.join().is_err() {
                log::error!("task {} panicked", self.name);
            }
            log::debug!("task {} stopped", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One-shot timer. Fires `action` once after `delay` unless cancelled first.
#[derive(Debug)]
pub struct Timeout {
    cancel: CancelToken,
}

impl Timeout {
    pub fn spawn<F>(name: &str, delay: Duration, action: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if !thread_cancel.wait_timeout(delay) {
                    action();
                }
            })?;
        Ok(Self { cancel })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
