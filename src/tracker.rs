//! Outstanding-work accounting for a crawl.
//!
//! Every unit of in-flight work (a candidate waiting for admission, a path
//! waiting for a worker, bytes waiting for the writer) holds a [`WorkTicket`].
//! The run is quiescent once every ticket has been dropped.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
#[error("crawl aborted: {0}")]
pub struct Aborted(pub String);

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    drained: AtomicUsize,
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    idle: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct WorkTracker {
    inner: Arc<Inner>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of work. It is retired when the ticket is dropped.
    pub fn ticket(&self) -> WorkTicket {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        WorkTicket {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// How many times the counter has dropped to zero.
    pub fn drain_count(&self) -> usize {
        self.inner.drained.load(Ordering::SeqCst)
    }

    /// Stops the run. The first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.idle.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Waits until no work is outstanding, or until the run is aborted.
    pub async fn wait_idle(&self) -> Result<(), Aborted> {
        loop {
            if self.is_aborted() {
                let reason = self
                    .inner
                    .reason
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_default();
                return Err(Aborted(reason));
            }
            if self.outstanding() == 0 {
                return Ok(());
            }

            // notify_one stores a permit, so a wakeup that lands between the
            // checks above and this await is not lost
            self.inner.idle.notified().await;
        }
    }
}

/// One unit of outstanding work.
#[derive(Debug)]
pub struct WorkTicket {
    inner: Arc<Inner>,
}

impl WorkTicket {
    /// Registers an additional unit of work on the same tracker.
    pub fn spawn(&self) -> WorkTicket {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        WorkTicket {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for WorkTicket {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.fetch_add(1, Ordering::SeqCst);
            self.inner.idle.notify_one();
        }
    }
}
