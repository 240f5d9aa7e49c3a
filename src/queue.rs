use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{mpsc, Mutex};

/// Unbounded multi-producer queue that keeps track of how many items are
/// currently sitting in it.
pub fn work_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: depth.clone(),
        },
        QueueReceiver { rx, depth },
    )
}

#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Never blocks. Hands the item back if every receiver is gone.
    pub fn send(&self, item: T) -> Result<(), T> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    /// Lets several workers pull from this queue.
    pub fn shared(self) -> SharedReceiver<T> {
        SharedReceiver {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

#[derive(Debug)]
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<QueueReceiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedReceiver<T> {
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}
