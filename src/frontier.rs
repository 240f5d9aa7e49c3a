//! The admission stage between discovery and fetching.
//!
//! Workers emit [`Candidate`]s without knowing whether a path was already
//! fetched. The admission loop filters them through the [`DedupSet`] and only
//! forwards first sightings to the fetch queue.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use tracing::{debug, trace};

use crate::{
    queue::{QueueReceiver, QueueSender},
    tracker::{WorkTicket, WorkTracker},
};

/// A discovered path key waiting for admission.
#[derive(Debug)]
pub struct Candidate {
    pub path: String,
    pub ticket: WorkTicket,
}

/// An admitted path key waiting for a worker.
#[derive(Debug)]
pub struct FetchTask {
    pub path: String,
    pub ticket: WorkTicket,
}

/// Append-only set of every path key seen during a run.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: RwLock<HashSet<String>>,
}

impl DedupSet {
    pub fn contains(&self, key: &str) -> bool {
        self.seen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Inserts `key`, returning true only for its first sighting.
    ///
    /// Most repeats are turned away under the read lock. The write lock's
    /// `HashSet::insert` decides the rest, so two racing callers can never both
    /// see a miss for the same key.
    pub fn insert(&self, key: &str) -> bool {
        if self.contains(key) {
            return false;
        }

        self.seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned())
    }

    pub fn len(&self) -> usize {
        self.seen.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug)]
pub struct Frontier {
    seen: DedupSet,
    fetch_tx: QueueSender<FetchTask>,
}

impl Frontier {
    pub fn new(fetch_tx: QueueSender<FetchTask>) -> Self {
        Self {
            seen: DedupSet::default(),
            fetch_tx,
        }
    }

    /// Forwards `candidate` to the fetch queue if its path was never seen
    /// before. Returns whether it was admitted.
    pub fn admit(&self, candidate: Candidate) -> bool {
        let Candidate { path, ticket } = candidate;

        if !self.seen.insert(&path) {
            trace!("already seen {path}");
            return false;
        }

        let task = FetchTask {
            ticket: ticket.spawn(),
            path,
        };
        if let Err(task) = self.fetch_tx.send(task) {
            debug!("fetch queue closed, dropping {}", task.path);
        }
        true
    }

    /// Records a path that is fetched outside of the worker pool, so it is
    /// never queued later on.
    pub fn mark_seen(&self, path: &str) -> bool {
        self.seen.insert(path)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn fetch_queue_depth(&self) -> usize {
        self.fetch_tx.depth()
    }
}

/// Producer handle used by the seeding code and by workers.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: QueueSender<Candidate>,
    tracker: WorkTracker,
}

impl Emitter {
    pub fn new(tx: QueueSender<Candidate>, tracker: WorkTracker) -> Self {
        Self { tx, tracker }
    }

    pub fn emit(&self, path: String) {
        let candidate = Candidate {
            path,
            ticket: self.tracker.ticket(),
        };
        if let Err(candidate) = self.tx.send(candidate) {
            debug!("admission loop gone, dropping {}", candidate.path);
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.depth()
    }
}

/// Runs until every [`Emitter`] is dropped.
pub async fn run_admission(frontier: Arc<Frontier>, mut rx: QueueReceiver<Candidate>) {
    while let Some(candidate) = rx.recv().await {
        frontier.admit(candidate);
    }
}
