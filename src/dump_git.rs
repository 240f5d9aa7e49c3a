use std::{borrow::Cow, path::Path, sync::Arc};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{DumpConfig, IndexSource},
    fetch::{FetchError, Fetcher},
    frontier::{run_admission, Emitter, FetchTask, Frontier},
    git_parsing::{
        find_hashes, find_refs, hash_to_path, inflate, is_loose_object_path, is_tree,
        pack_paths, parse_tree,
    },
    index::{parse_index, IndexFile},
    listing::parse_listing,
    queue::{work_queue, QueueSender, SharedReceiver},
    tracker::WorkTracker,
    writer::{run_writer, LocalWriter, WriteJob},
};

/// Files that usually contain refs or hashes.
const COMMON_REFS: &[&str] = &[
    "FETCH_HEAD",
    "HEAD",
    "ORIG_HEAD",
    "config",
    "info/refs",
    "logs/HEAD",
    "logs/refs/heads/master",
    "logs/refs/remotes/origin/HEAD",
    "logs/refs/remotes/origin/master",
    "logs/refs/stash",
    "packed-refs",
    "refs/heads/master",
    "refs/remotes/origin/HEAD", // guessing remote names seems pointless, it's `origin` 99% of the time
    "refs/remotes/origin/master",
    "refs/stash",
];

/// Files worth having even though nothing links to them.
const COMMON_FILES: &[&str] = &[
    "COMMIT_EDITMSG",
    "description",
    "hooks/applypatch-msg.sample",
    "hooks/commit-msg.sample",
    "hooks/post-commit.sample",
    "hooks/post-receive.sample",
    "hooks/post-update.sample",
    "hooks/pre-applypatch.sample",
    "hooks/pre-commit.sample",
    "hooks/pre-push.sample",
    "hooks/pre-rebase.sample",
    "hooks/pre-receive.sample",
    "hooks/prepare-commit-msg.sample",
    "hooks/update.sample",
    "info/exclude",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    /// Discover objects from the index, refs and object contents.
    Index,
    /// The server lists directories, so just mirror them.
    Listing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub mode: CrawlMode,
    pub files_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub paths_seen: usize,
    /// Outstanding work when the crawl was declared complete.
    pub outstanding: usize,
    pub idle_transitions: usize,
}

/// State shared by every task of one crawl.
struct RunContext {
    base_url: String,
    root_path: String,
    fetcher: Fetcher,
    frontier: Arc<Frontier>,
    emitter: Emitter,
    write_tx: QueueSender<WriteJob>,
    tracker: WorkTracker,
}

impl RunContext {
    fn relative<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.base_url.as_str()).unwrap_or(path)
    }

    fn url_for(&self, relative: &str) -> String {
        format!("{}{}", self.base_url, relative)
    }

    fn emit(&self, relative: &str) {
        self.emitter.emit(self.url_for(relative));
    }

    fn store(&self, path: &str, contents: Vec<u8>) {
        let job = WriteJob {
            relative: self.relative(path).to_owned(),
            contents,
            ticket: self.tracker.ticket(),
        };
        if let Err(job) = self.write_tx.send(job) {
            error!("Writer is gone, could not save {}", job.relative);
        }
    }
}

pub async fn dump(config: DumpConfig) -> Result<CrawlSummary> {
    config.validate()?;

    // a local index is supplied by the operator, so problems with it are fatal
    let local_index = match &config.index {
        IndexSource::Local(path) => Some(load_local_index(path).await?),
        _ => None,
    };

    let fetcher = Fetcher::new(&config.transport)?;
    tokio::fs::create_dir_all(&config.output)
        .await
        .with_context(|| format!("Failed to create {}", config.output.display()))?;

    let tracker = WorkTracker::new();
    let (fetch_tx, fetch_rx) = work_queue::<FetchTask>();
    let (candidate_tx, candidate_rx) = work_queue();
    let (write_tx, write_rx) = work_queue();

    let frontier = Arc::new(Frontier::new(fetch_tx));
    let writer = tokio::spawn(run_writer(
        LocalWriter::new(&config.output),
        write_rx,
        tracker.clone(),
    ));
    let admission = tokio::spawn(run_admission(frontier.clone(), candidate_rx));

    let ctx = Arc::new(RunContext {
        base_url: config.base_url.clone(),
        root_path: config.root_path(),
        fetcher,
        frontier: frontier.clone(),
        emitter: Emitter::new(candidate_tx, tracker.clone()),
        write_tx,
        tracker: tracker.clone(),
    });

    // keeps the counter above zero until every seed is queued
    let seeding = tracker.ticket();

    let root_listing = match ctx.fetcher.get_listing(&ctx.base_url).await {
        Ok(listing) => listing,
        Err(e) => {
            debug!("Could not check {} for a directory listing: {e}", ctx.base_url);
            None
        }
    };
    let mode = match root_listing {
        Some(_) => CrawlMode::Listing,
        None => CrawlMode::Index,
    };

    let fetch_rx = fetch_rx.shared();
    let workers: Vec<JoinHandle<()>> = (0..config.threads)
        .map(|_| match mode {
            CrawlMode::Index => tokio::spawn(object_worker(ctx.clone(), fetch_rx.clone())),
            CrawlMode::Listing => tokio::spawn(listing_worker(ctx.clone(), fetch_rx.clone())),
        })
        .collect();

    match root_listing {
        Some(page) => {
            info!("Directory listing found, recursively downloading repo directory");
            for entry in parse_listing(&page, &ctx.root_path) {
                ctx.emit(&entry);
            }
        }
        None => {
            match local_index {
                Some((index, bytes)) => {
                    let url = ctx.url_for("index");
                    ctx.frontier.mark_seen(&url);
                    ctx.store(&url, bytes);
                    seed_from_index(&ctx, &index);
                }
                None if config.index == IndexSource::Bypass => ctx.emit("index"),
                None => fetch_index(&ctx).await,
            }
            fetch_packs(&ctx).await;

            for file in COMMON_REFS.iter().chain(COMMON_FILES) {
                ctx.emit(file);
            }
        }
    }
    drop(seeding);

    let finished = tracker.wait_idle().await;
    let outstanding = tracker.outstanding();
    let idle_transitions = tracker.drain_count();

    let pending_fetches = frontier.fetch_queue_depth();
    let pending_candidates = ctx.emitter.queue_depth();
    if finished.is_ok() && (pending_fetches > 0 || pending_candidates > 0) {
        error!(
            pending_fetches,
            pending_candidates, "Work counter reached zero while work was still queued"
        );
    }
    let paths_seen = frontier.seen_count();

    // everything is idle, so the workers are parked on the empty queue
    for worker in workers {
        worker.abort();
        let _ = worker.await;
    }
    admission.abort();
    let _ = admission.await;
    drop(ctx);
    drop(frontier);

    let stats = writer.await.context("Writer task panicked")?;
    finished?;

    Ok(CrawlSummary {
        mode,
        files_written: stats.files,
        bytes_written: stats.bytes,
        write_failures: stats.failures,
        paths_seen,
        outstanding,
        idle_transitions,
    })
}

async fn load_local_index(path: &Path) -> Result<(IndexFile, Vec<u8>)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Could not read index file {}", path.display()))?;
    let index = parse_index(&bytes)
        .with_context(|| format!("Could not parse index file {}", path.display()))?;
    Ok((index, bytes))
}

async fn fetch_index(ctx: &RunContext) {
    let url = ctx.url_for("index");
    ctx.frontier.mark_seen(&url);

    let bytes = match ctx.fetcher.get(&url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not download index, continuing without it: {e}");
            return;
        }
    };
    info!("Downloaded 'index' ({} bytes)", bytes.len());

    let parsed = parse_index(&bytes);
    ctx.store(&url, bytes);
    match parsed {
        Ok(index) => seed_from_index(ctx, &index),
        Err(e) => warn!("Could not parse index, continuing without it: {e}"),
    }
}

fn seed_from_index(ctx: &RunContext, index: &IndexFile) {
    info!(
        "Index version {} lists {} entries",
        index.version,
        index.entry_count
    );
    for entry in &index.entries {
        debug!(
            "\t{} {:o} {} (stage {}, {} bytes)",
            entry.hash,
            entry.mode,
            entry.name,
            entry.stage(),
            entry.size
        );
        trace!(
            ctime = entry.ctime_seconds,
            ctime_nanos = entry.ctime_nanoseconds,
            mtime = entry.mtime_seconds,
            mtime_nanos = entry.mtime_nanoseconds,
            dev = entry.dev,
            ino = entry.ino,
            uid = entry.uid,
            gid = entry.gid,
            extended_flags = ?entry.extended_flags,
            "\t\tstat of {}",
            entry.name
        );
        ctx.emit(&hash_to_path(&entry.hash));
    }
}

/// `objects/info/packs` names the packs, but we only grep it for hashes
/// and guess the pack file names from those.
async fn fetch_packs(ctx: &RunContext) {
    let url = ctx.url_for("objects/info/packs");
    ctx.frontier.mark_seen(&url);

    let bytes = match ctx.fetcher.get(&url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("No pack list: {e}");
            return;
        }
    };
    info!("Downloaded 'objects/info/packs' ({} bytes)", bytes.len());

    let hashes = find_hashes(&bytes);
    ctx.store(&url, bytes);
    for hash in hashes {
        for path in pack_paths(&hash) {
            ctx.emit(&path);
        }
    }
}

async fn object_worker(ctx: Arc<RunContext>, rx: SharedReceiver<FetchTask>) {
    while let Some(task) = rx.recv().await {
        download_and_discover(&ctx, &task.path).await;
    }
}

async fn download_and_discover(ctx: &RunContext, url: &str) {
    let Some(bytes) = download(ctx, url).await else {
        return;
    };

    // persist before parsing so broken objects still end up on disk
    let relative = ctx.relative(url).to_owned();
    ctx.store(url, bytes.clone());

    let found = discover(&relative, &bytes);
    if !found.is_empty() {
        debug!("\tFound {} references in {relative}", found.len());
    }
    for path in found {
        ctx.emit(&path);
    }
}

async fn download(ctx: &RunContext, url: &str) -> Option<Vec<u8>> {
    match ctx.fetcher.get(url).await {
        Ok(bytes) => {
            info!("Downloaded '{}' ({} bytes)", ctx.relative(url), bytes.len());
            Some(bytes)
        }
        Err(FetchError::NotFound) => {
            debug!("Got 404 for {url}");
            None
        }
        Err(e) => {
            warn!("Error while downloading {url}: {e}");
            None
        }
    }
}

/// Paths (relative to the crawl root) referenced by a downloaded file.
fn discover(relative: &str, raw: &[u8]) -> Vec<String> {
    let content = match inflate(raw) {
        Some(inflated) => Cow::Owned(inflated),
        None if is_loose_object_path(relative) => {
            warn!("Object {relative} is not zlib compressed, not looking inside");
            return vec![];
        }
        None => Cow::Borrowed(raw),
    };

    let mut found = vec![];

    if is_tree(&content) {
        match parse_tree(&content) {
            Ok(tree) => {
                debug!(
                    "\tFound tree object ({} bytes) with {} entries",
                    tree.size,
                    tree.entries.len()
                );
                for entry in &tree.entries {
                    trace!("\t\t{} {}", String::from_utf8_lossy(&entry.mode), entry.name);
                }
                found.extend(tree.entries.iter().map(|e| hash_to_path(&e.hex_hash())));
            }
            Err(e) => warn!("Malformed tree object {relative}: {e}"),
        }
    }

    found.extend(find_hashes(&content).iter().map(|hash| hash_to_path(hash)));

    for ref_path in find_refs(&content) {
        found.push(format!("logs/{ref_path}"));
        found.push(ref_path);
    }

    found
}

async fn listing_worker(ctx: Arc<RunContext>, rx: SharedReceiver<FetchTask>) {
    while let Some(task) = rx.recv().await {
        if task.path.ends_with('/') {
            list_directory(&ctx, &task.path).await;
        } else if let Some(bytes) = download(&ctx, &task.path).await {
            ctx.store(&task.path, bytes);
        }
    }
}

async fn list_directory(ctx: &RunContext, url: &str) {
    match ctx.fetcher.get_listing(url).await {
        Ok(Some(page)) => {
            info!("Found directory {}", ctx.relative(url));
            for entry in parse_listing(&page, &ctx.root_path) {
                ctx.emit(&entry);
            }
        }
        Ok(None) => debug!("{url} is not a directory listing, skipping"),
        Err(FetchError::NotFound) => debug!("Got 404 for {url}"),
        Err(e) => warn!("Error while listing {url}: {e}"),
    }
}
