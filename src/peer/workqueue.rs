use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indicatif::ProgressBar;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::DownloadError;
use crate::peer::PeerError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,
    #[error("work queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<u32>,
    closed: bool,
}

/// Piece indices waiting to be downloaded. Each index is handed to exactly
/// one caller of `try_dequeue` and is never put back.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState { items: VecDeque::with_capacity(capacity), closed: false }),
            capacity,
        }
    }

    /// A closed queue holding `0..piece_count`.
    pub fn seeded(piece_count: u32) -> Self {
        let queue = WorkQueue::new(piece_count as usize);
        {
            let mut state = queue.lock();
            state.items.extend(0..piece_count);
            state.closed = true;
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // the state stays consistent even if a holder panicked mid-pop
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, index: u32) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        state.items.push_back(index);
        Ok(())
    }

    /// Never blocks. `None` means there is nothing left to hand out.
    pub fn try_dequeue(&self) -> Option<u32> {
        self.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One download worker's source of pieces, usually a single peer connection.
pub trait PieceWorker: Send + 'static {
    fn name(&self) -> String;

    fn fetch(&mut self, index: u32) -> impl Future<Output = Result<Vec<u8>, PeerError>> + Send;
}

pub struct WorkerPool<W> {
    queue: Arc<WorkQueue>,
    workers: Vec<W>,
    progress: ProgressBar,
}

impl<W: PieceWorker> WorkerPool<W> {
    pub fn new(queue: Arc<WorkQueue>, workers: Vec<W>) -> Self {
        WorkerPool { queue, workers, progress: ProgressBar::hidden() }
    }

    /// Advances `progress` by one for every piece fetched.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Drains the queue with one task per worker and waits for all of them.
    /// Pieces that failed are simply absent from the returned map.
    pub async fn run(self) -> BTreeMap<u32, Vec<u8>> {
        info!(workers = self.workers.len(), queued = self.queue.len(), "starting worker pool");
        let mut tasks = JoinSet::new();
        for worker in self.workers {
            tasks.spawn(drain(worker, Arc::clone(&self.queue), self.progress.clone()));
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(local) => results.extend(local),
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        self.progress.finish_and_clear();
        info!(pieces = results.len(), "worker pool finished");
        results
    }
}

async fn drain<W: PieceWorker>(mut worker: W, queue: Arc<WorkQueue>, progress: ProgressBar) -> Vec<(u32, Vec<u8>)> {
    let name = worker.name();
    let mut local = Vec::new();
    while let Some(index) = queue.try_dequeue() {
        match worker.fetch(index).await {
            Ok(piece) => {
                debug!(worker = %name, index, "piece complete");
                progress.inc(1);
                local.push((index, piece));
            }
            Err(e) if e.is_fatal() => {
                warn!(worker = %name, index, error = %e, "worker stopping");
                break;
            }
            Err(e) => warn!(worker = %name, index, error = %e, "skipping piece"),
        }
    }
    debug!(worker = %name, fetched = local.len(), "worker done");
    local
}

/// Concatenates pieces in index order. Fails without producing any output
/// if an index in `0..piece_count` is missing.
pub fn assemble(results: BTreeMap<u32, Vec<u8>>, piece_count: u32) -> Result<Vec<u8>, DownloadError> {
    let missing: Vec<u32> = (0..piece_count).filter(|i| !results.contains_key(i)).collect();
    if !missing.is_empty() {
        return Err(DownloadError::MissingPieces(missing));
    }
    Ok(results.into_values().flatten().collect())
}
