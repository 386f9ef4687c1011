//! Async loading
//!
//! A fixed pool of worker threads drains a priority queue of load
//! requests. Requests carry a cooperative cancellation token, an opaque
//! params value for the factory, and a type-erased completion callback.
//! Ordering is priority first, FIFO within a tier; nothing else is
//! guaranteed across requests. Callbacks run on worker threads unless the
//! request asked for deferred dispatch, in which case the owning thread
//! pumps them through [`AsyncLoader::process_completed_callbacks`].

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::Result;
use crate::id::AssetId;

/// Load urgency tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LoadPriority {
    /// Background prefetch.
    Low = 0,
    #[default]
    Normal = 1,
    /// Player-visible soon.
    High = 2,
    /// Blocking gameplay.
    Critical = 3,
}

struct TokenInner {
    cancelled: AtomicBool,
    parents: Vec<CancellationToken>,
}

/// Cooperative cancellation flag, cheap to clone and share.
///
/// A linked token reports cancelled whenever any parent does, checked at
/// call time rather than snapshotted at construction.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parents: Vec::new(),
            }),
        }
    }

    /// A token that is cancelled when either parent is.
    pub fn linked(a: &CancellationToken, b: &CancellationToken) -> Self {
        CancellationToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parents: vec![a.clone(), b.clone()],
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.parents.iter().any(|p| p.is_cancelled())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a queued load; can cancel it or be waited on.
#[derive(Clone)]
pub struct AsyncLoadHandle {
    id: u64,
    token: CancellationToken,
}

impl AsyncLoadHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// What a load request resolves.
#[derive(Debug, Clone)]
pub enum LoadTarget {
    Name(String),
    Id(AssetId),
}

/// A loaded asset with its concrete type erased.
pub type ErasedAsset = Box<dyn Any + Send + Sync>;

/// Completion result delivered to the callback.
pub struct LoadOutcome {
    pub asset: Option<ErasedAsset>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        self.asset.is_some() && self.error.is_none() && !self.cancelled
    }

    fn cancelled() -> Self {
        LoadOutcome {
            asset: None,
            error: None,
            cancelled: true,
        }
    }
}

/// Type-erased completion callback.
pub type LoadCallback = Box<dyn FnOnce(LoadOutcome) + Send>;

/// The synchronous load the workers delegate to. Implemented by the asset
/// manager; split out as a trait so the loader has no view of mounting or
/// factories.
pub trait LoadDelegate: Send + Sync {
    fn load_erased(
        &self,
        target: &LoadTarget,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset>;
}

/// Everything needed to enqueue one load.
pub struct LoadRequestSpec {
    pub target: LoadTarget,
    pub runtime_type: std::any::TypeId,
    pub priority: LoadPriority,
    pub params: Option<Box<dyn Any + Send + Sync>>,
    pub token: CancellationToken,
    pub callback: Option<LoadCallback>,
    /// Park the callback for `process_completed_callbacks` instead of
    /// running it on the worker.
    pub deferred: bool,
}

struct LoadRequest {
    id: u64,
    /// Tie-breaker within a priority tier; lower enqueued earlier.
    seq: u64,
    target: LoadTarget,
    runtime_type: std::any::TypeId,
    priority: LoadPriority,
    params: Option<Box<dyn Any + Send + Sync>>,
    token: CancellationToken,
    callback: Option<LoadCallback>,
    deferred: bool,
}

impl PartialEq for LoadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for LoadRequest {}

impl PartialOrd for LoadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for LoadRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins, earlier enqueue breaks ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

struct LoaderShared {
    delegate: Arc<dyn LoadDelegate>,
    queue: Mutex<BinaryHeap<LoadRequest>>,
    queue_cv: Condvar,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    completed_count: AtomicU32,
    active: Mutex<FxHashMap<u64, Arc<Completion>>>,
    deferred: Mutex<Vec<DeferredCallback>>,
}

type DeferredCallback = Box<dyn FnOnce() + Send>;

impl LoaderShared {
    fn signal_completion(&self, request_id: u64) {
        if let Some(completion) = self.active.lock().remove(&request_id) {
            let mut done = completion.done.lock();
            *done = true;
            completion.cv.notify_all();
        }
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    fn deliver(&self, request_id: u64, callback: Option<LoadCallback>, outcome: LoadOutcome, deferred: bool) {
        if let Some(callback) = callback {
            if deferred {
                self.deferred.lock().push(Box::new(move || callback(outcome)));
            } else {
                callback(outcome);
            }
        }
        self.signal_completion(request_id);
    }
}

fn worker_loop(shared: Arc<LoaderShared>) {
    loop {
        let request = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(request) = queue.pop() {
                    break request;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        // Cancelled while queued: deliver without touching the manager.
        if request.token.is_cancelled() {
            shared.deliver(
                request.id,
                request.callback,
                LoadOutcome::cancelled(),
                request.deferred,
            );
            continue;
        }

        let params = request.params.as_deref();
        let result = shared
            .delegate
            .load_erased(&request.target, request.runtime_type, params);

        // A cancellation that lands mid-load cannot abort the codec, but
        // it does suppress the result.
        let outcome = if request.token.is_cancelled() {
            LoadOutcome::cancelled()
        } else {
            match result {
                Ok(asset) => LoadOutcome {
                    asset: Some(asset),
                    error: None,
                    cancelled: false,
                },
                Err(e) => LoadOutcome {
                    asset: None,
                    error: Some(e.to_string()),
                    cancelled: false,
                },
            }
        };

        shared.deliver(request.id, request.callback, outcome, request.deferred);
    }
}

/// Thread-pool asset loader with a priority queue.
pub struct AsyncLoader {
    shared: Arc<LoaderShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl AsyncLoader {
    /// Spawn `num_threads` workers; zero means one fewer than the
    /// machine's available parallelism, at least one.
    pub fn new(delegate: Arc<dyn LoadDelegate>, num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        } else {
            num_threads
        };

        let shared = Arc::new(LoaderShared {
            delegate,
            queue: Mutex::new(BinaryHeap::new()),
            queue_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            completed_count: AtomicU32::new(0),
            active: Mutex::new(FxHashMap::default()),
            deferred: Mutex::new(Vec::new()),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("snpak-loader-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn loader worker")
            })
            .collect();

        debug!(threads = num_threads, "async loader started");
        AsyncLoader {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a load. The returned handle can cancel the request or be
    /// passed to [`AsyncLoader::wait`].
    pub fn enqueue(&self, spec: LoadRequestSpec) -> AsyncLoadHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::AcqRel);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::AcqRel);

        let handle = AsyncLoadHandle {
            id,
            token: spec.token.clone(),
        };

        self.shared.active.lock().insert(
            id,
            Arc::new(Completion {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        );

        let request = LoadRequest {
            id,
            seq,
            target: spec.target,
            runtime_type: spec.runtime_type,
            priority: spec.priority,
            params: spec.params,
            token: spec.token,
            callback: spec.callback,
            deferred: spec.deferred,
        };

        self.shared.queue.lock().push(request);
        self.shared.queue_cv.notify_one();

        handle
    }

    /// Block until the request behind `handle` has completed. Returns
    /// immediately for already-finished requests; multiple threads may
    /// wait on the same handle.
    pub fn wait(&self, handle: &AsyncLoadHandle) {
        let completion = {
            let active = self.shared.active.lock();
            match active.get(&handle.id) {
                Some(c) => Arc::clone(c),
                None => return,
            }
        };
        let mut done = completion.done.lock();
        while !*done {
            completion.cv.wait(&mut done);
        }
    }

    /// Block until the queue is empty and no request is in flight.
    pub fn wait_all(&self) {
        loop {
            let queue_empty = self.shared.queue.lock().is_empty();
            if queue_empty && self.shared.active.lock().is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Cancel every queued request, delivering a cancelled outcome to
    /// each. Requests already being processed finish normally unless
    /// their token was cancelled separately.
    pub fn cancel_all(&self) {
        let drained: Vec<LoadRequest> = {
            let mut queue = self.shared.queue.lock();
            std::mem::take(&mut *queue).into_sorted_vec()
        };
        for request in drained {
            request.token.cancel();
            self.shared.deliver(
                request.id,
                request.callback,
                LoadOutcome::cancelled(),
                request.deferred,
            );
        }
    }

    pub fn pending_count(&self) -> u32 {
        self.shared.queue.lock().len() as u32
    }

    pub fn completed_count(&self) -> u32 {
        self.shared.completed_count.load(Ordering::Acquire)
    }

    /// Run callbacks parked by deferred requests on the calling thread.
    /// Returns how many ran.
    pub fn process_completed_callbacks(&self) -> u32 {
        let callbacks: Vec<_> = std::mem::take(&mut *self.shared.deferred.lock());
        let count = callbacks.len() as u32;
        for callback in callbacks {
            callback();
        }
        count
    }

    /// Stop the workers after the queue drains. Idempotent; also runs on
    /// drop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
