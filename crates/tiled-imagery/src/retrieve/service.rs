//! Bounded, prioritized task pools.
//!
//! Tasks wait in a priority heap and run on a tokio runtime, at most
//! `max_active` at a time. Waiting tasks past their stale limit are dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::retrieve::{RetrievalPostProcessor, Retriever};

/// Future type for service tasks.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work. The token is cancelled when the service shuts down.
pub type Task = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send + 'static>;

/// Default number of tasks run at once.
pub const DEFAULT_MAX_ACTIVE: usize = 8;
/// Default number of tasks allowed to wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

struct Pending {
    priority: f64,
    seq: u64,
    submitted: Instant,
    stale_limit: Option<Duration>,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the max-heap yields the lowest priority value, oldest first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    pending: BinaryHeap<Pending>,
    active: usize,
    next_seq: u64,
}

struct ServiceInner {
    name: String,
    handle: Handle,
    max_active: usize,
    queue_capacity: usize,
    shutdown: CancellationToken,
    state: Mutex<State>,
}

/// A bounded, prioritized pool of asynchronous tasks.
///
/// At most `max_active` tasks run at once on the runtime; up to
/// `queue_capacity` more wait, lowest priority value first.
#[derive(Clone)]
pub struct RetrievalService {
    inner: Arc<ServiceInner>,
}

impl RetrievalService {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        handle: Handle,
        max_active: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                handle,
                max_active: max_active.max(1),
                queue_capacity,
                shutdown: CancellationToken::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    #[must_use]
    pub fn with_defaults(name: impl Into<String>, handle: Handle) -> Self {
        Self::new(name, handle, DEFAULT_MAX_ACTIVE, DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the service still accepts work.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Whether the wait queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.lock().pending.len() >= self.inner.queue_capacity
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Queue a task. Returns `false` if the service is shut down or full.
    pub fn run_task(&self, priority: f64, task: Task) -> bool {
        self.submit(priority, None, task)
    }

    /// Queue a task that is dropped if still waiting after `stale_limit`.
    pub fn run_task_with_stale_limit(
        &self,
        priority: f64,
        stale_limit: Option<Duration>,
        task: Task,
    ) -> bool {
        self.submit(priority, stale_limit, task)
    }

    /// Queue a retrieval whose outcome is handed to `post_processor`.
    pub fn run_retriever(
        &self,
        retriever: Arc<dyn Retriever>,
        post_processor: Arc<dyn RetrievalPostProcessor>,
        priority: f64,
    ) -> bool {
        let stale_limit = retriever.stale_request_limit();
        self.submit(
            priority,
            stale_limit,
            Box::new(move |token: CancellationToken| -> TaskFuture {
                Box::pin(async move {
                    let outcome = tokio::select! {
                        () = token.cancelled() => Err(Error::Cancelled),
                        outcome = retriever.retrieve() => outcome,
                    };
                    let name = retriever.name().to_string();
                    let processed =
                        tokio::task::spawn_blocking(move || post_processor.process(outcome)).await;
                    match processed {
                        Ok(Ok(bytes)) => {
                            tracing::debug!(source = %name, bytes, "retrieval processed");
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(source = %name, error = %e, "retrieval failed");
                        }
                        Err(e) => {
                            tracing::error!(source = %name, error = %e, "post-processor panicked");
                        }
                    }
                })
            }),
        )
    }

    fn submit(&self, priority: f64, stale_limit: Option<Duration>, task: Task) -> bool {
        if !self.is_available() {
            return false;
        }
        {
            let mut state = self.inner.lock();
            if state.pending.len() >= self.inner.queue_capacity {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Pending {
                priority,
                seq,
                submitted: Instant::now(),
                stale_limit,
                task,
            });
        }
        ServiceInner::dispatch(&self.inner);
        true
    }

    /// Stop accepting work, drop waiting tasks and signal running ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dropped = {
            let mut state = self.inner.lock();
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        tracing::debug!(service = %self.inner.name, dropped, "retrieval service shut down");
    }
}

impl ServiceInner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting tasks while there is room.
    fn dispatch(this: &Arc<Self>) {
        loop {
            let next = {
                let mut state = this.lock();
                if state.active >= this.max_active || this.shutdown.is_cancelled() {
                    return;
                }
                let Some(next) = state.pending.pop() else {
                    return;
                };
                if next
                    .stale_limit
                    .is_some_and(|limit| next.submitted.elapsed() > limit)
                {
                    tracing::debug!(service = %this.name, "dropping stale request");
                    continue;
                }
                state.active += 1;
                next
            };

            let inner = Arc::clone(this);
            let future = (next.task)(this.shutdown.child_token());
            let handle = this.handle.clone();
            this.handle.spawn(async move {
                if let Err(e) = handle.spawn(future).await {
                    tracing::error!(service = %inner.name, error = %e, "task panicked");
                }
                inner.lock().active -= 1;
                ServiceInner::dispatch(&inner);
            });
        }
    }
}

impl std::fmt::Debug for RetrievalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RetrievalService")
            .field("name", &self.inner.name)
            .field("max_active", &self.inner.max_active)
            .field("active", &state.active)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}
