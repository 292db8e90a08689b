//! Throttled fan-out for availability lookups and batched writes.
//!
//! Host systems are shared with live circulation traffic, so the dispatcher
//! keeps the broker polite twice over: a small per-source window with a
//! pacing delay between windows of the same source, and an instance-wide
//! permit cap across all sources. Different sources proceed in parallel
//! without waiting for each other.
//!
//! # Failure Isolation
//!
//! One failed item never aborts the batch. Every item comes back as an
//! [`ItemOutcome`], failures carried as markers, in the same order the items
//! went in.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

/// Concurrent requests allowed against one source at a time.
pub const DEFAULT_PER_SOURCE: usize = 2;

/// Pause between consecutive request windows against the same source.
pub const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// Floor for the instance-wide request cap.
const MIN_INSTANCE_CAP: usize = 5;

/// Items per write batch.
pub const DEFAULT_WRITE_BATCH: usize = 15;

/// Concurrent writes within one batch.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 3;

/// Result of one dispatched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<R> {
    /// The operation succeeded.
    Done(R),
    /// The operation failed; the batch carried on without it.
    Failed { error: String },
}

impl<R> ItemOutcome<R> {
    /// True when the item completed successfully.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

// ==================== ThrottledDispatcher ====================

/// Fans work out across sources under per-source and instance-wide caps.
#[derive(Debug)]
pub struct ThrottledDispatcher {
    per_source: usize,
    pacing: Duration,
    global: Arc<Semaphore>,
    instance_cap: usize,
}

impl ThrottledDispatcher {
    /// Creates a dispatcher. Zero values are lifted to one so a misconfigured
    /// cap degrades to serial execution instead of deadlock.
    #[must_use]
    pub fn new(per_source: usize, pacing: Duration, instance_cap: usize) -> Self {
        let per_source = per_source.max(1);
        let instance_cap = instance_cap.max(1);
        Self {
            per_source,
            pacing,
            global: Arc::new(Semaphore::new(instance_cap)),
            instance_cap,
        }
    }

    /// Instance-wide cap derived from the host: a quarter of the available
    /// parallelism, never below the floor.
    #[must_use]
    pub fn auto_instance_cap() -> usize {
        std::thread::available_parallelism()
            .map_or(MIN_INSTANCE_CAP, |n| (n.get() / 4).max(MIN_INSTANCE_CAP))
    }

    /// Configured instance-wide cap.
    #[must_use]
    pub fn instance_cap(&self) -> usize {
        self.instance_cap
    }

    /// Runs `op` over every `(source, item)` pair and returns one outcome per
    /// item, in input order.
    ///
    /// Items of the same source run in windows of the per-source cap with the
    /// pacing delay between windows; items of different sources interleave
    /// freely under the instance-wide cap.
    #[instrument(skip(self, items, op), fields(items = items.len()))]
    pub async fn dispatch<T, R, E, F, Fut>(
        &self,
        items: Vec<(String, T)>,
        op: F,
    ) -> Vec<ItemOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: std::fmt::Display,
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, E>> + Send + 'static,
    {
        let total = items.len();

        // Group by source, keeping first-seen source order
        let mut groups: Vec<(String, Vec<(usize, T)>)> = Vec::new();
        for (idx, (source, item)) in items.into_iter().enumerate() {
            match groups.iter_mut().find(|(name, _)| *name == source) {
                Some((_, bucket)) => bucket.push((idx, item)),
                None => groups.push((source, vec![(idx, item)])),
            }
        }

        debug!(groups = groups.len(), "dispatching across sources");

        let op = Arc::new(op);
        let slots: Arc<Mutex<Vec<Option<ItemOutcome<R>>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));

        let mut handles = Vec::with_capacity(groups.len());
        for (source, bucket) in groups {
            let op = Arc::clone(&op);
            let slots = Arc::clone(&slots);
            let global = Arc::clone(&self.global);
            let per_source = self.per_source;
            let pacing = self.pacing;

            handles.push(tokio::spawn(async move {
                let mut remaining = bucket.into_iter();
                let mut first_window = true;
                loop {
                    let window: Vec<(usize, T)> = remaining.by_ref().take(per_source).collect();
                    if window.is_empty() {
                        break;
                    }
                    if !first_window {
                        tokio::time::sleep(pacing).await;
                    }
                    first_window = false;

                    let attempts = window.into_iter().map(|(idx, item)| {
                        let op = Arc::clone(&op);
                        let global = Arc::clone(&global);
                        let source = source.clone();
                        async move {
                            let outcome = match global.acquire_owned().await {
                                Ok(_permit) => match op(source, item).await {
                                    Ok(value) => ItemOutcome::Done(value),
                                    Err(e) => ItemOutcome::Failed {
                                        error: e.to_string(),
                                    },
                                },
                                Err(_) => ItemOutcome::Failed {
                                    error: "dispatcher shut down".to_string(),
                                },
                            };
                            (idx, outcome)
                        }
                    });

                    let finished = futures_util::future::join_all(attempts).await;
                    let mut slots = slots.lock().await;
                    for (idx, outcome) in finished {
                        slots[idx] = Some(outcome);
                    }
                }
            }));
        }

        for handle in handles {
            // A panicked group is logged, its items come back as markers
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch group panicked");
            }
        }

        let slots = match Arc::try_unwrap(slots) {
            Ok(mutex) => mutex.into_inner(),
            Err(arc) => std::mem::take(&mut *arc.lock().await),
        };
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or(ItemOutcome::Failed {
                    error: "dispatch worker panicked".to_string(),
                })
            })
            .collect()
    }
}

impl Default for ThrottledDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SOURCE, DEFAULT_PACING, Self::auto_instance_cap())
    }
}

// ==================== WriteThrottle ====================

/// Batches persistence work so a large chunk never floods the store.
///
/// Batches run one after another; writes within a batch run concurrently up
/// to the configured limit. Outcomes come back in input order.
#[derive(Debug, Clone, Copy)]
pub struct WriteThrottle {
    batch_size: usize,
    concurrency: usize,
}

impl WriteThrottle {
    /// Creates a throttle. Zero values are lifted to one.
    #[must_use]
    pub fn new(batch_size: usize, concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `op` over every item, batch by batch.
    pub async fn run<T, R, E, F, Fut>(&self, items: Vec<T>, op: F) -> Vec<ItemOutcome<R>>
    where
        E: std::fmt::Display,
        F: Fn(T) -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
    {
        let mut outcomes: Vec<(usize, ItemOutcome<R>)> = Vec::with_capacity(items.len());
        let mut remaining = items.into_iter().enumerate();

        loop {
            let batch: Vec<(usize, T)> = remaining.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let finished: Vec<(usize, ItemOutcome<R>)> = futures_util::stream::iter(
                batch.into_iter().map(|(idx, item)| {
                    let op = &op;
                    async move {
                        match op(item).await {
                            Ok(value) => (idx, ItemOutcome::Done(value)),
                            Err(e) => (
                                idx,
                                ItemOutcome::Failed {
                                    error: e.to_string(),
                                },
                            ),
                        }
                    }
                }),
            )
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

            outcomes.extend(finished);
        }

        // Writes may complete out of order within a batch
        outcomes.sort_by_key(|(idx, _)| *idx);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

impl Default for WriteThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_BATCH, DEFAULT_WRITE_CONCURRENCY)
    }
}
