//! Batch fetch scheduler
//!
//! The scheduler owns the listener registry and the result store and runs a
//! single event loop. Listener changes are debounced before the listening-key
//! snapshot is recomputed; new blocks are applied immediately. Each dispatch
//! computes the stale keys, splits them into chunks and fetches every chunk
//! through `retry()` on its own task. Chunk outcomes come back to the loop
//! over a channel, so the registry and the store are only ever mutated here.
//!
//! Dispatches for one block form a group. Dispatching for a different block
//! cancels the previous group; outcomes of a cancelled group are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::aggregate::{fetch_chunk, AggregateResult, Aggregator};
use super::call::{Call, CallKey};
use super::registry::ListenerRegistry;
use super::staleness::outdated_listening_keys;
use super::state::CallState;
use super::store::{CallResult, ResultStore};
use crate::error::{MulticallError, Result};
use crate::retry::{retry, CancelHandle, RetryOptions};

// ============================================
// CONFIG
// ============================================

/// Chunk calls so a single aggregate stays under the node's gas limit
pub const CALL_CHUNK_SIZE: usize = 500;

/// Window for coalescing listener churn
pub const LISTENER_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub call_chunk_size: usize,
    pub listener_debounce: Duration,
    pub retry: RetryOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            call_chunk_size: CALL_CHUNK_SIZE,
            listener_debounce: LISTENER_DEBOUNCE,
            retry: RetryOptions::default(),
        }
    }
}

/// Consecutive chunks of at most `max_chunk_size` items
pub fn chunk_calls<T: Clone>(items: &[T], max_chunk_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(max_chunk_size.max(1))
        .map(<[T]>::to_vec)
        .collect()
}

// ============================================
// EVENTS
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    AddListeners {
        chain_id: u64,
        calls: Vec<Call>,
        blocks_per_fetch: u64,
    },
    RemoveListeners {
        chain_id: u64,
        calls: Vec<Call>,
        blocks_per_fetch: u64,
    },
    NewBlock {
        chain_id: u64,
        block_number: u64,
    },
    Shutdown,
}

/// Settled fetch of one chunk, applied by the event loop
#[derive(Debug)]
struct ChunkOutcome {
    group_id: u64,
    chunk_id: u64,
    chain_id: u64,
    fetching_block_number: u64,
    keys: Vec<CallKey>,
    result: Result<AggregateResult>,
}

/// Chunks dispatched for one block
struct FetchGroup {
    id: u64,
    chain_id: u64,
    block_number: u64,
    chunks: HashMap<u64, (CancelHandle, Vec<CallKey>)>,
}

// ============================================
// SCHEDULER
// ============================================

pub struct Scheduler<A: Aggregator> {
    aggregator: Arc<A>,
    config: SchedulerConfig,
    registry: ListenerRegistry,
    results: watch::Sender<ResultStore>,
    latest_block: watch::Sender<Option<u64>>,
    listening_keys: HashMap<CallKey, u64>,
    chain_id: Option<u64>,
    latest_block_number: Option<u64>,
    group: Option<FetchGroup>,
    next_group_id: u64,
    next_chunk_id: u64,
    debounce_deadline: Option<Instant>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    outcomes_tx: mpsc::UnboundedSender<ChunkOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<ChunkOutcome>,
}

impl<A: Aggregator> Scheduler<A> {
    pub fn new(aggregator: Arc<A>, config: SchedulerConfig) -> (Self, SchedulerHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (results, results_rx) = watch::channel(ResultStore::new());
        let (latest_block, latest_block_rx) = watch::channel(None);

        let scheduler = Self {
            aggregator,
            config,
            registry: ListenerRegistry::new(),
            results,
            latest_block,
            listening_keys: HashMap::new(),
            chain_id: None,
            latest_block_number: None,
            group: None,
            next_group_id: 0,
            next_chunk_id: 0,
            debounce_deadline: None,
            events,
            outcomes_tx,
            outcomes_rx,
        };
        let handle = SchedulerHandle {
            events: events_tx,
            results: results_rx,
            latest_block: latest_block_rx,
        };
        (scheduler, handle)
    }

    pub fn store(&self) -> watch::Ref<'_, ResultStore> {
        self.results.borrow()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    pub fn latest_block_number(&self) -> Option<u64> {
        self.latest_block_number
    }

    /// Block number and outstanding chunk count of the current group
    pub fn in_flight(&self) -> Option<(u64, usize)> {
        self.group
            .as_ref()
            .map(|group| (group.block_number, group.chunks.len()))
    }

    pub fn add_listeners(&mut self, chain_id: u64, calls: &[Call], blocks_per_fetch: u64) {
        self.registry.add_listeners(chain_id, calls, blocks_per_fetch);
        self.listeners_changed();
    }

    pub fn remove_listeners(&mut self, chain_id: u64, calls: &[Call], blocks_per_fetch: u64) {
        self.registry.remove_listeners(chain_id, calls, blocks_per_fetch);
        self.listeners_changed();
    }

    fn listeners_changed(&mut self) {
        self.debounce_deadline = Some(Instant::now() + self.config.listener_debounce);
    }

    /// Recompute the listening-key snapshot for the current chain
    pub fn refresh_listening_keys(&mut self) {
        self.debounce_deadline = None;
        self.listening_keys = match self.chain_id {
            Some(chain_id) => self.registry.active_listening_keys(chain_id),
            None => HashMap::new(),
        };
        trace!(keys = self.listening_keys.len(), "listening keys refreshed");
    }

    /// Apply a block notification and dispatch whatever became stale.
    /// Block numbers only move forward within a chain.
    pub fn on_new_block(&mut self, chain_id: u64, block_number: u64) -> usize {
        if self.chain_id != Some(chain_id) {
            info!(chain_id, block_number, "switching chain");
            self.chain_id = Some(chain_id);
            self.latest_block_number = Some(block_number);
            self.refresh_listening_keys();
        } else if self
            .latest_block_number
            .is_some_and(|latest| latest >= block_number)
        {
            trace!(block_number, "ignoring non-increasing block");
            return 0;
        } else {
            self.latest_block_number = Some(block_number);
        }

        self.latest_block.send_replace(Some(block_number));
        self.dispatch()
    }

    /// Cancel the current group and release its in-flight markers so its
    /// keys are picked up again by the next dispatch.
    fn supersede(&mut self) {
        let Some(group) = self.group.take() else {
            return;
        };

        let mut cancelled = 0;
        let mut released: Vec<CallKey> = Vec::new();
        for (handle, keys) in group.chunks.into_values() {
            if handle.cancel() {
                cancelled += 1;
            }
            released.extend(keys);
        }

        if !released.is_empty() {
            self.results.send_modify(|store| {
                store.release_fetch(group.chain_id, &released, group.block_number);
            });
        }

        debug!(
            block_number = group.block_number,
            cancelled,
            released = released.len(),
            "superseded in-flight fetches"
        );
    }

    /// Start fetches for every stale key. Returns the number of chunks started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&mut self) -> usize {
        let (Some(chain_id), Some(block_number)) = (self.chain_id, self.latest_block_number) else {
            return 0;
        };

        if self
            .group
            .as_ref()
            .is_some_and(|group| group.chain_id != chain_id || group.block_number != block_number)
        {
            self.supersede();
        }

        let outdated = {
            let store = self.results.borrow();
            outdated_listening_keys(
                &store,
                &self.listening_keys,
                Some(chain_id),
                Some(block_number),
            )
        };
        if outdated.is_empty() {
            return 0;
        }

        let pending: Vec<(CallKey, Call)> = outdated
            .into_iter()
            .filter_map(|key| match key.parse() {
                Ok(call) => Some((key, call)),
                Err(e) => {
                    warn!(%key, error = %e, "skipping unparseable call key");
                    None
                }
            })
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let keys: Vec<CallKey> = pending.iter().map(|(key, _)| key.clone()).collect();
        self.results
            .send_modify(|store| store.start_fetch(chain_id, &keys, block_number));

        if self.group.is_none() {
            self.group = Some(FetchGroup {
                id: self.next_group_id,
                chain_id,
                block_number,
                chunks: HashMap::new(),
            });
            self.next_group_id += 1;
        }
        let Some(group) = self.group.as_mut() else {
            return 0;
        };
        let group_id = group.id;

        let mut started = 0;
        for chunk in chunk_calls(&pending, self.config.call_chunk_size) {
            let chunk_id = self.next_chunk_id;
            self.next_chunk_id += 1;

            let (chunk_keys, calls): (Vec<CallKey>, Vec<Call>) = chunk.into_iter().unzip();

            let aggregator = self.aggregator.clone();
            let handle = retry(
                move || {
                    let aggregator = aggregator.clone();
                    let calls = calls.clone();
                    async move { fetch_chunk(aggregator.as_ref(), calls, block_number).await }
                },
                self.config.retry,
            );

            group
                .chunks
                .insert(chunk_id, (handle.canceller(), chunk_keys.clone()));

            let outcomes = self.outcomes_tx.clone();
            tokio::spawn(async move {
                let result = handle.await;
                // The receiver lives as long as the scheduler
                let _ = outcomes.send(ChunkOutcome {
                    group_id,
                    chunk_id,
                    chain_id,
                    fetching_block_number: block_number,
                    keys: chunk_keys,
                    result,
                });
            });
            started += 1;
        }

        debug!(
            chain_id,
            block_number,
            calls = keys.len(),
            chunks = started,
            "dispatched multicall chunks"
        );
        started
    }

    /// Write a settled chunk into the result store
    fn apply_outcome(&mut self, outcome: ChunkOutcome) {
        let live = match self.group.as_mut() {
            Some(group) if group.id == outcome.group_id => {
                group.chunks.remove(&outcome.chunk_id);
                true
            }
            _ => false,
        };
        if !live {
            debug!(
                block_number = outcome.fetching_block_number,
                "dropping outcome of superseded fetch"
            );
            return;
        }

        let ChunkOutcome {
            chain_id,
            fetching_block_number,
            keys,
            result,
            ..
        } = outcome;

        match result {
            Ok(AggregateResult {
                block_number,
                return_data,
            }) => {
                let mut applied = 0;
                self.results.send_modify(|store| {
                    for (key, data) in keys.iter().zip(return_data) {
                        if store.commit_success(chain_id, key, data, block_number) {
                            applied += 1;
                        }
                    }
                });
                trace!(chain_id, block_number, applied, "multicall chunk committed");
            }
            Err(MulticallError::Cancelled) => {
                debug!(fetching_block_number, "cancelled fetch for block");
            }
            Err(err) => {
                warn!(
                    chain_id,
                    fetching_block_number,
                    calls = keys.len(),
                    error = %err,
                    "failed to fetch multicall chunk"
                );
                self.results.send_modify(|store| {
                    store.commit_failure(chain_id, &keys, fetching_block_number);
                });
            }
        }
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::AddListeners {
                chain_id,
                calls,
                blocks_per_fetch,
            } => self.add_listeners(chain_id, &calls, blocks_per_fetch),
            SchedulerEvent::RemoveListeners {
                chain_id,
                calls,
                blocks_per_fetch,
            } => self.remove_listeners(chain_id, &calls, blocks_per_fetch),
            SchedulerEvent::NewBlock {
                chain_id,
                block_number,
            } => {
                self.on_new_block(chain_id, block_number);
            }
            SchedulerEvent::Shutdown => {}
        }
    }

    /// Drive the scheduler until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            chunk_size = self.config.call_chunk_size,
            debounce_ms = self.config.listener_debounce.as_millis() as u64,
            "multicall scheduler started"
        );

        loop {
            let deadline = self.debounce_deadline;

            tokio::select! {
                event = self.events.recv() => match event {
                    None | Some(SchedulerEvent::Shutdown) => break,
                    Some(event) => self.handle_event(event),
                },
                Some(outcome) = self.outcomes_rx.recv() => {
                    self.apply_outcome(outcome);
                    self.dispatch();
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.refresh_listening_keys();
                    self.dispatch();
                }
            }
        }

        self.supersede();
        info!("multicall scheduler stopped");
    }
}

// ============================================
// HANDLE
// ============================================

/// Cloneable front end of a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    events: mpsc::UnboundedSender<SchedulerEvent>,
    results: watch::Receiver<ResultStore>,
    latest_block: watch::Receiver<Option<u64>>,
}

impl SchedulerHandle {
    fn send(&self, event: SchedulerEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| MulticallError::SchedulerClosed)
    }

    pub fn add_listeners(&self, chain_id: u64, calls: Vec<Call>, blocks_per_fetch: u64) -> Result<()> {
        self.send(SchedulerEvent::AddListeners {
            chain_id,
            calls,
            blocks_per_fetch,
        })
    }

    pub fn remove_listeners(&self, chain_id: u64, calls: Vec<Call>, blocks_per_fetch: u64) -> Result<()> {
        self.send(SchedulerEvent::RemoveListeners {
            chain_id,
            calls,
            blocks_per_fetch,
        })
    }

    /// Add listeners that are removed again when the guard is dropped
    pub fn subscribe(&self, chain_id: u64, calls: Vec<Call>, blocks_per_fetch: u64) -> Result<ListenerGuard> {
        self.add_listeners(chain_id, calls.clone(), blocks_per_fetch)?;
        Ok(ListenerGuard {
            events: self.events.clone(),
            chain_id,
            calls,
            blocks_per_fetch,
        })
    }

    pub fn new_block(&self, chain_id: u64, block_number: u64) -> Result<()> {
        self.send(SchedulerEvent::NewBlock {
            chain_id,
            block_number,
        })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(SchedulerEvent::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Store receiver; `changed()` fires on every store mutation
    pub fn results(&self) -> watch::Receiver<ResultStore> {
        self.results.clone()
    }

    pub fn latest_block_number(&self) -> Option<u64> {
        *self.latest_block.borrow()
    }

    pub fn call_result(&self, chain_id: u64, call: &Call) -> Option<CallResult> {
        self.results.borrow().get(chain_id, &call.key()).cloned()
    }

    pub fn call_state(&self, chain_id: u64, call: &Call) -> CallState {
        let latest_block_number = self.latest_block_number();
        let store = self.results.borrow();
        CallState::from_result(store.get(chain_id, &call.key()), latest_block_number)
    }
}

/// Listener registration tied to a scope
#[must_use = "listeners are removed when the guard is dropped"]
pub struct ListenerGuard {
    events: mpsc::UnboundedSender<SchedulerEvent>,
    chain_id: u64,
    calls: Vec<Call>,
    blocks_per_fetch: u64,
}

impl ListenerGuard {
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        // Nothing to clean up if the scheduler is already gone
        let _ = self.events.send(SchedulerEvent::RemoveListeners {
            chain_id: self.chain_id,
            calls: std::mem::take(&mut self.calls),
            blocks_per_fetch: self.blocks_per_fetch,
        });
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
pub(crate) fn detached_handle() -> (SchedulerHandle, mpsc::UnboundedReceiver<SchedulerEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let (_, results) = watch::channel(ResultStore::new());
    let (_, latest_block) = watch::channel(None);
    (
        SchedulerHandle {
            events,
            results,
            latest_block,
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};
    use std::collections::{HashSet, VecDeque};
    use std::future::Future;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Echoes each call's data back, read at `block`
    #[derive(Default)]
    struct MockAggregator {
        block: AtomicU64,
        /// Blocks to report before falling back to `block`
        scripted_blocks: Mutex<VecDeque<u64>>,
        failure: Mutex<Option<MulticallError>>,
        delay: Duration,
        requests: Mutex<Vec<usize>>,
    }

    impl MockAggregator {
        fn at(block: u64) -> Self {
            let mock = Self::default();
            mock.block.store(block, Ordering::SeqCst);
            mock
        }

        fn requests(&self) -> Vec<usize> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Aggregator for MockAggregator {
        fn aggregate(&self, calls: Vec<Call>) -> impl Future<Output = Result<AggregateResult>> + Send {
            async move {
                self.requests.lock().unwrap().push(calls.len());
                let scripted = self.scripted_blocks.lock().unwrap().pop_front();
                let block_number = scripted.unwrap_or_else(|| self.block.load(Ordering::SeqCst));

                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }

                let failure = self.failure.lock().unwrap().clone();
                if let Some(err) = failure {
                    return Err(err);
                }

                Ok(AggregateResult {
                    block_number,
                    return_data: calls.into_iter().map(|c| c.call_data).collect(),
                })
            }
        }
    }

    impl<A: Aggregator> Scheduler<A> {
        async fn settle_one(&mut self) {
            let outcome = timeout(Duration::from_secs(5), self.outcomes_rx.recv())
                .await
                .expect("chunk outcome in time")
                .expect("outcome channel open");
            self.apply_outcome(outcome);
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            call_chunk_size: CALL_CHUNK_SIZE,
            listener_debounce: Duration::from_millis(20),
            retry: RetryOptions {
                n: Some(3),
                min_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(2),
            },
        }
    }

    fn calls(n: usize) -> Vec<Call> {
        (0..n)
            .map(|i| Call::new(Address::repeat_byte(0xaa), (i as u32).to_be_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_chunking() {
        let keys: Vec<u32> = (0..1200).collect();
        let chunks = chunk_calls(&keys, 500);

        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);

        let seen: HashSet<u32> = chunks.iter().flatten().copied().collect();
        assert_eq!(seen.len(), 1200);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 1200);
    }

    #[test]
    fn test_chunking_small_input() {
        assert_eq!(chunk_calls(&[1, 2, 3], 500), vec![vec![1, 2, 3]]);
        assert!(chunk_calls::<u8>(&[], 500).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_and_commit() {
        let mock = Arc::new(MockAggregator::at(100));
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(3);

        scheduler.add_listeners(1, &watched, 1);
        assert_eq!(scheduler.on_new_block(1, 100), 1);
        scheduler.settle_one().await;

        for call in &watched {
            let result = handle.call_result(1, call).unwrap();
            assert_eq!(result.data, Some(call.call_data.clone()));
            assert_eq!(result.block_number, Some(100));
            assert_eq!(result.fetching_block_number, None);

            let state = handle.call_state(1, call);
            assert!(state.valid && !state.loading && !state.error);
        }
        assert_eq!(mock.requests(), vec![3]);
    }

    #[tokio::test]
    async fn test_dispatch_chunks_large_stale_set() {
        let mock = Arc::new(MockAggregator::at(100));
        let (mut scheduler, _handle) = Scheduler::new(mock.clone(), fast_config());

        scheduler.add_listeners(1, &calls(1200), 1);
        assert_eq!(scheduler.on_new_block(1, 100), 3);
        for _ in 0..3 {
            scheduler.settle_one().await;
        }

        let mut sizes = mock.requests();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![200, 500, 500]);
        assert_eq!(scheduler.store().len(), 1200);
    }

    #[tokio::test]
    async fn test_same_block_is_not_refetched() {
        let mock = Arc::new(MockAggregator {
            delay: Duration::from_millis(20),
            ..MockAggregator::at(100)
        });
        let (mut scheduler, _handle) = Scheduler::new(mock.clone(), fast_config());

        scheduler.add_listeners(1, &calls(2), 1);
        assert_eq!(scheduler.on_new_block(1, 100), 1);
        assert_eq!(scheduler.dispatch(), 0);

        // A new listener for the same block joins the group
        let extra = Call::new(Address::repeat_byte(0xbb), vec![0x01]);
        scheduler.add_listeners(1, &[extra.clone()], 1);
        scheduler.refresh_listening_keys();
        assert_eq!(scheduler.dispatch(), 1);
        assert_eq!(scheduler.in_flight(), Some((100, 2)));

        scheduler.settle_one().await;
        scheduler.settle_one().await;
        assert_eq!(scheduler.store().len(), 3);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_supersession() {
        let mock = Arc::new(MockAggregator {
            delay: Duration::from_millis(50),
            ..MockAggregator::at(100)
        });
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(2);

        scheduler.add_listeners(1, &watched, 1);
        assert_eq!(scheduler.on_new_block(1, 100), 1);

        mock.block.store(101, Ordering::SeqCst);
        assert_eq!(scheduler.on_new_block(1, 101), 1);
        assert_eq!(scheduler.in_flight(), Some((101, 1)));

        // The cancelled block-100 chunk settles first and changes nothing
        scheduler.settle_one().await;
        for call in &watched {
            let result = handle.call_result(1, call).unwrap();
            assert_eq!(result.data, None);
            assert_eq!(result.block_number, None);
            assert_eq!(result.fetching_block_number, Some(101));
        }

        scheduler.settle_one().await;
        for call in &watched {
            assert_eq!(handle.call_result(1, call).unwrap().block_number, Some(101));
        }

        // The abandoned block-100 attempt finishes without reporting back
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(scheduler.outcomes_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_superseded_failure_is_ignored() {
        let mock = Arc::new(MockAggregator {
            delay: Duration::from_millis(50),
            ..MockAggregator::at(100)
        });
        *mock.failure.lock().unwrap() = Some(MulticallError::Fatal("execution reverted".into()));
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(2);

        scheduler.add_listeners(1, &watched, 1);
        assert_eq!(scheduler.on_new_block(1, 100), 1);
        assert_eq!(scheduler.on_new_block(1, 101), 1);

        // The block-100 chunk fails after being superseded; the store keeps
        // only the block-101 marker
        scheduler.settle_one().await;
        for call in &watched {
            assert_eq!(
                handle.call_result(1, call).unwrap(),
                CallResult {
                    data: None,
                    block_number: None,
                    fetching_block_number: Some(101),
                }
            );
        }

        // Only the live block-101 failure is recorded
        scheduler.settle_one().await;
        for call in &watched {
            assert_eq!(
                handle.call_result(1, call).unwrap(),
                CallResult {
                    data: None,
                    block_number: Some(101),
                    fetching_block_number: None,
                }
            );
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(scheduler.outcomes_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fatal_failure_records_error() {
        let mock = Arc::new(MockAggregator::at(100));
        *mock.failure.lock().unwrap() = Some(MulticallError::Fatal("execution reverted".into()));
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(2);

        scheduler.add_listeners(1, &watched, 1);
        scheduler.on_new_block(1, 100);
        scheduler.settle_one().await;

        for call in &watched {
            let result = handle.call_result(1, call).unwrap();
            assert_eq!(result.data, None);
            assert_eq!(result.block_number, Some(100));
            assert_eq!(result.fetching_block_number, None);
            assert!(handle.call_state(1, call).error);
        }
        // Not retried, and not refetched until the next block
        assert_eq!(mock.requests().len(), 1);
        assert_eq!(scheduler.dispatch(), 0);
        assert_eq!(scheduler.on_new_block(1, 101), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_error() {
        let mock = Arc::new(MockAggregator::at(100));
        *mock.failure.lock().unwrap() = Some(MulticallError::Retryable("timeout".into()));
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(1);

        scheduler.add_listeners(1, &watched, 1);
        scheduler.on_new_block(1, 100);
        scheduler.settle_one().await;

        assert_eq!(mock.requests().len(), 4);
        assert_eq!(handle.call_result(1, &watched[0]).unwrap().block_number, Some(100));
    }

    #[tokio::test]
    async fn test_lagging_node_is_retried() {
        let mock = Arc::new(MockAggregator::at(100));
        mock.scripted_blocks.lock().unwrap().extend([98, 99]);
        let (mut scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let watched = calls(1);

        scheduler.add_listeners(1, &watched, 1);
        scheduler.on_new_block(1, 100);
        scheduler.settle_one().await;

        assert_eq!(mock.requests().len(), 3);
        assert_eq!(handle.call_result(1, &watched[0]).unwrap().block_number, Some(100));
    }

    #[tokio::test]
    async fn test_result_block_can_exceed_target() {
        let mock = Arc::new(MockAggregator::at(105));
        let (mut scheduler, handle) = Scheduler::new(mock, fast_config());
        let watched = calls(1);

        scheduler.add_listeners(1, &watched, 1);
        scheduler.on_new_block(1, 100);
        scheduler.settle_one().await;

        assert_eq!(handle.call_result(1, &watched[0]).unwrap().block_number, Some(105));
    }

    #[tokio::test]
    async fn test_blocks_do_not_go_backwards() {
        let mock = Arc::new(MockAggregator::at(100));
        let (mut scheduler, _handle) = Scheduler::new(mock, fast_config());

        scheduler.on_new_block(1, 100);
        assert_eq!(scheduler.on_new_block(1, 99), 0);
        assert_eq!(scheduler.latest_block_number(), Some(100));
    }

    #[tokio::test]
    async fn test_chain_switch_refreshes_keys() {
        let mock = Arc::new(MockAggregator::at(100));
        let (mut scheduler, _handle) = Scheduler::new(mock.clone(), fast_config());

        scheduler.add_listeners(5, &calls(2), 1);
        assert_eq!(scheduler.on_new_block(1, 100), 0);

        assert_eq!(scheduler.on_new_block(5, 100), 1);
        assert_eq!(scheduler.chain_id(), Some(5));
        scheduler.settle_one().await;
        assert_eq!(scheduler.store().chain(5).map(HashMap::len), Some(2));
    }

    #[tokio::test]
    async fn test_run_loop_debounces_listener_churn() {
        let mock = Arc::new(MockAggregator::at(100));
        let (scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let task = tokio::spawn(scheduler.run());
        let watched = calls(3);

        handle.new_block(1, 100).unwrap();
        for call in &watched {
            handle.add_listeners(1, vec![call.clone()], 1).unwrap();
        }

        let mut results = handle.results();
        timeout(
            Duration::from_secs(5),
            results.wait_for(|store| store.chain(1).is_some_and(|chain| chain.len() == 3)),
        )
        .await
        .expect("results in time")
        .unwrap();

        assert_eq!(mock.requests(), vec![3]);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_guard_stops_fetching() {
        let mock = Arc::new(MockAggregator::at(100));
        let (scheduler, handle) = Scheduler::new(mock.clone(), fast_config());
        let task = tokio::spawn(scheduler.run());
        let watched = calls(1);

        handle.new_block(1, 100).unwrap();
        let guard = handle.subscribe(1, watched.clone(), 1).unwrap();

        let mut results = handle.results();
        timeout(
            Duration::from_secs(5),
            results.wait_for(|store| store.len() == 1),
        )
        .await
        .expect("first fetch in time")
        .unwrap();

        drop(guard);
        tokio::time::sleep(Duration::from_millis(60)).await;

        mock.block.store(101, Ordering::SeqCst);
        handle.new_block(1, 101).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(mock.requests().len(), 1);
        assert_eq!(handle.latest_block_number(), Some(101));
        assert_eq!(
            handle.call_result(1, &watched[0]).unwrap().data,
            Some(Bytes::from(watched[0].call_data.clone()))
        );

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_scheduler() {
        let mock = Arc::new(MockAggregator::at(100));
        let (scheduler, handle) = Scheduler::new(mock, fast_config());
        drop(scheduler);

        assert_eq!(handle.new_block(1, 1), Err(MulticallError::SchedulerClosed));
    }
}
