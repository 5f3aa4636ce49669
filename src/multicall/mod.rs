//! Multicall read scheduler
//!
//! Consumers register interest in contract reads through a `SchedulerHandle`.
//! The scheduler batches every stale read into chunked Multicall `aggregate`
//! calls once per block and publishes results through a `watch` channel.

pub mod aggregate;
pub mod call;
pub mod registry;
pub mod scheduler;
pub mod staleness;
pub mod state;
pub mod store;

pub use aggregate::{fetch_chunk, AggregateResult, Aggregator, RpcAggregator, MULTICALL3};
pub use call::{Call, CallKey};
pub use registry::{ListenerRegistry, DEFAULT_BLOCKS_PER_FETCH};
pub use scheduler::{
    chunk_calls, ListenerGuard, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle,
};
pub use staleness::outdated_listening_keys;
pub use state::{CallState, DecodedCallState};
pub use store::{CallResult, ResultStore};
