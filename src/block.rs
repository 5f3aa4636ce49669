//! Block-height source
//!
//! Polls the node for its head block and forwards every increase to the
//! scheduler. A failed poll is logged and simply retried on the next tick.

use alloy_provider::{DynProvider, Provider};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{MulticallError, Result};
use crate::multicall::aggregate::classify_transport_error;
use crate::multicall::SchedulerHandle;

/// Anything that can report the current head block
pub trait BlockSource: Send + Sync + 'static {
    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send;
}

impl BlockSource for DynProvider {
    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send {
        async move {
            self.get_block_number()
                .await
                .map_err(classify_transport_error)
        }
    }
}

pub struct BlockWatcher<S: BlockSource> {
    source: S,
    chain_id: u64,
    interval: Duration,
}

impl<S: BlockSource> BlockWatcher<S> {
    pub fn new(source: S, chain_id: u64, interval: Duration) -> Self {
        Self {
            source,
            chain_id,
            interval,
        }
    }

    /// Poll until the scheduler goes away
    pub async fn run(self, handle: SchedulerHandle) {
        info!(
            chain_id = self.chain_id,
            interval_ms = self.interval.as_millis() as u64,
            "block watcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seen: Option<u64> = None;

        loop {
            ticker.tick().await;
            if handle.is_closed() {
                info!("scheduler closed, block watcher stopping");
                return;
            }

            let block_number = match self.source.block_number().await {
                Ok(block_number) => block_number,
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "failed to poll block number");
                    continue;
                }
            };

            if last_seen.is_some_and(|last| block_number <= last) {
                continue;
            }
            last_seen = Some(block_number);
            debug!(chain_id = self.chain_id, block_number, "new block");

            if let Err(MulticallError::SchedulerClosed) =
                handle.new_block(self.chain_id, block_number)
            {
                info!("scheduler closed, block watcher stopping");
                return;
            }
        }
    }
}
