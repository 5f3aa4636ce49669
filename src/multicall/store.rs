//! Result store
//!
//! Authoritative `chain id -> call key -> CallResult` map. Every write is
//! monotonic in block number so out-of-order network completions can never
//! roll a key back to older data.

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

use super::call::CallKey;

/// Latest known state of one call on one chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    /// Last fetched return data. `None` with a block number set means the
    /// fetch failed or returned nothing.
    pub data: Option<Bytes>,
    /// Block that produced `data`
    pub block_number: Option<u64>,
    /// Block targeted by an outstanding fetch
    pub fetching_block_number: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: HashMap<u64, HashMap<CallKey, CallResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chain_id: u64, key: &CallKey) -> Option<&CallResult> {
        self.results.get(&chain_id).and_then(|chain| chain.get(key))
    }

    pub fn chain(&self, chain_id: u64) -> Option<&HashMap<CallKey, CallResult>> {
        self.results.get(&chain_id)
    }

    /// Mark keys as being fetched for `fetching_block_number`. An existing
    /// marker is only raised, never lowered.
    pub fn start_fetch(&mut self, chain_id: u64, keys: &[CallKey], fetching_block_number: u64) {
        let chain = self.results.entry(chain_id).or_default();
        for key in keys {
            let current = chain.entry(key.clone()).or_default();
            if current
                .fetching_block_number
                .is_some_and(|prior| prior >= fetching_block_number)
            {
                continue;
            }
            current.fetching_block_number = Some(fetching_block_number);
        }
    }

    /// Record fetched data. Ignored when the key already holds data from a
    /// newer block. Returns whether the write was applied.
    pub fn commit_success(
        &mut self,
        chain_id: u64,
        key: &CallKey,
        data: Bytes,
        block_number: u64,
    ) -> bool {
        let chain = self.results.entry(chain_id).or_default();
        let current = chain.entry(key.clone()).or_default();

        if current.block_number.is_some_and(|prior| prior > block_number) {
            trace!(%key, block_number, prior = ?current.block_number, "ignoring out-of-order result");
            return false;
        }

        // A fetch targeting a newer block is still outstanding
        let fetching_block_number = current
            .fetching_block_number
            .filter(|&fetching| fetching > block_number);

        *current = CallResult {
            data: Some(data),
            block_number: Some(block_number),
            fetching_block_number,
        };
        true
    }

    /// Record a failed fetch for `at_block_number`. Only keys whose in-flight
    /// marker still targets that block are touched; failures from superseded
    /// fetches are ignored.
    pub fn commit_failure(&mut self, chain_id: u64, keys: &[CallKey], at_block_number: u64) -> usize {
        let Some(chain) = self.results.get_mut(&chain_id) else {
            return 0;
        };

        let mut applied = 0;
        for key in keys {
            let Some(current) = chain.get_mut(key) else {
                continue;
            };
            if current.fetching_block_number != Some(at_block_number) {
                continue;
            }
            current.fetching_block_number = None;
            current.data = None;
            current.block_number = Some(at_block_number);
            applied += 1;
        }
        applied
    }

    /// Drop in-flight markers left by an abandoned fetch for `block_number`
    pub fn release_fetch(&mut self, chain_id: u64, keys: &[CallKey], block_number: u64) {
        let Some(chain) = self.results.get_mut(&chain_id) else {
            return;
        };
        for key in keys {
            if let Some(current) = chain.get_mut(key) {
                if current.fetching_block_number == Some(block_number) {
                    current.fetching_block_number = None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
