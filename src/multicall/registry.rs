//! Listener registry
//!
//! Reference-counts consumers per chain, per call key and per freshness tier
//! (`blocks_per_fetch`). The tightest active tier of a key decides how often
//! it is refetched.

use std::collections::{BTreeMap, HashMap};

use super::call::{Call, CallKey};

/// Default freshness: refetch on every block
pub const DEFAULT_BLOCKS_PER_FETCH: u64 = 1;

/// chain id -> call key -> blocks_per_fetch -> listener count
#[derive(Debug, Default, Clone)]
pub struct ListenerRegistry {
    listeners: HashMap<u64, HashMap<CallKey, BTreeMap<u64, u32>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listeners(&mut self, chain_id: u64, calls: &[Call], blocks_per_fetch: u64) {
        let chain = self.listeners.entry(chain_id).or_default();
        for call in calls {
            *chain
                .entry(call.key())
                .or_default()
                .entry(blocks_per_fetch)
                .or_insert(0) += 1;
        }
    }

    /// Decrement the matching counters. Unknown entries are ignored and a
    /// counter that reaches zero is removed.
    pub fn remove_listeners(&mut self, chain_id: u64, calls: &[Call], blocks_per_fetch: u64) {
        let Some(chain) = self.listeners.get_mut(&chain_id) else {
            return;
        };

        for call in calls {
            let key = call.key();
            let Some(tiers) = chain.get_mut(&key) else {
                continue;
            };
            let Some(count) = tiers.get_mut(&blocks_per_fetch) else {
                continue;
            };

            if *count <= 1 {
                tiers.remove(&blocks_per_fetch);
            } else {
                *count -= 1;
            }

            if tiers.is_empty() {
                chain.remove(&key);
            }
        }

        if chain.is_empty() {
            self.listeners.remove(&chain_id);
        }
    }

    /// Every call key with at least one live tier, mapped to its minimum
    /// `blocks_per_fetch`. A zero tier is invalid and never counts.
    pub fn active_listening_keys(&self, chain_id: u64) -> HashMap<CallKey, u64> {
        let Some(chain) = self.listeners.get(&chain_id) else {
            return HashMap::new();
        };

        chain
            .iter()
            .filter_map(|(key, tiers)| {
                tiers
                    .iter()
                    .filter(|&(&blocks_per_fetch, &count)| blocks_per_fetch > 0 && count > 0)
                    .map(|(&blocks_per_fetch, _)| blocks_per_fetch)
                    .min()
                    .map(|min| (key.clone(), min))
            })
            .collect()
    }

    /// Listener count for a single tier
    pub fn listener_count(&self, chain_id: u64, key: &CallKey, blocks_per_fetch: u64) -> u32 {
        self.listeners
            .get(&chain_id)
            .and_then(|chain| chain.get(key))
            .and_then(|tiers| tiers.get(&blocks_per_fetch))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
