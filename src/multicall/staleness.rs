//! Staleness resolver
//!
//! Pure function deciding which listened keys need a fetch at the latest block.

use std::collections::HashMap;

use super::call::CallKey;
use super::store::ResultStore;

/// Keys whose data is older than their freshness window allows.
///
/// With required freshness `b`, a key is fresh enough when its data (or an
/// in-flight fetch) targets a block `>= latest - b + 1`. The output is sorted.
pub fn outdated_listening_keys(
    store: &ResultStore,
    listening_keys: &HashMap<CallKey, u64>,
    chain_id: Option<u64>,
    latest_block_number: Option<u64>,
) -> Vec<CallKey> {
    let (Some(chain_id), Some(latest_block_number)) = (chain_id, latest_block_number) else {
        return Vec::new();
    };

    let mut outdated: Vec<CallKey> = match store.chain(chain_id) {
        // Nothing fetched on this chain yet
        None => listening_keys.keys().cloned().collect(),
        Some(results) => listening_keys
            .iter()
            .filter(|&(key, &blocks_per_fetch)| {
                let Some(result) = results.get(key) else {
                    return true;
                };

                let min_data_block_number =
                    latest_block_number.saturating_sub(blocks_per_fetch.saturating_sub(1));

                if result
                    .fetching_block_number
                    .is_some_and(|fetching| fetching >= min_data_block_number)
                {
                    return false;
                }

                result
                    .block_number
                    .map_or(true, |block_number| block_number < min_data_block_number)
            })
            .map(|(key, _)| key.clone())
            .collect(),
    };

    outdated.sort();
    outdated
}
