//! Aggregate-call adapter
//!
//! One `eth_call` to the Multicall `aggregate` method per chunk of calls.
//! The contract returns the block it read at plus one return blob per call,
//! in order.

use alloy_primitives::{address, Address, Bytes};
use alloy_provider::{DynProvider, Provider};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::{sol, SolCall};
use alloy_transport::{RpcError, TransportError};
use std::future::Future;
use tracing::{debug, trace};

use super::call::Call;
use crate::error::{MulticallError, Result};

// ============================================
// MULTICALL INTERFACE
// ============================================

sol! {
    /// Multicall `aggregate` - also served by Multicall2 and Multicall3
    interface IMulticall {
        struct Call {
            address target;
            bytes callData;
        }

        function aggregate(Call[] calldata calls)
            external returns (uint256 blockNumber, bytes[] memory returnData);
    }
}

/// Multicall3 address (same on all EVM chains)
pub const MULTICALL3: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// JSON-RPC error codes that signal a transient node condition
const TRANSIENT_RPC_CODES: &[i64] = &[
    429,    // rate limited (some providers)
    -32005, // limit exceeded
    -32603, // internal error
];

// ============================================
// TYPES
// ============================================

/// Result of one aggregate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    /// Block the results were read at
    pub block_number: u64,
    /// Return data in call order
    pub return_data: Vec<Bytes>,
}

/// Anything that can execute a batch of read calls in one round trip
pub trait Aggregator: Send + Sync + 'static {
    fn aggregate(&self, calls: Vec<Call>) -> impl Future<Output = Result<AggregateResult>> + Send;
}

/// Split transport failures into retryable and fatal
pub(crate) fn classify_transport_error(err: TransportError) -> MulticallError {
    match err {
        RpcError::ErrorResp(payload) if !TRANSIENT_RPC_CODES.contains(&payload.code) => {
            MulticallError::Fatal(format!("rpc error {}: {}", payload.code, payload.message))
        }
        other => MulticallError::Retryable(other.to_string()),
    }
}

pub(crate) fn encode_aggregate(calls: &[Call]) -> Vec<u8> {
    let calls = calls
        .iter()
        .map(|call| IMulticall::Call {
            target: call.address,
            callData: call.call_data.clone(),
        })
        .collect();
    IMulticall::aggregateCall { calls }.abi_encode()
}

pub(crate) fn decode_aggregate(data: &[u8], expected_len: usize) -> Result<AggregateResult> {
    let decoded = IMulticall::aggregateCall::abi_decode_returns(data)
        .map_err(|e| MulticallError::Fatal(format!("failed to decode multicall result: {}", e)))?;

    if decoded.returnData.len() != expected_len {
        return Err(MulticallError::Fatal(format!(
            "multicall returned {} results for {} calls",
            decoded.returnData.len(),
            expected_len
        )));
    }

    Ok(AggregateResult {
        block_number: decoded.blockNumber.saturating_to::<u64>(),
        return_data: decoded.returnData,
    })
}

// ============================================
// RPC AGGREGATOR
// ============================================

/// `Aggregator` backed by an alloy provider and a deployed Multicall contract
#[derive(Clone)]
pub struct RpcAggregator {
    provider: DynProvider,
    multicall_address: Address,
}

impl RpcAggregator {
    pub fn new(provider: DynProvider, multicall_address: Address) -> Self {
        Self {
            provider,
            multicall_address,
        }
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall_address
    }
}

impl Aggregator for RpcAggregator {
    fn aggregate(&self, calls: Vec<Call>) -> impl Future<Output = Result<AggregateResult>> + Send {
        async move {
            let expected_len = calls.len();
            let tx = TransactionRequest::default()
                .to(self.multicall_address)
                .input(encode_aggregate(&calls).into());

            let raw = self
                .provider
                .call(tx)
                .await
                .map_err(classify_transport_error)?;

            trace!(calls = expected_len, bytes = raw.len(), "aggregate returned");
            decode_aggregate(&raw, expected_len)
        }
    }
}

/// Fetch one chunk, rejecting results read at a block older than
/// `min_block_number` so a lagging node gets retried instead of trusted.
pub async fn fetch_chunk<A: Aggregator>(
    aggregator: &A,
    chunk: Vec<Call>,
    min_block_number: u64,
) -> Result<AggregateResult> {
    debug!(calls = chunk.len(), min_block_number, "fetching chunk");

    let result = aggregator.aggregate(chunk).await?;

    if result.block_number < min_block_number {
        debug!(
            fetched = result.block_number,
            min_block_number, "fetched results for old block number"
        );
        return Err(MulticallError::Retryable(format!(
            "fetched for old block number {} < {}",
            result.block_number, min_block_number
        )));
    }

    Ok(result)
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBlock(u64);

    impl Aggregator for FixedBlock {
        fn aggregate(&self, calls: Vec<Call>) -> impl Future<Output = Result<AggregateResult>> + Send {
            let block_number = self.0;
            async move {
                Ok(AggregateResult {
                    block_number,
                    return_data: calls.into_iter().map(|c| c.call_data).collect(),
                })
            }
        }
    }

    fn calls() -> Vec<Call> {
        vec![
            Call::new(Address::repeat_byte(1), vec![0x18, 0x16, 0x0d, 0xdd]),
            Call::new(Address::repeat_byte(2), vec![0x31, 0x3c, 0xe5, 0x67]),
        ]
    }

    #[test]
    fn test_aggregate_selector() {
        let data = encode_aggregate(&calls());
        assert_eq!(&data[..4], &IMulticall::aggregateCall::SELECTOR);
        assert_eq!(hex_selector(&data), "252dba42");
    }

    fn hex_selector(data: &[u8]) -> String {
        alloy_primitives::hex::encode(&data[..4])
    }

    #[test]
    fn test_decode_garbage_is_fatal() {
        let err = decode_aggregate(&[0xde, 0xad], 1).unwrap_err();
        assert!(matches!(err, MulticallError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_fetch_chunk_accepts_current_block() {
        let result = fetch_chunk(&FixedBlock(100), calls(), 100).await.unwrap();
        assert_eq!(result.block_number, 100);
        assert_eq!(result.return_data.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_chunk_accepts_newer_block() {
        let result = fetch_chunk(&FixedBlock(102), calls(), 100).await.unwrap();
        assert_eq!(result.block_number, 102);
    }

    #[tokio::test]
    async fn test_fetch_chunk_rejects_lagging_node() {
        let err = fetch_chunk(&FixedBlock(99), calls(), 100).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
