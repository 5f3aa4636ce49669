//! Consumer view of a cached call result

use alloy_primitives::Bytes;
use alloy_sol_types::SolCall;

use super::store::CallResult;

/// What a consumer sees for one call at the latest block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallState {
    /// The call could be built (address and inputs were valid)
    pub valid: bool,
    /// No result has been fetched yet
    pub loading: bool,
    /// A result exists but was read before the latest block
    pub syncing: bool,
    /// The last fetch failed or returned nothing
    pub error: bool,
    /// Raw return data of a successful fetch
    pub data: Option<Bytes>,
    /// Block the data was read at
    pub block_number: Option<u64>,
}

/// Decoded variant of `CallState`
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCallState<R> {
    pub valid: bool,
    pub loading: bool,
    pub syncing: bool,
    pub error: bool,
    pub result: Option<R>,
    pub block_number: Option<u64>,
}

impl CallState {
    pub const INVALID: CallState = CallState {
        valid: false,
        loading: false,
        syncing: false,
        error: false,
        data: None,
        block_number: None,
    };

    pub const LOADING: CallState = CallState {
        valid: true,
        loading: true,
        syncing: false,
        error: false,
        data: None,
        block_number: None,
    };

    pub fn from_result(result: Option<&CallResult>, latest_block_number: Option<u64>) -> Self {
        let Some(result) = result else {
            return Self::LOADING;
        };
        let Some(block_number) = result.block_number else {
            return Self::LOADING;
        };
        let Some(latest_block_number) = latest_block_number else {
            return Self::LOADING;
        };

        // "0x" is as good as no data
        let data = result.data.clone().filter(|data| !data.is_empty());

        CallState {
            valid: true,
            loading: false,
            syncing: block_number < latest_block_number,
            error: data.is_none(),
            data,
            block_number: Some(block_number),
        }
    }

    /// Decode the return data as the outputs of `C`. Undecodable data is
    /// reported as an error.
    pub fn decode<C: SolCall>(&self) -> DecodedCallState<C::Return> {
        let result = self
            .data
            .as_ref()
            .and_then(|data| C::abi_decode_returns(data).ok());

        DecodedCallState {
            valid: self.valid,
            loading: self.loading,
            syncing: self.syncing,
            error: self.error || (self.data.is_some() && result.is_none()),
            result,
            block_number: self.block_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use alloy_sol_types::sol;

    sol! {
        function totalSupply() external view returns (uint256);
    }

    fn fetched(data: Option<Vec<u8>>, block_number: u64) -> CallResult {
        CallResult {
            data: data.map(Bytes::from),
            block_number: Some(block_number),
            fetching_block_number: None,
        }
    }

    #[test]
    fn test_loading_states() {
        assert_eq!(CallState::from_result(None, Some(10)), CallState::LOADING);

        let in_flight = CallResult {
            fetching_block_number: Some(10),
            ..Default::default()
        };
        assert_eq!(CallState::from_result(Some(&in_flight), Some(10)), CallState::LOADING);

        let result = fetched(Some(vec![1]), 10);
        assert_eq!(CallState::from_result(Some(&result), None), CallState::LOADING);
    }

    #[test]
    fn test_current_and_syncing() {
        let result = fetched(Some(vec![1]), 10);

        let current = CallState::from_result(Some(&result), Some(10));
        assert!(current.valid && !current.loading && !current.syncing && !current.error);

        let behind = CallState::from_result(Some(&result), Some(12));
        assert!(behind.syncing);
        assert_eq!(behind.data, Some(Bytes::from(vec![1])));
    }

    #[test]
    fn test_error_states() {
        let failed = fetched(None, 10);
        assert!(CallState::from_result(Some(&failed), Some(10)).error);

        let empty = fetched(Some(vec![]), 10);
        let state = CallState::from_result(Some(&empty), Some(10));
        assert!(state.error);
        assert_eq!(state.data, None);
    }

    #[test]
    fn test_decode() {
        let supply = U256::from(1_000_000u64);
        let result = fetched(Some(supply.to_be_bytes::<32>().to_vec()), 10);

        let decoded = CallState::from_result(Some(&result), Some(10)).decode::<totalSupplyCall>();
        assert!(!decoded.error);
        assert_eq!(decoded.result, Some(supply));
    }

    #[test]
    fn test_decode_failure_is_error() {
        let result = fetched(Some(vec![0x01, 0x02]), 10);

        let decoded = CallState::from_result(Some(&result), Some(10)).decode::<totalSupplyCall>();
        assert!(decoded.error);
        assert_eq!(decoded.result, None);
    }
}
