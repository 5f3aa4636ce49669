//! Call descriptors and their canonical string keys
//!
//! A call key is `"{address}-{callData}"`, e.g.
//! `0x6B175474E89094c44DA98b954EEDcdECb5be3830-0x18160ddd`.
//! Keys are used for deduplication and as map keys in the registry and store.

use alloy_primitives::{hex, Address, Bytes};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{MulticallError, Result};

/// One read against one contract with one ABI-encoded input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Call {
    pub address: Address,
    pub call_data: Bytes,
}

impl Call {
    pub fn new(address: Address, call_data: impl Into<Bytes>) -> Self {
        Self {
            address,
            call_data: call_data.into(),
        }
    }

    /// Build a call from a `sol!`-generated call struct
    pub fn from_sol<C: SolCall>(address: Address, call: &C) -> Self {
        Self::new(address, call.abi_encode())
    }

    pub fn key(&self) -> CallKey {
        CallKey(format!(
            "{}-{}",
            self.address.to_checksum(None),
            hex::encode_prefixed(&self.call_data)
        ))
    }
}

/// Canonical string form of a `Call`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallKey(String);

impl CallKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the call this key was built from
    pub fn parse(&self) -> Result<Call> {
        parse_call_key(&self.0)
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CallKey {
    type Err = MulticallError;

    /// Accepts any well-formed key and re-encodes it canonically
    fn from_str(s: &str) -> Result<Self> {
        parse_call_key(s).map(|call| call.key())
    }
}

impl From<&Call> for CallKey {
    fn from(call: &Call) -> Self {
        call.key()
    }
}

fn is_hex_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_call_key(key: &str) -> Result<Call> {
    let invalid = || MulticallError::InvalidCallKey(key.to_string());

    let (address, call_data) = key.split_once('-').ok_or_else(invalid)?;

    let address_digits = address.strip_prefix("0x").ok_or_else(invalid)?;
    if address_digits.len() != 40 || !is_hex_digits(address_digits) {
        return Err(invalid());
    }

    let data_digits = call_data.strip_prefix("0x").ok_or_else(invalid)?;
    if data_digits.len() % 2 != 0 || !is_hex_digits(data_digits) {
        return Err(invalid());
    }

    let address = Address::from_str(address).map_err(|_| invalid())?;
    let call_data = hex::decode(data_digits).map_err(|_| invalid())?;

    Ok(Call::new(address, call_data))
}

// ============================================
// TESTS
// ============================================
