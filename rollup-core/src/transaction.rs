// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_sol_types::{SolValue, sol};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::StateView;

pub const LEGACY_TX_TYPE: u8 = 0x00;
pub const ACCESS_LIST_TX_TYPE: u8 = 0x01;
pub const DYNAMIC_FEE_TX_TYPE: u8 = 0x02;
pub const BLOB_TX_TYPE: u8 = 0x03;
pub const SET_CODE_TX_TYPE: u8 = 0x04;
// Every type at or above this value is reserved for chain-internal transactions.
pub const CHAIN_INTERNAL_TX_TYPE_FLOOR: u8 = 0x64;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct TxBody {
        address sender;
        uint64 nonce;
        uint64 gas_limit;
        uint64 max_fee_per_gas;
        address to;
        uint256 value;
        bytes data;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxDecodeError {
    #[error("empty transaction encoding")]
    Empty,
    #[error("invalid transaction body: {reason}")]
    Body { reason: String },
}

/// A transaction as admitted by the sequencer.
///
/// The encoding is cached at construction: batch accounting, hashing and message building
/// all read it on the hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    tx_type: u8,
    body: TxBody,
    encoded: Bytes,
    hash: B256,
}

impl Transaction {
    pub fn new(tx_type: u8, body: TxBody) -> Self {
        let mut encoded = Vec::with_capacity(1 + 32 * 9 + body.data.len());
        encoded.push(tx_type);
        encoded.extend_from_slice(body.abi_encode().as_slice());
        let hash = keccak256(encoded.as_slice());
        Self {
            tx_type,
            body,
            encoded: encoded.into(),
            hash,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TxDecodeError> {
        let (&tx_type, rest) = bytes.split_first().ok_or(TxDecodeError::Empty)?;
        let body = <TxBody as SolValue>::abi_decode(rest).map_err(|err| TxDecodeError::Body {
            reason: err.to_string(),
        })?;
        // The hash and the data budget are computed over the canonical encoding, so it must
        // be exactly what was received.
        let tx = Self::new(tx_type, body);
        if tx.encoded.as_ref() != bytes {
            return Err(TxDecodeError::Body {
                reason: format!(
                    "non-canonical encoding: got {} bytes, canonical form has {}",
                    bytes.len(),
                    tx.encoded.len()
                ),
            });
        }
        Ok(tx)
    }

    pub fn tx_type(&self) -> u8 {
        self.tx_type
    }

    pub fn body(&self) -> &TxBody {
        &self.body
    }

    pub fn sender(&self) -> Address {
        self.body.sender
    }

    pub fn nonce(&self) -> u64 {
        self.body.nonce
    }

    pub fn gas_limit(&self) -> u64 {
        self.body.gas_limit
    }

    pub fn value(&self) -> U256 {
        self.body.value
    }

    pub fn data(&self) -> &[u8] {
        self.body.data.as_ref()
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// Size counted against the per-batch data budget.
    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_type_supported(&self) -> bool {
        is_tx_type_supported(self.tx_type)
    }
}

pub fn is_tx_type_supported(tx_type: u8) -> bool {
    match tx_type {
        LEGACY_TX_TYPE | ACCESS_LIST_TX_TYPE | DYNAMIC_FEE_TX_TYPE | SET_CODE_TX_TYPE => true,
        BLOB_TX_TYPE => false,
        other => other < CHAIN_INTERNAL_TX_TYPE_FLOOR,
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalError {
    #[error("BlockNumberMin condition not met")]
    BlockNumberMin,
    #[error("BlockNumberMax condition not met")]
    BlockNumberMax,
    #[error("TimestampMin condition not met")]
    TimestampMin,
    #[error("TimestampMax condition not met")]
    TimestampMax,
    #[error("KnownNonce condition not met for {address}: expected {expected}, found {found}")]
    KnownNonce {
        address: Address,
        expected: u64,
        found: u64,
    },
}

/// Preconditions a submitter attaches to a transaction. Checked against the parent-chain
/// block number and the timestamp of the block being built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub known_nonces: BTreeMap<Address, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number_max: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_max: Option<u64>,
}

impl ConditionalOptions {
    pub fn check(
        &self,
        l1_block_number: u64,
        timestamp: u64,
        state: &dyn StateView,
    ) -> Result<(), ConditionalError> {
        if self.block_number_min.is_some_and(|min| l1_block_number < min) {
            return Err(ConditionalError::BlockNumberMin);
        }
        if self.block_number_max.is_some_and(|max| l1_block_number > max) {
            return Err(ConditionalError::BlockNumberMax);
        }
        if self.timestamp_min.is_some_and(|min| timestamp < min) {
            return Err(ConditionalError::TimestampMin);
        }
        if self.timestamp_max.is_some_and(|max| timestamp > max) {
            return Err(ConditionalError::TimestampMax);
        }
        for (&address, &expected) in &self.known_nonces {
            let found = state.nonce(address);
            if found != expected {
                return Err(ConditionalError::KnownNonce {
                    address,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}
