// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, B256, keccak256};
use alloy_sol_types::{SolValue, sol};

use crate::transaction::Transaction;

sol! {
    struct SealedHeaderFields {
        uint64 number;
        bytes32 parent_hash;
        uint64 timestamp;
        uint64 l1_block_number;
        uint64 delayed_messages_read;
        uint64 gas_used;
        bytes32 state_root;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub l1_block_number: u64,
    // Count of delayed messages consumed up to and including this block.
    pub delayed_messages_read: u64,
    pub gas_used: u64,
    pub state_root: B256,
}

impl BlockHeader {
    pub fn compute_hash(&self) -> B256 {
        let fields = SealedHeaderFields {
            number: self.number,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
            l1_block_number: self.l1_block_number,
            delayed_messages_read: self.delayed_messages_read,
            gas_used: self.gas_used,
            state_root: self.state_root,
        };
        keccak256(fields.abi_encode())
    }

    /// Fills `hash` from the other fields.
    pub fn seal(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }

    pub fn genesis(number: u64, timestamp: u64) -> Self {
        Self {
            number,
            hash: B256::ZERO,
            parent_hash: B256::ZERO,
            timestamp,
            l1_block_number: 0,
            delayed_messages_read: 0,
            gas_used: 0,
            state_root: B256::ZERO,
        }
        .seal()
    }

    pub fn message_result(&self) -> MessageResult {
        MessageResult {
            block_hash: self.hash,
            send_root: self.state_root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub sender: Address,
    pub status: ReceiptStatus,
    pub gas_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Identity of one in-progress block build, minted by the execution engine and compared
/// by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildToken(pub u64);

/// What the state transition knows about the block it is about to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub l1_block_number: u64,
    pub delayed_messages_read: u64,
    pub token: BuildToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageResult {
    pub block_hash: B256,
    pub send_root: B256,
}
