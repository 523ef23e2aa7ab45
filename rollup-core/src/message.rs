// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, B256, Bytes, address};
use thiserror::Error;

use crate::application::TxError;
use crate::transaction::{Transaction, TxDecodeError};

/// Parent-chain message kinds.
pub mod kind {
    pub const L2_MESSAGE: u8 = 3;
    pub const END_OF_BLOCK: u8 = 6;
    pub const L2_FUNDED_BY_L1: u8 = 7;
    pub const ROLLUP_EVENT: u8 = 8;
    pub const SUBMIT_RETRYABLE: u8 = 9;
    pub const BATCH_FOR_GAS_ESTIMATION: u8 = 10;
    pub const INITIALIZE: u8 = 11;
    pub const ETH_DEPOSIT: u8 = 12;
    pub const BATCH_POSTING_REPORT: u8 = 13;
    pub const INVALID: u8 = 0xff;
}

/// Kinds of the payload carried inside an `L2_MESSAGE`.
pub mod l2_kind {
    pub const BATCH: u8 = 3;
    pub const SIGNED_TX: u8 = 4;
}

pub const BATCH_POSTER_ADDRESS: Address = address!("a4b000000000000000000073657175656e636572");
pub const MAX_L2_MESSAGE_SIZE: usize = 256 * 1024;
const MAX_BATCH_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("l2message too long")]
    TooLong,
    #[error("message kind {kind} carries no transactions")]
    NotL2Message { kind: u8 },
    #[error("empty l2 message")]
    Empty,
    #[error("unsupported l2 message kind {kind}")]
    UnsupportedL2Kind { kind: u8 },
    #[error("l2 message batch nested too deep")]
    BatchTooDeep,
    #[error("truncated l2 message batch segment")]
    TruncatedSegment,
    #[error("invalid transaction in l2 message")]
    Transaction {
        #[source]
        source: TxDecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: u8,
    pub poster: Address,
    pub block_number: u64,
    pub timestamp: u64,
    // Present only for delayed messages; encodes the delayed sequence number.
    pub request_id: Option<B256>,
}

impl MessageHeader {
    pub fn sequencer(l1_block_number: u64, timestamp: u64) -> Self {
        Self {
            kind: kind::L2_MESSAGE,
            poster: BATCH_POSTER_ADDRESS,
            block_number: l1_block_number,
            timestamp,
            request_id: None,
        }
    }

    pub fn delayed_sequence_number(&self) -> Option<u64> {
        self.request_id.map(|id| {
            let mut word = [0_u8; 8];
            word.copy_from_slice(&id[24..32]);
            u64::from_be_bytes(word)
        })
    }

    pub fn request_id_for(delayed_sequence_number: u64) -> B256 {
        let mut id = B256::ZERO;
        id[24..32].copy_from_slice(&delayed_sequence_number.to_be_bytes());
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub l2_msg: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithMetadata {
    pub message: Message,
    pub delayed_messages_read: u64,
}

/// Builds the sequencer message for one executed batch. Transactions whose result is an
/// error are left out; a lone successful transaction skips the batch framing.
pub fn message_from_txes(
    header: MessageHeader,
    txs: &[Transaction],
    results: &[Result<(), TxError>],
) -> Result<Message, MessageError> {
    let mut l2_msg = Vec::new();
    if results.len() == 1 && results[0].is_ok() {
        let tx = &txs[0];
        l2_msg.reserve(1 + tx.encoded_len());
        l2_msg.push(l2_kind::SIGNED_TX);
        l2_msg.extend_from_slice(tx.encoded());
    } else {
        l2_msg.push(l2_kind::BATCH);
        for (tx, result) in txs.iter().zip(results) {
            if result.is_err() {
                continue;
            }
            let segment_len = (tx.encoded_len() as u64).saturating_add(1);
            l2_msg.extend_from_slice(&segment_len.to_be_bytes());
            l2_msg.push(l2_kind::SIGNED_TX);
            l2_msg.extend_from_slice(tx.encoded());
        }
    }
    if l2_msg.len() > MAX_L2_MESSAGE_SIZE {
        return Err(MessageError::TooLong);
    }
    Ok(Message {
        header,
        l2_msg: l2_msg.into(),
    })
}

pub fn parse_l2_transactions(message: &Message) -> Result<Vec<Transaction>, MessageError> {
    if message.header.kind != kind::L2_MESSAGE {
        return Err(MessageError::NotL2Message {
            kind: message.header.kind,
        });
    }
    let mut out = Vec::new();
    parse_l2_payload(message.l2_msg.as_ref(), 0, &mut out)?;
    Ok(out)
}

fn parse_l2_payload(
    payload: &[u8],
    depth: usize,
    out: &mut Vec<Transaction>,
) -> Result<(), MessageError> {
    let (&payload_kind, mut rest) = payload.split_first().ok_or(MessageError::Empty)?;
    match payload_kind {
        l2_kind::SIGNED_TX => {
            let tx = Transaction::decode(rest)
                .map_err(|source| MessageError::Transaction { source })?;
            out.push(tx);
            Ok(())
        }
        l2_kind::BATCH => {
            if depth >= MAX_BATCH_DEPTH {
                return Err(MessageError::BatchTooDeep);
            }
            while !rest.is_empty() {
                if rest.len() < 8 {
                    return Err(MessageError::TruncatedSegment);
                }
                let (len_bytes, tail) = rest.split_at(8);
                let mut word = [0_u8; 8];
                word.copy_from_slice(len_bytes);
                let segment_len = usize::try_from(u64::from_be_bytes(word))
                    .map_err(|_| MessageError::TruncatedSegment)?;
                if segment_len > tail.len() {
                    return Err(MessageError::TruncatedSegment);
                }
                let (segment, next) = tail.split_at(segment_len);
                parse_l2_payload(segment, depth + 1, out)?;
                rest = next;
            }
            Ok(())
        }
        other => Err(MessageError::UnsupportedL2Kind { kind: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{NonceError, TxError};
    use crate::transaction::{LEGACY_TX_TYPE, TxBody};
    use alloy_primitives::U256;

    fn tx(nonce: u64, data_len: usize) -> Transaction {
        Transaction::new(
            LEGACY_TX_TYPE,
            TxBody {
                sender: Address::repeat_byte(0x01),
                nonce,
                gas_limit: 100_000,
                max_fee_per_gas: 1,
                to: Address::ZERO,
                value: U256::ZERO,
                data: vec![0x5a; data_len].into(),
            },
        )
    }

    #[test]
    fn single_successful_tx_uses_signed_tx_fast_path() {
        let txs = vec![tx(0, 3)];
        let message = message_from_txes(MessageHeader::sequencer(1, 2), &txs, &[Ok(())])
            .expect("build message");

        assert_eq!(message.l2_msg[0], l2_kind::SIGNED_TX);
        assert_eq!(&message.l2_msg[1..], txs[0].encoded().as_ref());
        assert_eq!(parse_l2_transactions(&message).expect("parse"), txs);
    }

    #[test]
    fn batch_path_skips_failed_transactions() {
        let txs = vec![tx(0, 1), tx(1, 2), tx(2, 3)];
        let failed = TxError::Nonce(NonceError {
            sender: Address::repeat_byte(0x01),
            tx_nonce: 1,
            state_nonce: 0,
        });
        let results = vec![Ok(()), Err(failed), Ok(())];
        let message = message_from_txes(MessageHeader::sequencer(1, 2), &txs, &results)
            .expect("build message");

        assert_eq!(message.l2_msg[0], l2_kind::BATCH);
        let parsed = parse_l2_transactions(&message).expect("parse");
        assert_eq!(parsed, vec![txs[0].clone(), txs[2].clone()]);
    }

    #[test]
    fn lone_failed_tx_still_uses_batch_framing() {
        let txs = vec![tx(0, 1)];
        let results = vec![Err(TxError::GasLimitReached)];
        let message = message_from_txes(MessageHeader::sequencer(1, 2), &txs, &results)
            .expect("build message");
        assert_eq!(message.l2_msg.as_ref(), &[l2_kind::BATCH]);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let txs: Vec<_> = (0..4).map(|nonce| tx(nonce, 70_000)).collect();
        let results = vec![Ok(()); 4];
        assert_eq!(
            message_from_txes(MessageHeader::sequencer(1, 2), &txs, &results),
            Err(MessageError::TooLong)
        );
    }

    #[test]
    fn truncated_batch_segment_is_rejected() {
        let message = Message {
            header: MessageHeader::sequencer(0, 0),
            l2_msg: vec![l2_kind::BATCH, 0, 0, 0, 0, 0, 0, 0, 9, l2_kind::SIGNED_TX].into(),
        };
        assert_eq!(
            parse_l2_transactions(&message),
            Err(MessageError::TruncatedSegment)
        );
    }

    #[test]
    fn delayed_sequence_number_round_trips_through_request_id() {
        let mut header = MessageHeader::sequencer(0, 0);
        assert_eq!(header.delayed_sequence_number(), None);
        header.request_id = Some(MessageHeader::request_id_for(42));
        assert_eq!(header.delayed_sequence_number(), Some(42));
    }
}
