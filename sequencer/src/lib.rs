// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Rollup sequencer node.
//!
//! Flow: publish -> sequencer block loop -> execution engine -> consensus log -> chain.
//! The execution engine is the single writer that defines the canonical order; a node that is
//! not the active sequencer forwards what it receives.
pub mod execution;
pub mod forwarder;
pub mod l1_reader;
pub mod sequencer;
pub mod storage;
