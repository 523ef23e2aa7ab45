// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Chain data types shared by the sequencer and the execution engine: transactions,
//! sequenced messages, blocks, and the state-transition interface they are executed with.
pub mod application;
pub mod block;
pub mod message;
pub mod transaction;
