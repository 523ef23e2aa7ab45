// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Follows the parent chain head so the sequencer can stamp messages with a recent L1 block
//! and refuse to build when its view of L1 is stale.

mod reader;

pub use reader::{
    HeaderReader, HeaderReaderConfig, HeaderReaderError, HeaderReaderHandle, ParentChainHeader,
};
