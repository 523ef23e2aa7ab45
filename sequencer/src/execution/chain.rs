// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::Address;
use rollup_core::application::StateView;
use rollup_core::block::{Block, BlockHeader};

use super::ChainError;
use crate::storage::{Storage, StoredChain};

/// Blocks kept in memory by default. Older blocks are served from storage.
pub const DEFAULT_RETAINED_BLOCKS: usize = 4096;

struct ChainInner {
    genesis_number: u64,
    // The most recent blocks, ascending and never empty.
    blocks: VecDeque<Block>,
    // address -> (block number -> nonce after that block). Changes from blocks below the
    // window are collapsed into a single entry.
    nonces: HashMap<Address, BTreeMap<u64, u64>>,
}

impl ChainInner {
    fn from_stored(genesis_number: u64, stored: StoredChain) -> Self {
        let mut inner = Self {
            genesis_number,
            blocks: VecDeque::with_capacity(stored.blocks.len()),
            nonces: HashMap::new(),
        };
        let below_window = stored
            .blocks
            .first()
            .map_or(genesis_number, |first| first.block.header.number)
            .saturating_sub(1);
        for (address, nonce) in stored.base_nonces {
            inner
                .nonces
                .insert(address, BTreeMap::from([(below_window, nonce)]));
        }
        for entry in stored.blocks {
            inner.record_nonces(entry.block.header.number, &entry.nonce_changes);
            inner.blocks.push_back(entry.block);
        }
        inner
    }

    fn head(&self) -> &Block {
        self.blocks.back().expect("chain always holds a block")
    }

    fn first_retained(&self) -> u64 {
        self.blocks
            .front()
            .expect("chain always holds a block")
            .header
            .number
    }

    fn offset(&self, number: u64) -> Option<usize> {
        let offset = usize::try_from(number.checked_sub(self.first_retained())?).ok()?;
        (offset < self.blocks.len()).then_some(offset)
    }

    fn record_nonces(&mut self, number: u64, changes: &BTreeMap<Address, u64>) {
        for (address, nonce) in changes {
            self.nonces
                .entry(*address)
                .or_default()
                .insert(number, *nonce);
        }
    }

    /// Shrinks the window back to `retained` blocks once it has grown to twice that.
    fn prune(&mut self, retained: usize) {
        if self.blocks.len() < retained.saturating_mul(2) {
            return;
        }
        let excess = self.blocks.len() - retained;
        self.blocks.drain(..excess);
        let below_window = self.first_retained() - 1;
        for history in self.nonces.values_mut() {
            if history.len() < 2 {
                continue;
            }
            let mut kept = history.split_off(&(below_window + 1));
            if let Some((_, nonce)) = history.last_key_value() {
                kept.insert(below_window, *nonce);
            }
            *history = kept;
        }
    }
}

/// The canonical chain. The most recent blocks and every account's nonce history over them
/// are held in memory; everything is mirrored to SQLite.
///
/// Mutations go through the execution engine only, which serializes them. Readers take a
/// shared lock and never hold it across an await.
pub struct Blockchain {
    inner: RwLock<ChainInner>,
    storage: Mutex<Storage>,
    retained: usize,
}

impl Blockchain {
    /// Loads the persisted chain, creating `genesis` when storage is empty.
    pub fn open(storage: Storage, genesis: BlockHeader) -> Result<Self, ChainError> {
        Self::open_retaining(storage, genesis, DEFAULT_RETAINED_BLOCKS)
    }

    pub fn open_retaining(
        mut storage: Storage,
        genesis: BlockHeader,
        retained: usize,
    ) -> Result<Self, ChainError> {
        let retained = retained.max(1);
        let inner = match load_window(&mut storage, retained)? {
            Some(inner) => inner,
            None => {
                let block = Block {
                    header: genesis,
                    transactions: Vec::new(),
                };
                storage
                    .insert_block(&block, &BTreeMap::new())
                    .map_err(|source| ChainError::Storage { source })?;
                tracing::info!(block = block.header.number, hash = %block.header.hash, "created genesis block");
                ChainInner {
                    genesis_number: block.header.number,
                    blocks: VecDeque::from([block]),
                    nonces: HashMap::new(),
                }
            }
        };

        Ok(Self {
            inner: RwLock::new(inner),
            storage: Mutex::new(storage),
            retained,
        })
    }

    pub fn genesis_block_number(&self) -> u64 {
        self.read().genesis_number
    }

    /// Lowest block number still held in memory.
    pub fn first_retained_block(&self) -> u64 {
        self.read().first_retained()
    }

    pub fn current_header(&self) -> BlockHeader {
        self.read().head().header.clone()
    }

    pub fn header_by_number(&self, number: u64) -> Option<BlockHeader> {
        {
            let inner = self.read();
            if let Some(offset) = inner.offset(number) {
                return Some(inner.blocks[offset].header.clone());
            }
        }
        self.load_pruned(number).map(|block| block.header)
    }

    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        {
            let inner = self.read();
            if let Some(offset) = inner.offset(number) {
                return Some(inner.blocks[offset].clone());
            }
        }
        self.load_pruned(number)
    }

    /// Account state as of the end of block `number`. Exact for the retained blocks and the
    /// one just below them.
    pub fn state_at(&self, number: u64) -> ChainState<'_> {
        ChainState {
            inner: self.read(),
            at: number,
        }
    }

    pub fn append_block(
        &self,
        block: &Block,
        nonce_changes: &BTreeMap<Address, u64>,
    ) -> Result<(), ChainError> {
        let head = self.current_header();
        if block.header.parent_hash != head.hash || block.header.number != head.number + 1 {
            return Err(ChainError::NotExtendingHead {
                number: block.header.number,
                parent_hash: block.header.parent_hash,
                head_hash: head.hash,
            });
        }

        self.storage
            .lock()
            .expect("chain storage mutex poisoned")
            .insert_block(block, nonce_changes)
            .map_err(|source| ChainError::Storage { source })?;

        let mut inner = self.write();
        inner.record_nonces(block.header.number, nonce_changes);
        inner.blocks.push_back(block.clone());
        inner.prune(self.retained);
        Ok(())
    }

    /// Drops every block above `number`. Returns how many blocks were removed.
    pub fn reorg_to(&self, number: u64) -> Result<usize, ChainError> {
        let mut storage = self.storage.lock().expect("chain storage mutex poisoned");
        let removed = storage
            .truncate_blocks_after(number)
            .map_err(|source| ChainError::Storage { source })?;

        let mut inner = self.write();
        if inner.offset(number).is_some() {
            let offset = number - inner.first_retained();
            inner.blocks.truncate(offset as usize + 1);
            let cutoff = number.saturating_add(1);
            inner.nonces.retain(|_, history| {
                history.split_off(&cutoff);
                !history.is_empty()
            });
        } else if removed > 0 {
            // The target was already pruned from memory: rebuild the window below it.
            *inner = load_window(&mut storage, self.retained)?
                .expect("reorg keeps the target block in storage");
        }
        Ok(removed)
    }

    pub fn checkpoint(&self) -> Result<(), ChainError> {
        self.storage
            .lock()
            .expect("chain storage mutex poisoned")
            .checkpoint()
            .map_err(|source| ChainError::Storage { source })
    }

    fn load_pruned(&self, number: u64) -> Option<Block> {
        let loaded = self
            .storage
            .lock()
            .expect("chain storage mutex poisoned")
            .load_block(number);
        match loaded {
            Ok(block) => block,
            Err(err) => {
                tracing::warn!(error = %err, number, "failed to load pruned block");
                None
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainInner> {
        self.inner.read().expect("chain lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainInner> {
        self.inner.write().expect("chain lock poisoned")
    }
}

/// The last `retained` stored blocks, or `None` for empty storage.
fn load_window(storage: &mut Storage, retained: usize) -> Result<Option<ChainInner>, ChainError> {
    let bounds = storage
        .chain_bounds()
        .map_err(|source| ChainError::Storage { source })?;
    let Some((first, last)) = bounds else {
        return Ok(None);
    };
    let from = last.saturating_sub(retained as u64 - 1).max(first);
    let stored = storage
        .load_chain_from(from)
        .map_err(|source| ChainError::Storage { source })?;
    Ok(Some(ChainInner::from_stored(first, stored)))
}

/// A read view of account nonces pinned to one block.
pub struct ChainState<'a> {
    inner: RwLockReadGuard<'a, ChainInner>,
    at: u64,
}

impl StateView for ChainState<'_> {
    fn nonce(&self, address: Address) -> u64 {
        self.inner
            .nonces
            .get(&address)
            .and_then(|history| history.range(..=self.at).next_back())
            .map(|(_, nonce)| *nonce)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use tempfile::TempDir;

    fn open_chain(dir: &TempDir) -> Blockchain {
        let path = dir.path().join("chain.sqlite");
        let storage = Storage::open(&path.to_string_lossy(), "NORMAL").expect("open storage");
        Blockchain::open(storage, BlockHeader::genesis(0, 1)).expect("open chain")
    }

    fn child_block(parent: &BlockHeader) -> Block {
        Block {
            header: BlockHeader {
                number: parent.number + 1,
                hash: B256::ZERO,
                parent_hash: parent.hash,
                timestamp: parent.timestamp + 1,
                l1_block_number: 1,
                delayed_messages_read: parent.delayed_messages_read,
                gas_used: 0,
                state_root: B256::repeat_byte(parent.number as u8 + 1),
            }
            .seal(),
            transactions: Vec::new(),
        }
    }

    #[test]
    fn state_view_reads_nonces_as_of_requested_block() {
        let dir = TempDir::new().expect("temp dir");
        let chain = open_chain(&dir);
        let sender = Address::repeat_byte(0x0a);

        let first = child_block(&chain.current_header());
        chain
            .append_block(&first, &BTreeMap::from([(sender, 1)]))
            .expect("append first");
        let second = child_block(&first.header);
        chain
            .append_block(&second, &BTreeMap::from([(sender, 3)]))
            .expect("append second");

        assert_eq!(chain.state_at(0).nonce(sender), 0);
        assert_eq!(chain.state_at(1).nonce(sender), 1);
        assert_eq!(chain.state_at(2).nonce(sender), 3);

        assert_eq!(chain.reorg_to(1).expect("reorg"), 1);
        assert_eq!(chain.current_header(), first.header);
        assert_eq!(chain.state_at(2).nonce(sender), 1);
    }

    #[test]
    fn append_rejects_block_not_built_on_head() {
        let dir = TempDir::new().expect("temp dir");
        let chain = open_chain(&dir);
        let mut orphan = child_block(&chain.current_header());
        orphan.header.parent_hash = B256::repeat_byte(0xee);

        let err = chain
            .append_block(&orphan, &BTreeMap::new())
            .expect_err("orphan must be rejected");
        assert!(matches!(err, ChainError::NotExtendingHead { number: 1, .. }));
    }

    #[test]
    fn reopening_restores_head_and_nonce_history() {
        let dir = TempDir::new().expect("temp dir");
        let sender = Address::repeat_byte(0x0b);
        let head = {
            let chain = open_chain(&dir);
            let block = child_block(&chain.current_header());
            chain
                .append_block(&block, &BTreeMap::from([(sender, 5)]))
                .expect("append");
            block.header
        };

        let chain = open_chain(&dir);
        assert_eq!(chain.current_header(), head);
        assert_eq!(chain.genesis_block_number(), 0);
        assert_eq!(chain.state_at(head.number).nonce(sender), 5);
    }

    fn open_chain_retaining(dir: &TempDir, retained: usize) -> Blockchain {
        let path = dir.path().join("chain.sqlite");
        let storage = Storage::open(&path.to_string_lossy(), "NORMAL").expect("open storage");
        Blockchain::open_retaining(storage, BlockHeader::genesis(0, 1), retained)
            .expect("open chain")
    }

    // Appends `count` blocks, bumping `sender`'s nonce to the block number in each.
    fn extend(chain: &Blockchain, sender: Address, count: u64) -> Vec<Block> {
        (0..count)
            .map(|_| {
                let block = child_block(&chain.current_header());
                chain
                    .append_block(&block, &BTreeMap::from([(sender, block.header.number)]))
                    .expect("append");
                block
            })
            .collect()
    }

    #[test]
    fn old_blocks_leave_memory_but_stay_readable() {
        let dir = TempDir::new().expect("temp dir");
        let chain = open_chain_retaining(&dir, 2);
        let sender = Address::repeat_byte(0x0c);
        let untouched = Address::repeat_byte(0x0d);
        chain
            .append_block(
                &child_block(&chain.current_header()),
                &BTreeMap::from([(untouched, 7)]),
            )
            .expect("append first");
        let blocks = extend(&chain, sender, 5);

        assert_eq!(chain.current_header().number, 6);
        assert!(chain.first_retained_block() > 1);
        assert_eq!(chain.genesis_block_number(), 0);

        assert_eq!(chain.header_by_number(1).expect("block 1").number, 1);
        assert_eq!(chain.block_by_number(2), Some(blocks[0].clone()));
        assert_eq!(chain.header_by_number(0).expect("genesis").number, 0);
        assert_eq!(chain.header_by_number(7), None);

        let state = chain.state_at(6);
        assert_eq!(state.nonce(sender), 6);
        assert_eq!(state.nonce(untouched), 7);
        drop(state);
        let below = chain.first_retained_block() - 1;
        assert_eq!(chain.state_at(below).nonce(sender), below);
    }

    #[test]
    fn reopening_loads_only_the_recent_window() {
        let dir = TempDir::new().expect("temp dir");
        let sender = Address::repeat_byte(0x0e);
        {
            let chain = open_chain_retaining(&dir, 100);
            extend(&chain, sender, 6);
        }

        let chain = open_chain_retaining(&dir, 3);
        assert_eq!(chain.current_header().number, 6);
        assert_eq!(chain.first_retained_block(), 4);
        assert_eq!(chain.genesis_block_number(), 0);
        assert_eq!(chain.state_at(6).nonce(sender), 6);
        assert_eq!(chain.state_at(3).nonce(sender), 3);
        assert_eq!(chain.header_by_number(2).expect("pruned block").number, 2);
    }

    #[test]
    fn reorg_below_the_window_reloads_from_storage() {
        let dir = TempDir::new().expect("temp dir");
        let chain = open_chain_retaining(&dir, 2);
        let sender = Address::repeat_byte(0x0f);
        let blocks = extend(&chain, sender, 6);
        assert!(chain.first_retained_block() > 2);

        assert_eq!(chain.reorg_to(2).expect("reorg"), 4);
        assert_eq!(chain.current_header(), blocks[1].header);
        assert_eq!(chain.first_retained_block(), 1);
        assert_eq!(chain.state_at(2).nonce(sender), 2);
        assert_eq!(chain.header_by_number(3), None);

        let next = child_block(&chain.current_header());
        chain
            .append_block(&next, &BTreeMap::new())
            .expect("append after reorg");
        assert_eq!(chain.current_header().number, 3);
    }
}
