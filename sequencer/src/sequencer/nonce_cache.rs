// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::num::NonZeroUsize;

use alloy_primitives::{Address, B256};
use lru::LruCache;
use rollup_core::application::StateView;
use rollup_core::block::{BlockContext, BlockHeader, BuildToken};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NonceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resets: u64,
}

/// Next expected nonce per address, valid for exactly one chain position.
///
/// Entries describe the state after block `anchor`, or, while a block is being built, the
/// state inside the build identified by `dirty`. Any lookup from another position resets
/// the cache first.
pub(crate) struct NonceCache {
    entries: Option<LruCache<Address, u64>>,
    anchor: B256,
    dirty: Option<BuildToken>,
    stats: NonceCacheStats,
}

impl NonceCache {
    pub fn new(size: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(size).map(LruCache::new),
            anchor: B256::ZERO,
            dirty: None,
            stats: NonceCacheStats::default(),
        }
    }

    pub fn caching(&self) -> bool {
        self.entries.is_some()
    }

    /// Nonce of `address` as seen from the child of `parent_hash`, or from inside the build
    /// `token` when one is given.
    pub fn get(
        &mut self,
        parent_hash: B256,
        token: Option<BuildToken>,
        state: &dyn StateView,
        address: Address,
    ) -> u64 {
        if !self.matches(parent_hash, token) {
            self.reset(parent_hash);
        }
        let Some(entries) = self.entries.as_mut() else {
            return state.nonce(address);
        };
        if let Some(nonce) = entries.get(&address) {
            self.stats.hits += 1;
            return *nonce;
        }
        self.stats.misses += 1;
        let nonce = state.nonce(address);
        entries.put(address, nonce);
        nonce
    }

    /// Records `nonce` as produced inside the build `ctx`.
    pub fn update(&mut self, ctx: &BlockContext, address: Address, nonce: u64) {
        if self.entries.is_none() {
            return;
        }
        if !self.matches(ctx.parent_hash, Some(ctx.token)) {
            self.reset(ctx.parent_hash);
        }
        self.dirty = Some(ctx.token);
        if let Some(entries) = self.entries.as_mut() {
            entries.put(address, nonce);
        }
    }

    /// Promotes the dirty entries once `block` is committed.
    pub fn finalize(&mut self, block: &BlockHeader) {
        if self.anchor == block.parent_hash {
            self.anchor = block.hash;
            self.dirty = None;
        } else {
            self.reset(block.hash);
        }
    }

    /// Drops whatever a previous, uncommitted build left behind.
    pub fn begin_new_block(&mut self) {
        if self.dirty.is_some() {
            self.reset(B256::ZERO);
        }
    }

    pub fn reset(&mut self, anchor: B256) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
        self.anchor = anchor;
        self.dirty = None;
        self.stats.resets += 1;
    }

    pub fn resize(&mut self, size: usize) {
        match (NonZeroUsize::new(size), self.entries.as_mut()) {
            (None, _) => self.entries = None,
            (Some(size), Some(entries)) => entries.resize(size),
            (Some(size), None) => {
                // Nothing cached while disabled, so the cache starts empty at the same anchor.
                self.entries = Some(LruCache::new(size));
                self.dirty = None;
            }
        }
    }

    pub fn take_stats(&mut self) -> NonceCacheStats {
        std::mem::take(&mut self.stats)
    }

    fn matches(&self, parent_hash: B256, token: Option<BuildToken>) -> bool {
        match self.dirty {
            Some(dirty) => token == Some(dirty),
            None => self.anchor == parent_hash,
        }
    }
}
