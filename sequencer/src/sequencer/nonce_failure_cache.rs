// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use alloy_primitives::Address;
use lru::LruCache;
use rollup_core::application::NonceError;
use tokio::time::Instant;

use super::types::QueueItem;

/// A parked transaction whose nonce is ahead of its sender's account.
#[derive(Debug)]
pub(crate) struct NonceFailure {
    pub item: QueueItem,
    pub error: NonceError,
    pub expiry: Instant,
}

/// Called for every entry that leaves the cache without being revived. Must not block.
pub(crate) type EvictHandler = Box<dyn Fn(NonceFailure) + Send + Sync>;

/// Transactions waiting for their predecessor nonce, keyed by `(sender, nonce)`.
///
/// Entries leave in one of three ways: revived when the predecessor commits, evicted on
/// expiry or overflow, or cleared. Only revival skips the eviction handler.
pub(crate) struct NonceFailureCache {
    entries: LruCache<(Address, u64), NonceFailure>,
    capacity: usize,
    expiry: Duration,
    on_evict: EvictHandler,
}

impl NonceFailureCache {
    pub fn new(capacity: usize, expiry: Duration, on_evict: EvictHandler) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            expiry,
            on_evict,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, error: &NonceError) -> bool {
        self.entries.contains(&(error.sender, error.tx_nonce))
    }

    /// Parks `item`. Returns how many older entries overflowed out of the cache.
    ///
    /// An entry that is already parked, or one that is already past its expiry, is failed
    /// with `error` right away.
    pub fn add(&mut self, error: NonceError, item: QueueItem) -> usize {
        let expiry = item.first_seen + self.expiry;
        if self.contains(&error) || Instant::now() > expiry {
            item.respond(Err(error.into()));
            return 0;
        }
        self.entries.put(
            (error.sender, error.tx_nonce),
            NonceFailure {
                item,
                error,
                expiry,
            },
        );
        self.shrink_to(self.capacity)
    }

    /// Removes the entry for `(sender, nonce)` without calling the eviction handler.
    pub fn revive(&mut self, sender: Address, nonce: u64) -> Option<QueueItem> {
        self.entries
            .pop(&(sender, nonce))
            .map(|failure| failure.item)
    }

    /// Evicts every expired entry, oldest first. Returns when the next entry expires.
    pub fn expire(&mut self, now: Instant) -> Option<Instant> {
        loop {
            let expiry = self.entries.peek_lru().map(|(_, failure)| failure.expiry)?;
            if expiry > now {
                return Some(expiry);
            }
            self.evict_oldest();
        }
    }

    /// Takes the oldest entry out without calling the eviction handler.
    pub fn pop_oldest(&mut self) -> Option<QueueItem> {
        self.entries.pop_lru().map(|(_, failure)| failure.item)
    }

    /// Shrinking evicts the oldest entries.
    pub fn resize(&mut self, capacity: usize) -> usize {
        self.capacity = capacity;
        self.shrink_to(capacity)
    }

    pub fn set_expiry(&mut self, expiry: Duration) {
        self.expiry = expiry;
    }

    pub fn clear(&mut self) {
        self.shrink_to(0);
    }

    fn shrink_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            self.evict_oldest();
            evicted += 1;
        }
        evicted
    }

    fn evict_oldest(&mut self) {
        if let Some((_, failure)) = self.entries.pop_lru() {
            (self.on_evict)(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SubmitError;
    use crate::sequencer::types::SubmitResult;
    use alloy_primitives::U256;
    use rollup_core::transaction::{LEGACY_TX_TYPE, Transaction, TxBody};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn parked(sender: Address, nonce: u64) -> (NonceError, QueueItem, oneshot::Receiver<SubmitResult>) {
        let tx = Transaction::new(
            LEGACY_TX_TYPE,
            TxBody {
                sender,
                nonce,
                gas_limit: 21_000,
                max_fee_per_gas: 1,
                to: Address::ZERO,
                value: U256::ZERO,
                data: Vec::new().into(),
            },
        );
        let (item, result) = QueueItem::new(tx, None, None);
        let error = NonceError {
            sender,
            tx_nonce: nonce,
            state_nonce: 0,
        };
        (error, item, result)
    }

    fn recording_cache(capacity: usize) -> (NonceFailureCache, Arc<Mutex<Vec<u64>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = NonceFailureCache::new(
            capacity,
            Duration::from_secs(60),
            Box::new(move |failure: NonceFailure| {
                sink.lock().expect("sink").push(failure.error.tx_nonce);
                let error = failure.error;
                failure.item.respond(Err(error.into()));
            }),
        );
        (cache, evicted)
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_through_handler() {
        let sender = Address::repeat_byte(1);
        let (mut cache, evicted) = recording_cache(2);
        let mut results = Vec::new();
        for nonce in 1..=3 {
            let (error, item, result) = parked(sender, nonce);
            results.push(result);
            let overflowed = cache.add(error, item);
            assert_eq!(overflowed, usize::from(nonce == 3));
        }

        assert_eq!(*evicted.lock().expect("evicted"), vec![1]);
        assert!(matches!(
            results.remove(0).await.expect("result"),
            Err(SubmitError::Nonce(_))
        ));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn revived_entries_never_reach_the_handler() {
        let sender = Address::repeat_byte(2);
        let (mut cache, evicted) = recording_cache(4);
        let (error, item, _result) = parked(sender, 5);
        cache.add(error, item);

        let revived = cache.revive(sender, 5).expect("parked entry");
        assert_eq!(revived.tx.nonce(), 5);
        assert!(cache.revive(sender, 5).is_none());
        cache.clear();
        assert!(evicted.lock().expect("evicted").is_empty());
    }

    #[tokio::test]
    async fn double_park_fails_the_second_item() {
        let sender = Address::repeat_byte(3);
        let (mut cache, _evicted) = recording_cache(4);
        let (error, item, _first) = parked(sender, 2);
        cache.add(error, item);
        let (error, item, second) = parked(sender, 2);
        assert!(cache.contains(&error));
        cache.add(error, item);

        let result = second.await.expect("result");
        assert_eq!(result, Err(SubmitError::Nonce(error)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_evicts_in_order_and_reports_next_deadline() {
        let sender = Address::repeat_byte(4);
        let (mut cache, evicted) = recording_cache(8);
        cache.set_expiry(Duration::from_secs(1));

        let (error, item, _a) = parked(sender, 1);
        cache.add(error, item);
        tokio::time::advance(Duration::from_millis(500)).await;
        let (error, item, _b) = parked(sender, 2);
        cache.add(error, item);

        let now = Instant::now();
        let next = cache.expire(now).expect("entries pending");
        assert_eq!(next - now, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(600)).await;
        let next = cache.expire(Instant::now()).expect("one entry left");
        assert_eq!(*evicted.lock().expect("evicted"), vec![1]);

        tokio::time::advance(next - Instant::now()).await;
        assert_eq!(cache.expire(Instant::now()), None);
        assert_eq!(*evicted.lock().expect("evicted"), vec![1, 2]);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn shrinking_evicts_and_pop_oldest_skips_handler() {
        let sender = Address::repeat_byte(5);
        let (mut cache, evicted) = recording_cache(4);
        let mut receivers = Vec::new();
        for nonce in 1..=3 {
            let (error, item, result) = parked(sender, nonce);
            receivers.push(result);
            cache.add(error, item);
        }

        assert_eq!(cache.resize(2), 1);
        assert_eq!(*evicted.lock().expect("evicted"), vec![1]);
        let oldest = cache.pop_oldest().expect("oldest");
        assert_eq!(oldest.tx.nonce(), 2);
        assert_eq!(*evicted.lock().expect("evicted"), vec![1]);
        assert_eq!(cache.len(), 1);
    }
}
