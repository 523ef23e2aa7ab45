// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::{Duration, Instant};
use tracing::info;

use super::nonce_cache::NonceCacheStats;

pub(crate) const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) struct SequencerMetrics {
    enabled: bool,
    log_interval: Duration,
    window_started_at: Instant,
    builds: u64,
    blocks: u64,
    included_txs: u64,
    rejected_txs: u64,
    parked_txs: u64,
    failure_cache_overflows: u64,
    nonce_cache_hits: u64,
    nonce_cache_misses: u64,
    nonce_cache_resets: u64,
    max_batch_len: usize,
    build_time: Duration,
    max_build_time: Duration,
}

impl SequencerMetrics {
    pub(crate) fn new(enabled: bool, log_interval: Duration) -> Self {
        Self {
            enabled,
            log_interval,
            window_started_at: Instant::now(),
            builds: 0,
            blocks: 0,
            included_txs: 0,
            rejected_txs: 0,
            parked_txs: 0,
            failure_cache_overflows: 0,
            nonce_cache_hits: 0,
            nonce_cache_misses: 0,
            nonce_cache_resets: 0,
            max_batch_len: 0,
            build_time: Duration::ZERO,
            max_build_time: Duration::ZERO,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.reset_window();
        }
        self.enabled = enabled;
    }

    pub(crate) fn phase_started_at(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(crate) fn on_build_end(
        &mut self,
        started_at: Option<Instant>,
        batch_len: usize,
        included_txs: u64,
        made_block: bool,
    ) {
        if !self.enabled {
            return;
        }
        let elapsed = elapsed_or_zero(started_at);
        self.builds = self.builds.saturating_add(1);
        if made_block {
            self.blocks = self.blocks.saturating_add(1);
        }
        self.included_txs = self.included_txs.saturating_add(included_txs);
        self.rejected_txs = self
            .rejected_txs
            .saturating_add((batch_len as u64).saturating_sub(included_txs));
        self.max_batch_len = self.max_batch_len.max(batch_len);
        self.build_time = self.build_time.saturating_add(elapsed);
        self.max_build_time = self.max_build_time.max(elapsed);
    }

    pub(crate) fn on_parked(&mut self, overflowed: usize) {
        if !self.enabled {
            return;
        }
        self.parked_txs = self.parked_txs.saturating_add(1);
        self.on_overflow(overflowed);
    }

    pub(crate) fn on_overflow(&mut self, overflowed: usize) {
        if !self.enabled {
            return;
        }
        self.failure_cache_overflows = self
            .failure_cache_overflows
            .saturating_add(overflowed as u64);
    }

    pub(crate) fn on_nonce_cache(&mut self, stats: NonceCacheStats) {
        if !self.enabled {
            return;
        }
        self.nonce_cache_hits = self.nonce_cache_hits.saturating_add(stats.hits);
        self.nonce_cache_misses = self.nonce_cache_misses.saturating_add(stats.misses);
        self.nonce_cache_resets = self.nonce_cache_resets.saturating_add(stats.resets);
    }

    pub(crate) fn maybe_log_window(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        if elapsed < self.log_interval {
            return;
        }
        self.log_window(elapsed, false);
        self.reset_window();
    }

    pub(crate) fn log_final(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        if self.builds == 0 {
            return;
        }
        self.log_window(elapsed, true);
    }

    fn log_window(&self, elapsed: Duration, final_window: bool) {
        let elapsed_secs = elapsed.as_secs_f64();
        let included_tps = if elapsed_secs > 0.0 {
            self.included_txs as f64 / elapsed_secs
        } else {
            0.0
        };
        let nonce_cache_hit_pct = percentage(
            self.nonce_cache_hits,
            self.nonce_cache_hits.saturating_add(self.nonce_cache_misses),
        );
        let avg_build_ms = if self.builds > 0 {
            self.build_time.as_secs_f64() * 1000.0 / self.builds as f64
        } else {
            0.0
        };
        info!(
            final_window,
            window_ms = elapsed.as_millis() as u64,
            builds = self.builds,
            blocks = self.blocks,
            included_txs = self.included_txs,
            rejected_txs = self.rejected_txs,
            included_tps = included_tps,
            parked_txs = self.parked_txs,
            failure_cache_overflows = self.failure_cache_overflows,
            nonce_cache_hits = self.nonce_cache_hits,
            nonce_cache_misses = self.nonce_cache_misses,
            nonce_cache_resets = self.nonce_cache_resets,
            nonce_cache_hit_pct = nonce_cache_hit_pct,
            max_batch_len = self.max_batch_len,
            avg_build_ms = avg_build_ms,
            max_build_ms = self.max_build_time.as_millis() as u64,
            "sequencer metrics"
        );
    }

    fn reset_window(&mut self) {
        self.window_started_at = Instant::now();
        self.builds = 0;
        self.blocks = 0;
        self.included_txs = 0;
        self.rejected_txs = 0;
        self.parked_txs = 0;
        self.failure_cache_overflows = 0;
        self.nonce_cache_hits = 0;
        self.nonce_cache_misses = 0;
        self.nonce_cache_resets = 0;
        self.max_batch_len = 0;
        self.build_time = Duration::ZERO;
        self.max_build_time = Duration::ZERO;
    }
}

fn elapsed_or_zero(started_at: Option<Instant>) -> Duration {
    started_at.map_or(Duration::ZERO, |value| value.elapsed())
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64) * 100.0 / (total as f64)
}
