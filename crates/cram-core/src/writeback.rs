// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Eviction policy: selects `huge` or `idle` slots, batches their
//! decompressed contents to the backing device, and reconciles each
//! slot once its batch's I/O has completed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::warn;

use crate::backing::BackingStore;
use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::io_engine::IoEngine;
use crate::slot::{Payload, SlotFlag};

/// Which sweep of the table `writeback` performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Evict every slot carrying `HUGE`.
    Huge,
    /// Evict slots that are `COMPRESS_LOW`, idle, and have survived
    /// at least `wb_idle_min` idle epochs.
    Idle { wb_idle_min: u32 },
}

/// A parsed `writeback` attribute value.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub mode: Mode,
    pub wb_max: Option<usize>,
}

impl Request {
    /// Parse `"huge"`, `"idle"`, or `"idle <wb_max> [<wb_idle_min>]"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("huge") => Ok(Self {
                mode: Mode::Huge,
                wb_max: None,
            }),
            Some("idle") => {
                let wb_max = match parts.next() {
                    Some(v) => Some(
                        v.parse()
                            .map_err(|_| Error::InvalidAttr(format!("writeback idle {v}")))?,
                    ),
                    None => None,
                };
                let wb_idle_min = match parts.next() {
                    Some(v) => v
                        .parse()
                        .map_err(|_| Error::InvalidAttr(format!("writeback idle _ {v}")))?,
                    None => 1,
                };
                Ok(Self {
                    mode: Mode::Idle { wb_idle_min },
                    wb_max,
                })
            }
            _ => Err(Error::InvalidAttr(s.to_string())),
        }
    }
}

/// Per-invocation write budget, shared with the `writeback_limit` /
/// `writeback_limit_enable` control attributes.
#[derive(Debug, Default)]
pub struct WritebackLimit {
    enabled: AtomicBool,
    remaining: AtomicU64,
}

impl WritebackLimit {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            remaining: AtomicU64::new(0),
        }
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn set_pages(&self, pages: u64) {
        self.remaining.store(pages, Ordering::Relaxed);
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Pages left in the current budget, mirroring how `writeback_limit`
    /// reads back the remaining allowance rather than the original
    /// value it was set to.
    #[must_use]
    pub fn remaining_pages(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Try to consume one page of budget. Returns `false` (refuse)
    /// only when the limit is enabled and exhausted.
    fn try_consume_one(&self) -> bool {
        if !self.enabled() {
            return true;
        }
        let mut cur = self.remaining.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }
}

/// Cooperative cancellation signal for an in-progress `writeback`
/// sweep, grounded on `WakeNotifier`'s atomic fast path: a single
/// flag, checked between iterations rather than between a spin and a
/// park since there's no waiter to wake here.
#[derive(Debug, Default)]
pub struct CancelSignal {
    requested: AtomicBool,
}

impl CancelSignal {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Relaxed);
    }
}

/// Outcome of one `writeback` invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Outcome {
    pub pages_written: usize,
    pub io_errors: usize,
    pub cancelled: bool,
}

/// One contiguous run of backing blocks staged for a single write.
struct PendingBatch {
    entries: Vec<(u64, usize, Vec<u8>)>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn last_block(&self) -> Option<u64> {
        self.entries.last().map(|(b, _, _)| *b)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The eviction policy itself. Borrows the same view the I/O pipeline
/// uses so reconciliation can share `free_page`.
pub struct WritebackPolicy<'a> {
    pub io: IoEngine<'a>,
    pub limit: &'a WritebackLimit,
    pub cancel: &'a CancelSignal,
}

impl<'a> WritebackPolicy<'a> {
    /// Run one sweep as described by `mode_str`.
    pub fn run(&self, mode_str: &str) -> Result<Outcome> {
        let req = Request::parse(mode_str)?;
        let backing = self.io.backing.ok_or(Error::NoBackingDevice)?;

        let mut batch = PendingBatch::new();
        let mut outcome = Outcome::default();

        for page in 0..self.io.slots.len() {
            if self.cancel.is_requested() {
                outcome.cancelled = true;
                break;
            }
            if let Some(max) = req.wb_max {
                if outcome.pages_written >= max {
                    break;
                }
            }
            if !self.mark_eligible(page, req.mode) {
                continue;
            }

            if !self.limit.try_consume_one() {
                self.unmark(page);
                break;
            }

            let mut staged = vec![0u8; PAGE_SIZE];
            if let Err(e) = self.decompress_no_touch(page, &mut staged) {
                warn!("writeback: decompress failed for page {page}: {e}");
                self.unmark(page);
                continue;
            }

            let Some(block) = backing.alloc_block() else {
                self.unmark(page);
                break; // backing device full; nothing more we can do
            };

            let needs_flush = batch
                .last_block()
                .is_some_and(|last| last + 1 != block || batch.len() >= self.io.config.max_writeback_batch);
            if needs_flush && !self.flush(&mut batch, backing, &mut outcome)? {
                // The *previous* batch failed; `page` itself was never
                // added to it, so its UNDER_WB/IDLE marks and freshly
                // allocated block are still ours to release.
                self.unmark(page);
                backing.free_block(block);
                break;
            }

            batch.entries.push((block, page, staged));
            outcome.pages_written += 1;
        }

        self.flush(&mut batch, backing, &mut outcome)?;
        Ok(outcome)
    }

    /// Lock `page`, check eligibility for `mode`, and if eligible set
    /// `UNDER_WB` + `IDLE` before releasing the lock. Setting `IDLE`
    /// here, ahead of the I/O, is what keeps a racing fresh write from
    /// later being mistaken for stale data during reconciliation.
    fn mark_eligible(&self, page: usize, mode: Mode) -> bool {
        let mut guard = self.io.slots.lock(page);
        let flags = guard.flags();
        let eligible = guard.is_allocated()
            && !flags.wb
            && !flags.under_wb
            && match mode {
                Mode::Huge => flags.huge,
                Mode::Idle { wb_idle_min } => {
                    flags.compress_low && flags.idle && guard.idle_count() >= wb_idle_min
                }
            };
        if !eligible {
            return false;
        }
        guard.set_flag(SlotFlag::UnderWb);
        guard.set_flag(SlotFlag::Idle);
        true
    }

    fn unmark(&self, page: usize) {
        let mut guard = self.io.slots.lock(page);
        guard.clear_flag(SlotFlag::UnderWb);
        guard.clear_flag(SlotFlag::Idle);
        guard.clear_idle_count();
    }

    /// Decompress a slot's payload into `dst` without touching its
    /// access time or idle tracking.
    fn decompress_no_touch(&self, page: usize, dst: &mut [u8]) -> Result<()> {
        let guard = self.io.slots.lock(page);
        match guard.payload().clone() {
            Payload::Same(word) => {
                let bytes = word.to_ne_bytes();
                for chunk in dst.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&bytes);
                }
                Ok(())
            }
            Payload::Entry(entry) => {
                let raw = self.io.pool.map_ro(entry.raw());
                if entry.len == PAGE_SIZE {
                    dst.copy_from_slice(&raw[..PAGE_SIZE]);
                    Ok(())
                } else {
                    self.io.codec.decompress(&raw[..entry.len], dst)
                }
            }
            Payload::Empty | Payload::Backing(_) => {
                // Not reachable: mark_eligible excludes WB/empty slots.
                dst.fill(0);
                Ok(())
            }
        }
    }

    /// Write out the pending batch and reconcile each entry. Returns
    /// `false` if the write failed (caller should stop the sweep).
    fn flush(
        &self,
        batch: &mut PendingBatch,
        backing: &BackingStore,
        outcome: &mut Outcome,
    ) -> Result<bool> {
        if batch.entries.is_empty() {
            return Ok(true);
        }

        let mut failed = false;
        for (block, _, data) in &batch.entries {
            if backing.write(*block, data).is_err() {
                failed = true;
                break;
            }
        }

        if failed {
            outcome.io_errors += 1;
            self.io.stats.io.failed_writes.fetch_add(1, Ordering::Relaxed);
            for (block, page, _) in batch.entries.drain(..) {
                self.unmark(page);
                backing.free_block(block);
            }
            return Ok(false);
        }

        for (block, page, _) in batch.entries.drain(..) {
            let mut guard = self.io.slots.lock(page);
            if !guard.is_allocated() || !guard.flags().idle {
                // Freed or re-populated while the write was in
                // flight: the fresh data must win, not the stale
                // backing copy.
                guard.clear_flag(SlotFlag::UnderWb);
                guard.clear_flag(SlotFlag::Idle);
                guard.clear_idle_count();
                backing.free_block(block);
                continue;
            }
            self.io.free_page(&mut guard);
            guard.set_payload(Payload::Backing(block), 0, false);
            guard.clear_flag(SlotFlag::UnderWb);
            backing.stats.count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemBackingDev;
    use crate::codec::DeflateCodec;
    use crate::config::Config;
    use crate::metrics::Stats;
    use crate::pool::InMemoryPool;
    use crate::slot_table::SlotTable;

    fn setup(pages: usize) -> (SlotTable, InMemoryPool, DeflateCodec, Stats, Config, crate::io_engine::MemLimit, BackingStore) {
        let mut config = Config::default();
        config.disk_size = (pages * PAGE_SIZE) as u64;
        (
            SlotTable::new(pages),
            InMemoryPool::new(),
            DeflateCodec,
            Stats::new(),
            config,
            crate::io_engine::MemLimit::new(),
            BackingStore::new(Box::new(MemBackingDev::new(pages as u64 * 2)), pages as u64 * 2),
        )
    }

    #[test]
    fn idle_writeback_evicts_and_preserves_data() {
        let (slots, pool, codec, stats, config, mem_limit, backing) = setup(4);
        #[cfg(feature = "dedup")]
        let dedup = crate::pool::Dedup::new();
        let io = IoEngine {
            slots: &slots,
            pool: &pool,
            codec: &codec,
            #[cfg(feature = "dedup")]
            dedup: Some(&dedup),
            stats: &stats,
            config: &config,
            mem_limit: &mem_limit,
            backing: Some(&backing),
        };

        let mut page = vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 97) as u8;
        }
        io.write(0, &page).unwrap();

        {
            let mut guard = slots.lock(0);
            guard.set_flag(SlotFlag::CompressLow);
            guard.set_flag(SlotFlag::Idle);
            guard.inc_idle();
        }

        let limit = WritebackLimit::new();
        let cancel = CancelSignal::new();
        let policy = WritebackPolicy {
            io,
            limit: &limit,
            cancel: &cancel,
        };

        let outcome = policy.run("idle").unwrap();
        assert_eq!(outcome.pages_written, 1);
        assert_eq!(outcome.io_errors, 0);

        let mut out = vec![0u8; PAGE_SIZE];
        io.read(0, &mut out).unwrap();
        assert_eq!(out, page);

        let g = slots.lock(0);
        assert!(g.flags().wb);
        assert!(!g.flags().under_wb);
    }

    #[test]
    fn huge_mode_only_evicts_huge_slots() {
        let (slots, pool, codec, stats, mut config, mem_limit, backing) = setup(4);
        config.huge_class_size = 1; // force huge
        #[cfg(feature = "dedup")]
        let dedup = crate::pool::Dedup::new();
        let io = IoEngine {
            slots: &slots,
            pool: &pool,
            codec: &codec,
            #[cfg(feature = "dedup")]
            dedup: Some(&dedup),
            stats: &stats,
            config: &config,
            mem_limit: &mem_limit,
            backing: Some(&backing),
        };

        let page = vec![0x33u8; PAGE_SIZE];
        io.write(0, &page).unwrap();

        let limit = WritebackLimit::new();
        let cancel = CancelSignal::new();
        let policy = WritebackPolicy {
            io,
            limit: &limit,
            cancel: &cancel,
        };
        let outcome = policy.run("huge").unwrap();
        assert_eq!(outcome.pages_written, 1);
    }

    #[test]
    fn parse_idle_with_max_and_min() {
        let req = Request::parse("idle 10 3").unwrap();
        assert_eq!(req.wb_max, Some(10));
        assert!(matches!(req.mode, Mode::Idle { wb_idle_min: 3 }));
    }

    #[test]
    fn parse_rejects_unknown_mode() {
        assert!(Request::parse("bogus").is_err());
    }

    #[test]
    fn cancellation_stops_sweep_early() {
        let (slots, pool, codec, stats, config, mem_limit, backing) = setup(4);
        #[cfg(feature = "dedup")]
        let dedup = crate::pool::Dedup::new();
        let io = IoEngine {
            slots: &slots,
            pool: &pool,
            codec: &codec,
            #[cfg(feature = "dedup")]
            dedup: Some(&dedup),
            stats: &stats,
            config: &config,
            mem_limit: &mem_limit,
            backing: Some(&backing),
        };
        for p in 0..4 {
            io.write((p * PAGE_SIZE) as u64, &vec![p as u8; PAGE_SIZE])
                .unwrap();
            let mut g = slots.lock(p);
            g.set_flag(SlotFlag::CompressLow);
            g.set_flag(SlotFlag::Idle);
            g.inc_idle();
        }

        let limit = WritebackLimit::new();
        let cancel = CancelSignal::new();
        cancel.request();
        let policy = WritebackPolicy {
            io,
            limit: &limit,
            cancel: &cancel,
        };
        let outcome = policy.run("idle").unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.pages_written, 0);
    }
}
