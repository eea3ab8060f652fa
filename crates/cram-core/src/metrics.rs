// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-wide counters, surfaced via the `mm_stat` / `io_stat` /
//! `bd_stat` / `idle_stat` control attributes.
//!
//! All counters use `Relaxed` ordering for minimal overhead; they are
//! eventually consistent across threads, matching this codebase's
//! `ShmMetrics` style.

use std::sync::atomic::{AtomicU64, Ordering};

/// Memory-management counters (`mm_stat`).
#[derive(Debug, Default)]
pub struct MmStat {
    pub pages_stored: AtomicU64,
    pub orig_data_size: AtomicU64,
    pub compr_data_size: AtomicU64,
    pub mem_used_total: AtomicU64,
    pub mem_used_max: AtomicU64,
    pub same_pages: AtomicU64,
    pub huge_pages: AtomicU64,
    pub pages_compacted: AtomicU64,
    /// Original size of pages that reused an existing pool entry
    /// through the dedup index, rather than allocating their own.
    pub dup_data_size: AtomicU64,
}

impl MmStat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages_stored: AtomicU64::new(0),
            orig_data_size: AtomicU64::new(0),
            compr_data_size: AtomicU64::new(0),
            mem_used_total: AtomicU64::new(0),
            mem_used_max: AtomicU64::new(0),
            same_pages: AtomicU64::new(0),
            huge_pages: AtomicU64::new(0),
            pages_compacted: AtomicU64::new(0),
            dup_data_size: AtomicU64::new(0),
        }
    }

    /// Maintain the high-water mark with a compare-and-swap retry
    /// loop.
    pub fn bump_max_used(&self, used: u64) {
        let mut cur = self.mem_used_max.load(Ordering::Relaxed);
        while used > cur {
            match self.mem_used_max.compare_exchange_weak(
                cur,
                used,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn reset(&self) {
        self.pages_stored.store(0, Ordering::Relaxed);
        self.orig_data_size.store(0, Ordering::Relaxed);
        self.compr_data_size.store(0, Ordering::Relaxed);
        self.mem_used_total.store(0, Ordering::Relaxed);
        self.mem_used_max.store(0, Ordering::Relaxed);
        self.same_pages.store(0, Ordering::Relaxed);
        self.huge_pages.store(0, Ordering::Relaxed);
        self.pages_compacted.store(0, Ordering::Relaxed);
        self.dup_data_size.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {}",
            self.orig_data_size.load(Ordering::Relaxed),
            self.compr_data_size.load(Ordering::Relaxed),
            self.mem_used_total.load(Ordering::Relaxed),
            self.pages_stored.load(Ordering::Relaxed),
            self.mem_used_max.load(Ordering::Relaxed),
            self.same_pages.load(Ordering::Relaxed),
            self.huge_pages.load(Ordering::Relaxed),
            self.pages_compacted.load(Ordering::Relaxed),
            self.dup_data_size.load(Ordering::Relaxed),
        )
    }
}

/// Data-path I/O counters (`io_stat`).
#[derive(Debug, Default)]
pub struct IoStat {
    pub failed_reads: AtomicU64,
    pub failed_writes: AtomicU64,
    pub invalid_io: AtomicU64,
    pub notify_free: AtomicU64,
}

impl IoStat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failed_reads: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            invalid_io: AtomicU64::new(0),
            notify_free: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.failed_reads.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
        self.invalid_io.store(0, Ordering::Relaxed);
        self.notify_free.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{} {} {} {}",
            self.failed_reads.load(Ordering::Relaxed),
            self.failed_writes.load(Ordering::Relaxed),
            self.invalid_io.load(Ordering::Relaxed),
            self.notify_free.load(Ordering::Relaxed),
        )
    }
}

/// Idle-tracking counters (`idle_stat`), separate from `mm_stat` so
/// a writeback-disabled device still reports something meaningful
/// for the `idle`/`new` attributes.
#[derive(Debug, Default)]
pub struct IdleStat {
    pub marked: AtomicU64,
    pub cleared: AtomicU64,
}

impl IdleStat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            marked: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{} {}",
            self.marked.load(Ordering::Relaxed),
            self.cleared.load(Ordering::Relaxed),
        )
    }
}

/// Aggregate stats bundle owned by [`crate::device::Device`].
#[derive(Debug, Default)]
pub struct Stats {
    pub mm: MmStat,
    pub io: IoStat,
    pub idle: IdleStat,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mm: MmStat::new(),
            io: IoStat::new(),
            idle: IdleStat::new(),
        }
    }
}
