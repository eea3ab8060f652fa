// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The read/write/discard pipeline: same-fill detection, compression,
//! huge-page fallback, partial I/O, dedup, and the `free_page`
//! protocol every eviction path shares.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::backing::BackingStore;
use crate::codec::Codec;
use crate::config::{Config, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::metrics::Stats;
use crate::pool::{EntryHandle, Pool};
use crate::slot::{Payload, SlotFlag, SlotGuard};
use crate::slot_table::SlotTable;

#[cfg(feature = "dedup")]
use crate::pool::Dedup;

/// Sector size used only to report the failing sector number on a
/// rejected request. The device's logical block size is [`PAGE_SIZE`]
/// (zram has no sub-page block granularity), so alignment itself is
/// checked against `PAGE_SIZE`, not this.
pub const SECTOR_SIZE: usize = 512;

/// Runtime-adjustable cap on pool pages (the `mem_limit` attribute).
/// Unlike [`Config`], this can change after the device is configured,
/// so it isn't a `Config` field.
#[derive(Debug, Default)]
pub struct MemLimit {
    /// 0 means unbounded.
    pages: AtomicU64,
}

impl MemLimit {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: AtomicU64::new(0),
        }
    }

    pub fn set(&self, pages: u64) {
        self.pages.store(pages, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }
}

/// Borrowed view over everything the I/O pipeline needs. Built fresh
/// per call by [`crate::device::Device`]; owns nothing. Every field is
/// a shared reference, so the view itself is `Copy`.
#[derive(Clone, Copy)]
pub struct IoEngine<'a> {
    pub slots: &'a SlotTable,
    pub pool: &'a dyn Pool,
    pub codec: &'a dyn Codec,
    #[cfg(feature = "dedup")]
    pub dedup: Option<&'a Dedup>,
    pub stats: &'a Stats,
    pub config: &'a Config,
    pub mem_limit: &'a MemLimit,
    pub backing: Option<&'a BackingStore>,
}

impl<'a> IoEngine<'a> {
    /// Validate a byte-range request against device bounds and
    /// page alignment: the logical block size is `PAGE_SIZE`, so any
    /// offset or length not a multiple of it is rejected outright.
    fn validate(&self, offset: u64, len: usize) -> Result<()> {
        let disk_size = self.config.disk_size;
        let ok = offset % PAGE_SIZE as u64 == 0
            && len % PAGE_SIZE == 0
            && offset.saturating_add(len as u64) <= disk_size;
        if !ok {
            self.stats.io.invalid_io.fetch_add(1, Ordering::Relaxed);
            return Err(Error::InvalidIo {
                sector: offset / SECTOR_SIZE as u64,
                len,
            });
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at byte `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.validate(offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let abs = offset + done as u64;
            let page = (abs / PAGE_SIZE as u64) as usize;
            let page_off = (abs % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            if page_off == 0 && chunk == PAGE_SIZE {
                self.read_page_full(page, &mut buf[done..done + chunk])?;
            } else {
                let mut tmp = vec![0u8; PAGE_SIZE];
                self.read_page_full(page, &mut tmp)?;
                buf[done..done + chunk].copy_from_slice(&tmp[page_off..page_off + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `buf` starting at byte `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.validate(offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let abs = offset + done as u64;
            let page = (abs / PAGE_SIZE as u64) as usize;
            let page_off = (abs % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            if page_off == 0 && chunk == PAGE_SIZE {
                self.write_page_full(page, &buf[done..done + chunk])?;
            } else {
                // Partial page: read-modify-write through a staging
                // buffer.
                let mut tmp = vec![0u8; PAGE_SIZE];
                self.read_page_full(page, &mut tmp)?;
                tmp[page_off..page_off + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.write_page_full(page, &tmp)?;
            }
            done += chunk;
        }
        Ok(())
    }

    /// Discard the pages fully covered by `[offset, offset+len)`.
    /// Partially covered edge pages are left untouched, since discard
    /// is advisory.
    pub fn discard(&self, offset: u64, len: usize) -> Result<()> {
        self.validate(offset, len)?;
        let first_full_page = offset.div_ceil(PAGE_SIZE as u64) as usize;
        let end = offset + len as u64;
        let last_full_page = (end / PAGE_SIZE as u64) as usize;
        for page in first_full_page..last_full_page {
            let mut guard = self.slots.lock(page);
            if self.free_page(&mut guard) {
                self.stats.io.notify_free.fetch_add(1, Ordering::Relaxed);
                self.stats.mm.pages_stored.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Read one full page into `dst` (`dst.len() == PAGE_SIZE`).
    fn read_page_full(&self, page: usize, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        let mut guard = self.slots.lock(page);
        guard.mark_accessed(0);
        let payload = guard.payload().clone();
        match payload {
            Payload::Empty => dst.fill(0),
            Payload::Same(word) => fill_with_word(dst, word),
            Payload::Entry(entry) => {
                let raw = self.pool.map_ro(entry.raw());
                if entry.len == PAGE_SIZE {
                    dst.copy_from_slice(&raw[..PAGE_SIZE]);
                } else {
                    self.codec.decompress(&raw[..entry.len], dst).map_err(|e| {
                        warn!("decompress failed for page {page}: {e}");
                        self.stats.io.failed_reads.fetch_add(1, Ordering::Relaxed);
                        e
                    })?;
                }
            }
            Payload::Backing(index) => {
                drop(guard);
                let backing = self.backing.ok_or(Error::NoBackingDevice)?;
                backing.read(index, dst).map_err(|e| {
                    self.stats.io.failed_reads.fetch_add(1, Ordering::Relaxed);
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Write one full page from `src` (`src.len() == PAGE_SIZE`).
    fn write_page_full(&self, page: usize, src: &[u8]) -> Result<()> {
        debug_assert_eq!(src.len(), PAGE_SIZE);

        if let Some(word) = same_filled(src) {
            let mut guard = self.slots.lock(page);
            let was_allocated = self.free_page(&mut guard);
            guard.set_payload(Payload::Same(word), 4, false);
            if !was_allocated {
                self.stats.mm.pages_stored.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.mm.same_pages.fetch_add(1, Ordering::Relaxed);
            self.stats
                .mm
                .orig_data_size
                .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
            return Ok(());
        }

        #[cfg(feature = "dedup")]
        if self.config.dedup_enabled {
            if let Some(dedup) = self.dedup {
                let checksum = Dedup::checksum(src);
                if let Some(entry) = dedup.find(checksum) {
                    let len = entry.len;
                    let mut guard = self.slots.lock(page);
                    let was_allocated = self.free_page(&mut guard);
                    guard.set_payload(Payload::Entry(entry), len, len == PAGE_SIZE);
                    if !was_allocated {
                        self.stats.mm.pages_stored.fetch_add(1, Ordering::Relaxed);
                    }
                    self.stats
                        .mm
                        .orig_data_size
                        .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
                    self.stats
                        .mm
                        .dup_data_size
                        .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }

        let compressed = self.codec.compress(src).map_err(|e| {
            warn!("compress failed for page {page}: {e}");
            self.stats.io.failed_writes.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        let huge = compressed.len() >= self.config.huge_class_size;
        let (store_len, store_bytes): (usize, &[u8]) = if huge {
            (PAGE_SIZE, src)
        } else {
            (compressed.len(), &compressed)
        };

        let raw = self.alloc_with_retry(store_len)?;

        let limit = self.mem_limit.get();
        if limit > 0 && self.pool.total_pages() as u64 > limit {
            self.pool.free(raw);
            return Err(Error::LimitExceeded);
        }

        self.pool.map_wo(raw)[..store_len].copy_from_slice(store_bytes);

        #[cfg(feature = "dedup")]
        let entry = if self.config.dedup_enabled {
            if let Some(dedup) = self.dedup {
                let checksum = Dedup::checksum(src);
                dedup.insert(checksum, raw, store_len)
            } else {
                EntryHandle::plain(raw, store_len)
            }
        } else {
            EntryHandle::plain(raw, store_len)
        };
        #[cfg(not(feature = "dedup"))]
        let entry = EntryHandle::plain(raw, store_len);

        let mut guard = self.slots.lock(page);
        let was_allocated = self.free_page(&mut guard);
        guard.set_payload(Payload::Entry(entry), store_len, huge);

        let ratio_pct = 100 - (store_len * 100 / PAGE_SIZE);
        if ratio_pct < self.config.low_ratio_threshold as usize {
            guard.set_flag(SlotFlag::CompressLow);
        }

        if !was_allocated {
            self.stats.mm.pages_stored.fetch_add(1, Ordering::Relaxed);
        }
        if huge {
            self.stats.mm.huge_pages.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .mm
            .orig_data_size
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        self.stats
            .mm
            .compr_data_size
            .fetch_add(store_len as u64, Ordering::Relaxed);
        let total = (self.pool.total_pages() as u64) * PAGE_SIZE as u64;
        self.stats.mm.mem_used_total.store(total, Ordering::Relaxed);
        self.stats.mm.bump_max_used(total);

        Ok(())
    }

    /// Two-attempt pool allocation. Our in-memory pool allocator has
    /// no per-CPU compressor workspace to borrow and release between
    /// attempts, so there is nothing to recompress; the retry exists
    /// to give a transient size-class exhaustion (a burst of
    /// same-sized allocations racing another thread) a second chance
    /// before surfacing out-of-memory.
    fn alloc_with_retry(&self, len: usize) -> Result<crate::pool::RawHandle> {
        match self.pool.alloc(len) {
            Ok(h) => Ok(h),
            Err(_) => {
                debug!("pool allocation stalled for {len} bytes, retrying");
                self.pool.alloc(len)
            }
        }
    }

    /// Release a slot's current contents under its lock. Returns
    /// whether the slot had been allocated (so the caller can keep
    /// `pages_stored` accurate). Never touches `LOCK` or `UNDER_WB`;
    /// the writeback path owns clearing `UNDER_WB` itself.
    pub(crate) fn free_page(&self, guard: &mut SlotGuard<'_>) -> bool {
        let was_allocated = guard.is_allocated();
        match guard.payload().clone() {
            Payload::Empty | Payload::Same(_) => {}
            Payload::Backing(index) => {
                if let Some(backing) = self.backing {
                    backing.free_block(index);
                }
            }
            Payload::Entry(entry) => {
                #[cfg(feature = "dedup")]
                {
                    if let Some(checksum) = entry.checksum {
                        if let Some(dedup) = self.dedup {
                            if let Some(raw) = dedup.release(checksum) {
                                self.pool.free(raw);
                            }
                        } else {
                            self.pool.free(entry.raw());
                        }
                    } else {
                        self.pool.free(entry.raw());
                    }
                }
                #[cfg(not(feature = "dedup"))]
                {
                    self.pool.free(entry.raw());
                }
            }
        }
        guard.clear();
        was_allocated
    }
}

/// A page is "same-filled" if every 4-byte lane holds the same value.
fn same_filled(page: &[u8]) -> Option<u32> {
    debug_assert_eq!(page.len() % 4, 0);
    let first = u32::from_ne_bytes(page[0..4].try_into().unwrap());
    for chunk in page.chunks_exact(4) {
        if u32::from_ne_bytes(chunk.try_into().unwrap()) != first {
            return None;
        }
    }
    Some(first)
}

fn fill_with_word(dst: &mut [u8], word: u32) {
    let bytes = word.to_ne_bytes();
    for chunk in dst.chunks_exact_mut(4) {
        chunk.copy_from_slice(&bytes);
    }
}
