// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The device: lifecycle (configure/reset) and the text control
//! surface every attribute dispatches through.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;
use parking_lot::{Mutex, RwLock};

use crate::backing::{BackingStore, FileBackingDev};
use crate::codec::{Codec, DeflateCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io_engine::{IoEngine, MemLimit};
use crate::metrics::Stats;
use crate::pool::InMemoryPool;
use crate::slot::SlotFlag;
use crate::slot_table::SlotTable;
use crate::writeback::{self, CancelSignal, WritebackLimit, WritebackPolicy};

#[cfg(feature = "dedup")]
use crate::pool::Dedup;

/// Everything that exists only once the device has a `disksize`.
struct Configured {
    config: Config,
    slots: SlotTable,
    pool: InMemoryPool,
    codec: Box<dyn Codec>,
    #[cfg(feature = "dedup")]
    dedup: Dedup,
    stats: Stats,
    backing: Option<BackingStore>,
}

/// A compressed RAM block device.
///
/// Mirrors the real device's state machine: unconfigured until
/// `disksize` is written, then configured for its lifetime until
/// `reset` tears it down. `init_lock` is a reader/writer lock:
/// configuration mutations take it for write, the data path and most
/// control reads take it for read.
pub struct Device {
    init_lock: RwLock<Option<Configured>>,
    pending: Mutex<Config>,
    comp_algorithm: Mutex<String>,
    backing_dev_path: Mutex<Option<PathBuf>>,
    mem_limit: MemLimit,
    wb_limit: WritebackLimit,
    cancel: CancelSignal,
    openers: AtomicUsize,
}

impl Device {
    #[must_use]
    pub fn new() -> Self {
        Self {
            init_lock: RwLock::new(None),
            pending: Mutex::new(Config::default()),
            comp_algorithm: Mutex::new("deflate".to_string()),
            backing_dev_path: Mutex::new(None),
            mem_limit: MemLimit::new(),
            wb_limit: WritebackLimit::new(),
            cancel: CancelSignal::new(),
            openers: AtomicUsize::new(0),
        }
    }

    /// Register an opener; `reset` refuses while this count is
    /// nonzero.
    pub fn open(&self) {
        self.openers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn close(&self) {
        self.openers.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.init_lock.read().is_some()
    }

    fn build_codec(name: &str) -> Result<Box<dyn Codec>> {
        match name {
            "deflate" => Ok(Box::new(DeflateCodec)),
            other => Err(Error::InvalidAttr(format!("comp_algorithm={other}"))),
        }
    }

    /// `disksize` write: allocate the slot table, pool, codec, and
    /// (if configured) backing store. Refuses a second call.
    fn configure(&self, disksize: u64) -> Result<()> {
        let mut slot = self.init_lock.write();
        if slot.is_some() {
            return Err(Error::AlreadyConfigured);
        }

        let mut config = self.pending.lock().clone();
        config.apply_attr("disksize", &disksize.to_string())?;

        let codec = Self::build_codec(&self.comp_algorithm.lock())?;

        let backing = match &*self.backing_dev_path.lock() {
            Some(path) if config.backing_page_count > 0 => Some(BackingStore::new(
                Box::new(FileBackingDev::open(path, config.backing_page_count)?),
                config.backing_page_count,
            )),
            _ => None,
        };

        let slots = SlotTable::new(config.page_count());
        info!(
            "device configured: disksize={} pages={}",
            config.disk_size,
            config.page_count()
        );

        *slot = Some(Configured {
            pool: InMemoryPool::new(),
            codec,
            #[cfg(feature = "dedup")]
            dedup: Dedup::new(),
            stats: Stats::new(),
            backing,
            slots,
            config,
        });
        Ok(())
    }

    /// Tear the device back down to unconfigured.
    fn reset(&self) -> Result<()> {
        if self.openers.load(Ordering::Acquire) > 0 {
            return Err(Error::DeviceBusy);
        }
        self.cancel.request();
        let mut slot = self.init_lock.write();
        *slot = None;
        self.cancel.clear();
        *self.pending.lock() = Config::default();
        *self.comp_algorithm.lock() = "deflate".to_string();
        *self.backing_dev_path.lock() = None;
        self.mem_limit.set(0);
        self.wb_limit.set_enabled(false);
        self.wb_limit.set_pages(0);
        info!("device reset to unconfigured");
        Ok(())
    }

    fn io_engine<'a>(&'a self, inner: &'a Configured) -> IoEngine<'a> {
        IoEngine {
            slots: &inner.slots,
            pool: &inner.pool,
            codec: inner.codec.as_ref(),
            #[cfg(feature = "dedup")]
            dedup: Some(&inner.dedup),
            stats: &inner.stats,
            config: &inner.config,
            mem_limit: &self.mem_limit,
            backing: inner.backing.as_ref(),
        }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let slot = self.init_lock.read();
        let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
        self.io_engine(inner).read(offset, buf)
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let slot = self.init_lock.read();
        let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
        self.io_engine(inner).write(offset, buf)
    }

    pub fn discard(&self, offset: u64, len: usize) -> Result<()> {
        let slot = self.init_lock.read();
        let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
        self.io_engine(inner).discard(offset, len)
    }

    fn mark_idle_all(&self, inner: &Configured) {
        for page in 0..inner.slots.len() {
            let mut guard = inner.slots.lock(page);
            if guard.is_allocated() && guard.flags().compress_low {
                guard.set_flag(SlotFlag::Idle);
                guard.inc_idle();
                inner.stats.idle.marked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn clear_idle_all(&self, inner: &Configured) {
        for page in 0..inner.slots.len() {
            let mut guard = inner.slots.lock(page);
            if guard.flags().idle {
                guard.clear_flag(SlotFlag::Idle);
                guard.clear_idle_count();
                inner.stats.idle.cleared.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run `attribute = value` the way the real control surface would.
    pub fn write_attr(&self, key: &str, value: &str) -> Result<()> {
        match key {
            "disksize" => {
                let bytes: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("disksize={value}")))?;
                self.configure(bytes)
            }
            "reset" => {
                if value.trim() == "0" {
                    return Ok(());
                }
                self.reset()
            }
            "compact" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                inner.pool.compact();
                Ok(())
            }
            "mem_limit" => {
                let pages: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("mem_limit={value}")))?;
                self.mem_limit.set(pages);
                Ok(())
            }
            "mem_used_max" => {
                if value.trim() != "0" {
                    return Err(Error::InvalidAttr(format!("mem_used_max={value}")));
                }
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                inner
                    .stats
                    .mm
                    .mem_used_max
                    .store(0, Ordering::Relaxed);
                Ok(())
            }
            "idle" => {
                if value.trim() != "all" {
                    return Err(Error::InvalidAttr(format!("idle={value}")));
                }
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                self.mark_idle_all(inner);
                Ok(())
            }
            "new" => {
                if value.trim() != "all" {
                    return Err(Error::InvalidAttr(format!("new={value}")));
                }
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                self.clear_idle_all(inner);
                Ok(())
            }
            "comp_algorithm" => {
                if self.is_configured() {
                    return Err(Error::AlreadyConfigured);
                }
                Self::build_codec(value)?; // validate before committing
                *self.comp_algorithm.lock() = value.to_string();
                Ok(())
            }
            "backing_dev" => {
                if self.is_configured() {
                    return Err(Error::AlreadyConfigured);
                }
                *self.backing_dev_path.lock() = Some(PathBuf::from(value));
                Ok(())
            }
            "writeback" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                let io = self.io_engine(inner);
                if io.backing.is_none() {
                    return Err(Error::NoBackingDevice);
                }
                let policy = WritebackPolicy {
                    io,
                    limit: &self.wb_limit,
                    cancel: &self.cancel,
                };
                policy.run(value).map(|_| ())
            }
            "writeback_limit" => {
                let pages: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("writeback_limit={value}")))?;
                self.wb_limit.set_pages(pages);
                Ok(())
            }
            "writeback_limit_enable" => {
                self.wb_limit.set_enabled(matches!(value, "1" | "true" | "on"));
                Ok(())
            }
            // Ambient config tunables: only settable before configure,
            // staged in `pending`.
            "huge_class_size" | "low_ratio_threshold" | "backing_page_count"
            | "max_writeback_batch" | "dedup" => {
                if self.is_configured() {
                    return Err(Error::AlreadyConfigured);
                }
                self.pending.lock().apply_attr(key, value)
            }
            other => Err(Error::InvalidAttr(other.to_string())),
        }
    }

    /// Run the `writeback` attribute and return its outcome, for
    /// callers (like the CLI) that want the counts rather than just
    /// success/failure.
    pub fn run_writeback(&self, mode_str: &str) -> Result<writeback::Outcome> {
        let slot = self.init_lock.read();
        let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
        let io = self.io_engine(inner);
        if io.backing.is_none() {
            return Err(Error::NoBackingDevice);
        }
        let policy = WritebackPolicy {
            io,
            limit: &self.wb_limit,
            cancel: &self.cancel,
        };
        policy.run(mode_str)
    }

    /// Read `attribute`'s current value.
    pub fn read_attr(&self, key: &str) -> Result<String> {
        match key {
            "disksize" => {
                let slot = self.init_lock.read();
                Ok(slot.as_ref().map_or(0, |c| c.config.disk_size).to_string())
            }
            "initstate" => Ok(if self.is_configured() { "1" } else { "0" }.to_string()),
            "comp_algorithm" => Ok(self.comp_algorithm.lock().clone()),
            "backing_dev" => Ok(self
                .backing_dev_path
                .lock()
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            "writeback_limit" => Ok(self.wb_limit.remaining_pages().to_string()),
            "writeback_limit_enable" => Ok(if self.wb_limit.enabled() { "1" } else { "0" }.to_string()),
            "mm_stat" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                Ok(inner.stats.mm.format())
            }
            "io_stat" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                Ok(inner.stats.io.format())
            }
            "idle_stat" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                Ok(inner.stats.idle.format())
            }
            "bd_stat" => {
                let slot = self.init_lock.read();
                let inner = slot.as_ref().ok_or(Error::NotConfigured)?;
                match &inner.backing {
                    Some(b) => {
                        let (count, reads, writes) = b.stats.snapshot();
                        Ok(format!("{count} {reads} {writes}"))
                    }
                    None => Ok("0 0 0".to_string()),
                }
            }
            // Reserved attributes with no dedicated counters yet.
            "debug_stat" | "new_stat" => Ok(String::new()),
            other => Err(Error::InvalidAttr(other.to_string())),
        }
    }

}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}
