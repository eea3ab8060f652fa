// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-wide tunables, fixed at configure time.
//!
//! Unlike a live topic's QoS, these are set once when the device is
//! sized and do not change for the lifetime of the device; there is no
//! need for a concurrent map here.

use crate::error::{Error, Result};

/// Logical and physical page size used throughout the engine.
pub const PAGE_SIZE: usize = 4096;

/// Saturating cap on a slot's idle-epoch counter.
pub const IDLE_MAX: u32 = u8::MAX as u32;

/// Device-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total addressable size in bytes; always a multiple of
    /// [`PAGE_SIZE`].
    pub disk_size: u64,

    /// Compressed size at or above which a page is stored
    /// uncompressed and flagged `HUGE`.
    pub huge_class_size: usize,

    /// Compression ratio threshold (percent of space saved) below
    /// which a slot is flagged `COMPRESS_LOW` and becomes eligible
    /// for idle-mode writeback.
    pub low_ratio_threshold: u8,

    /// Number of pages held on the backing device.
    pub backing_page_count: u64,

    /// Maximum number of pages flushed in a single writeback batch.
    pub max_writeback_batch: usize,

    /// Whether the optional content-dedup hook is consulted on write.
    pub dedup_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disk_size: 0,
            huge_class_size: PAGE_SIZE,
            low_ratio_threshold: 40,
            backing_page_count: 0,
            max_writeback_batch: 32,
            dedup_enabled: cfg!(feature = "dedup"),
        }
    }
}

impl Config {
    /// Number of logical pages implied by `disk_size`.
    #[must_use]
    pub fn page_count(&self) -> usize {
        (self.disk_size as usize) / PAGE_SIZE
    }

    /// Apply a single `key=value` control-surface attribute to this
    /// configuration. Used both by [`crate::device::Device`] and
    /// directly by callers building a `Config` from a batch of
    /// attributes before the device is configured.
    pub fn apply_attr(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "disksize" => {
                let bytes: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("disksize={value}")))?;
                self.disk_size = round_up(bytes, PAGE_SIZE as u64);
            }
            "huge_class_size" => {
                self.huge_class_size = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("huge_class_size={value}")))?;
            }
            "low_ratio_threshold" => {
                self.low_ratio_threshold = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("low_ratio_threshold={value}")))?;
            }
            "backing_page_count" => {
                self.backing_page_count = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("backing_page_count={value}")))?;
            }
            "max_writeback_batch" => {
                self.max_writeback_batch = value
                    .parse()
                    .map_err(|_| Error::InvalidAttr(format!("max_writeback_batch={value}")))?;
            }
            "dedup" => {
                self.dedup_enabled = matches!(value, "1" | "true" | "on");
            }
            other => return Err(Error::InvalidAttr(other.to_string())),
        }
        Ok(())
    }
}

fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dedup_matches_feature() {
        let cfg = Config::default();
        assert_eq!(cfg.dedup_enabled, cfg!(feature = "dedup"));
    }

    #[test]
    fn disksize_rounds_up_to_page_size() {
        let mut cfg = Config::default();
        cfg.apply_attr("disksize", "1").unwrap();
        assert_eq!(cfg.disk_size, PAGE_SIZE as u64);
        assert_eq!(cfg.page_count(), 1);
    }

    #[test]
    fn disksize_exact_multiple_unchanged() {
        let mut cfg = Config::default();
        cfg.apply_attr("disksize", &(PAGE_SIZE * 4).to_string())
            .unwrap();
        assert_eq!(cfg.page_count(), 4);
    }

    #[test]
    fn unknown_attr_rejected() {
        let mut cfg = Config::default();
        assert!(cfg.apply_attr("bogus", "1").is_err());
    }

    #[test]
    fn bad_value_rejected() {
        let mut cfg = Config::default();
        assert!(cfg.apply_attr("disksize", "not-a-number").is_err());
    }
}
