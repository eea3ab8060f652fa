// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Compressed RAM block device engine.
//!
//! A [`Device`] stores each logical page either same-filled, deduped,
//! compressed, or (if it didn't compress well) uncompressed as a
//! "huge" page, in an in-memory [`Pool`]. Pages that compress poorly
//! and go unread across idle sweeps are eligible to be written back to
//! an external [`BackingDev`] via [`WritebackPolicy`], freeing their
//! pool storage while keeping reads transparent.
//!
//! # Example
//!
//! ```
//! use cram_core::Device;
//!
//! let dev = Device::new();
//! dev.write_attr("disksize", "4096").unwrap();
//! dev.write(0, &[0x5A; 4096]).unwrap();
//!
//! let mut out = [0u8; 4096];
//! dev.read(0, &mut out).unwrap();
//! assert_eq!(out, [0x5A; 4096]);
//! ```

mod backing;
mod codec;
mod config;
mod device;
mod error;
mod io_engine;
mod metrics;
mod pool;
mod slot;
mod slot_table;
mod writeback;

pub use backing::{BackingDev, BackingStats, BackingStore, FileBackingDev, MemBackingDev};
pub use codec::{Codec, DeflateCodec};
pub use config::{Config, IDLE_MAX, PAGE_SIZE};
pub use device::Device;
pub use error::{Error, Result};
pub use io_engine::{IoEngine, MemLimit, SECTOR_SIZE};
pub use metrics::{IdleStat, IoStat, MmStat, Stats};
pub use pool::{EntryHandle, InMemoryPool, Pool, RawHandle};
#[cfg(feature = "dedup")]
pub use pool::Dedup;
pub use slot::{Flags, Payload, Slot, SlotFlag, SlotGuard};
pub use slot_table::SlotTable;
pub use writeback::{CancelSignal, Mode, Outcome, Request, WritebackLimit, WritebackPolicy};
