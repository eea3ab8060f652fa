// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The compact allocator that backs compressed page storage, plus the
//! optional content-deduplication index layered on top of it.
//!
//! [`Pool`] is an abstract collaborator: callers never need to know
//! whether storage comes from [`InMemoryPool`]'s size-classed slabs or
//! some other allocator. [`InMemoryPool`] is this crate's default
//! implementation, sized in classes the way a slab allocator usually
//! is, but bounded to page-sized (`<= PAGE_SIZE`) allocations since
//! that's all a compressed page can ever need.

use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};

/// Opaque handle into a [`Pool`]'s storage.
///
/// Encoded as `class_id << 16 | slot_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(u32);

impl RawHandle {
    fn new(class_id: u16, slot_id: u16) -> Self {
        Self((u32::from(class_id) << 16) | u32::from(slot_id))
    }

    fn class_id(self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn slot_id(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// A slot's reference to its stored payload, combining the raw pool
/// handle with the bookkeeping the dedup layer needs to find and
/// release it.
#[derive(Debug, Clone)]
pub struct EntryHandle {
    pub(crate) raw: RawHandle,
    pub(crate) checksum: Option<u64>,
    pub len: usize,
}

/// Abstract compact allocator for compressed page payloads.
pub trait Pool: Send + Sync {
    /// Allocate storage for `len` bytes (`1..=PAGE_SIZE`).
    fn alloc(&self, len: usize) -> Result<RawHandle>;
    /// Return `handle`'s storage to the pool.
    fn free(&self, handle: RawHandle);
    /// Read-only view of the stored bytes.
    fn map_ro(&self, handle: RawHandle) -> &[u8];
    /// Writable view of the stored bytes, for the caller to fill
    /// immediately after `alloc`.
    fn map_wo(&self, handle: RawHandle) -> &mut [u8];
    /// Total pages (`PAGE_SIZE` units, rounded up) currently reserved
    /// across all size classes.
    fn total_pages(&self) -> usize;
    /// Best-effort compaction; a no-op for allocators that don't
    /// fragment (like the default slab implementation).
    fn compact(&self) {}
}

const SIZE_CLASSES: &[(usize, usize)] = &[
    (32, 128),
    (64, 128),
    (128, 128),
    (256, 128),
    (512, 64),
    (1024, 64),
    (2048, 32),
    (PAGE_SIZE, 32),
];

struct SlabClass {
    slot_size: usize,
    slots: Mutex<Vec<Box<[u8]>>>,
    bitmap: Mutex<Vec<u64>>,
}

/// Upper bound on slots per class (handles are `u16`-addressed).
/// Reserved up front so the backing `Vec` never reallocates, which
/// would invalidate the raw pointers `map_ro`/`map_wo` hand out.
const MAX_SLOTS_PER_CLASS: usize = u16::MAX as usize + 1;

impl SlabClass {
    fn new(slot_size: usize, initial_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(MAX_SLOTS_PER_CLASS);
        slots.extend((0..initial_slots).map(|_| vec![0u8; slot_size].into_boxed_slice()));
        let words = initial_slots.div_ceil(64).max(1);
        Self {
            slot_size,
            slots: Mutex::new(slots),
            bitmap: Mutex::new(vec![0u64; words]),
        }
    }

    fn try_reserve(&self) -> Option<u16> {
        let mut bitmap = self.bitmap.lock();
        for (word_idx, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let slot_index = word_idx * 64 + bit as usize;
            let mut slots = self.slots.lock();
            if slot_index >= slots.len() {
                slots.push(vec![0u8; self.slot_size].into_boxed_slice());
            }
            *word |= 1u64 << bit;
            return u16::try_from(slot_index).ok();
        }
        // All existing words full: grow by one word (64 more slots).
        let word_idx = bitmap.len();
        bitmap.push(1);
        let slot_index = word_idx * 64;
        let mut slots = self.slots.lock();
        slots.push(vec![0u8; self.slot_size].into_boxed_slice());
        u16::try_from(slot_index).ok()
    }

    fn release(&self, slot_id: u16) {
        let word_idx = usize::from(slot_id) / 64;
        let bit = usize::from(slot_id) % 64;
        let mut bitmap = self.bitmap.lock();
        if word_idx < bitmap.len() {
            bitmap[word_idx] &= !(1u64 << bit);
        }
    }

    fn reserved_count(&self) -> usize {
        self.bitmap
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

/// Default in-process [`Pool`] implementation: size-classed slabs
/// with a mutex-guarded bitmap per class, without a lock-free fast
/// path, since compressed-page churn is orders of magnitude lower
/// frequency than per-message transport buffers.
pub struct InMemoryPool {
    classes: Vec<SlabClass>,
}

impl InMemoryPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: SIZE_CLASSES
                .iter()
                .map(|&(size, count)| SlabClass::new(size, count))
                .collect(),
        }
    }
}

impl Default for InMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool for InMemoryPool {
    fn alloc(&self, len: usize) -> Result<RawHandle> {
        let start = SIZE_CLASSES
            .iter()
            .position(|&(size, _)| size >= len)
            .ok_or(Error::OutOfMemory)?;
        for (class_id, class) in self.classes.iter().enumerate().skip(start) {
            if let Some(slot_id) = class.try_reserve() {
                return Ok(RawHandle::new(class_id as u16, slot_id));
            }
        }
        Err(Error::OutOfMemory)
    }

    fn free(&self, handle: RawHandle) {
        let class = &self.classes[usize::from(handle.class_id())];
        class.release(handle.slot_id());
    }

    fn map_ro(&self, handle: RawHandle) -> &[u8] {
        let class = &self.classes[usize::from(handle.class_id())];
        // SAFETY: `slots`' capacity is reserved to MAX_SLOTS_PER_CLASS
        // up front (see SlabClass::new), so concurrent pushes never
        // reallocate the backing buffer and invalidate this pointer.
        // The caller holds the owning slot's lock, which is the only
        // path that can reach a live handle, and the bitmap
        // reservation guarantees no concurrent alias of this index.
        let slots = unsafe { &*(class.slots.data_ptr()) };
        &slots[usize::from(handle.slot_id())]
    }

    fn map_wo(&self, handle: RawHandle) -> &mut [u8] {
        let class = &self.classes[usize::from(handle.class_id())];
        // SAFETY: see `map_ro`; exclusivity is the same.
        let slots = unsafe { &mut *(class.slots.data_ptr()) };
        &mut slots[usize::from(handle.slot_id())]
    }

    fn total_pages(&self) -> usize {
        self.classes
            .iter()
            .map(|c| (c.reserved_count() * c.slot_size).div_ceil(PAGE_SIZE))
            .sum()
    }
}

/// A single entry in the content-dedup index: the handle a checksum
/// currently resolves to, plus a reference count of how many slots
/// point at it.
struct DedupSlot {
    handle: RawHandle,
    len: usize,
    refcount: AtomicU32,
}

/// Content-based deduplication index, keyed by a fast checksum of the
/// *uncompressed* page. Optional: when the `dedup` feature is off (or
/// the caller never consults it), entries behave exactly like bare
/// pool handles with no refcount.
#[cfg(feature = "dedup")]
pub struct Dedup {
    index: dashmap::DashMap<u64, DedupSlot>,
}

#[cfg(feature = "dedup")]
impl Dedup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: dashmap::DashMap::new(),
        }
    }

    /// Checksum a page. Not cryptographic; collisions are resolved by
    /// the caller doing a full byte comparison before trusting a hit.
    #[must_use]
    pub fn checksum(page: &[u8]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for &byte in page {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        hash
    }

    /// Look up an existing entry for `checksum`, bumping its
    /// refcount. Returns the handle to reuse.
    pub fn find(&self, checksum: u64) -> Option<EntryHandle> {
        let slot = self.index.get(&checksum)?;
        slot.refcount.fetch_add(1, Ordering::AcqRel);
        Some(EntryHandle {
            raw: slot.handle,
            checksum: Some(checksum),
            len: slot.len,
        })
    }

    /// Register a freshly stored entry under `checksum` with an
    /// initial refcount of 1.
    pub fn insert(&self, checksum: u64, handle: RawHandle, len: usize) -> EntryHandle {
        self.index.insert(
            checksum,
            DedupSlot {
                handle,
                len,
                refcount: AtomicU32::new(1),
            },
        );
        EntryHandle {
            raw: handle,
            checksum: Some(checksum),
            len,
        }
    }

    /// Drop one reference. Returns `Some(handle)` if the refcount hit
    /// zero and the caller must now free the underlying pool storage.
    pub fn release(&self, checksum: u64) -> Option<RawHandle> {
        let remove = {
            let slot = self.index.get(&checksum)?;
            slot.refcount.fetch_sub(1, Ordering::AcqRel) == 1
        };
        if remove {
            self.index.remove(&checksum).map(|(_, slot)| slot.handle)
        } else {
            None
        }
    }
}

#[cfg(feature = "dedup")]
impl Default for Dedup {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable handle the rest of the engine stores in [`crate::slot::Payload::Entry`].
impl EntryHandle {
    pub(crate) fn plain(raw: RawHandle, len: usize) -> Self {
        Self {
            raw,
            checksum: None,
            len,
        }
    }

    #[must_use]
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_roundtrip_bytes() {
        let pool = InMemoryPool::new();
        let h = pool.alloc(100).unwrap();
        pool.map_wo(h).copy_from_slice(&vec![0xAB; 128]);
        assert_eq!(pool.map_ro(h)[0], 0xAB);
        pool.free(h);
    }

    #[test]
    fn alloc_picks_smallest_fitting_class() {
        let pool = InMemoryPool::new();
        let h = pool.alloc(10).unwrap();
        assert_eq!(pool.map_ro(h).len(), 32);
    }

    #[test]
    fn pool_grows_when_class_exhausted() {
        let pool = InMemoryPool::new();
        let mut handles = Vec::new();
        for _ in 0..200 {
            handles.push(pool.alloc(32).unwrap());
        }
        assert!(pool.total_pages() > 0);
        for h in handles {
            pool.free(h);
        }
    }

    #[test]
    fn alloc_rejects_oversized_request() {
        let pool = InMemoryPool::new();
        assert!(pool.alloc(PAGE_SIZE + 1).is_err());
    }

    #[cfg(feature = "dedup")]
    #[test]
    fn dedup_find_bumps_refcount_and_release_frees_at_zero() {
        let dedup = Dedup::new();
        let pool = InMemoryPool::new();
        let page = vec![7u8; 64];
        let checksum = Dedup::checksum(&page);

        assert!(dedup.find(checksum).is_none());
        let raw = pool.alloc(64).unwrap();
        let entry = dedup.insert(checksum, raw, 64);
        assert_eq!(entry.raw().class_id(), raw.class_id());

        let reused = dedup.find(checksum).expect("should hit");
        assert_eq!(reused.raw().0, raw.0);

        assert!(dedup.release(checksum).is_none(), "refcount was 2, not freed");
        let freed = dedup.release(checksum);
        assert_eq!(freed, Some(raw));
    }
}
