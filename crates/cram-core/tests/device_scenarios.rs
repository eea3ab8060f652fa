// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scenario-level tests driving a whole [`Device`] through its public
//! control surface and block surface, rather than exercising one
//! module's internals directly.

use cram_core::{Device, PAGE_SIZE};

fn configured(pages: usize) -> Device {
    let dev = Device::new();
    dev.write_attr("disksize", &(pages * PAGE_SIZE).to_string())
        .unwrap();
    dev
}

fn backed(pages: usize, backing_pages: u64) -> (Device, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "cram-scenario-{}-{}",
        std::process::id(),
        backing_pages
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let backing_path = dir.join("backing.img");

    let dev = Device::new();
    dev.write_attr("backing_dev", backing_path.to_str().unwrap())
        .unwrap();
    dev.write_attr("backing_page_count", &backing_pages.to_string())
        .unwrap();
    dev.write_attr("disksize", &(pages * PAGE_SIZE).to_string())
        .unwrap();
    (dev, dir)
}

fn incompressible_page(seed: usize) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| ((i * 2654435761usize + seed * 97) % 256) as u8)
        .collect()
}

/// Same-fill detection and round-trip.
#[test]
fn scenario_same_fill_page() {
    let dev = configured(1);
    dev.write(0, &[0x5A; PAGE_SIZE]).unwrap();

    let mm = dev.read_attr("mm_stat").unwrap();
    let same_pages: u64 = mm.split_whitespace().nth(5).unwrap().parse().unwrap();
    assert_eq!(same_pages, 1);

    let mut out = [0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, [0x5A; PAGE_SIZE]);
}

/// A page that does not compress below `huge_class_size`
/// is stored uncompressed and flagged huge, and `writeback huge`
/// evicts it.
#[test]
fn scenario_huge_page_written_back() {
    let dir = std::env::temp_dir().join(format!("cram-scenario-huge-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let backing_path = dir.join("backing.img");

    let dev = Device::new();
    dev.write_attr("backing_dev", backing_path.to_str().unwrap())
        .unwrap();
    dev.write_attr("backing_page_count", "8").unwrap();
    dev.write_attr("huge_class_size", "1").unwrap(); // force every page huge
    dev.write_attr("disksize", &(2 * PAGE_SIZE).to_string())
        .unwrap();

    let page = incompressible_page(0);
    dev.write(0, &page).unwrap();

    let mm = dev.read_attr("mm_stat").unwrap();
    let huge_pages: u64 = mm.split_whitespace().nth(6).unwrap().parse().unwrap();
    assert_eq!(huge_pages, 1);

    let outcome = dev.run_writeback("huge").unwrap();
    assert_eq!(outcome.pages_written, 1);

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, page);

    let _ = std::fs::remove_dir_all(&dir);
}

/// A partial-page write overwrites exactly its window and
/// leaves the surrounding bytes untouched.
#[test]
fn scenario_partial_write_window() {
    let dev = configured(1);
    let base = incompressible_page(1);
    dev.write(0, &base).unwrap();

    let patch = vec![0xEEu8; 2048];
    dev.write(1024, &patch).unwrap();

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(&out[..1024], &base[..1024]);
    assert_eq!(&out[1024..3072], &patch[..]);
    assert_eq!(&out[3072..], &base[3072..]);
}

/// A misaligned request is rejected and counted, without
/// disturbing existing data.
#[test]
fn scenario_misaligned_request_rejected() {
    let dev = configured(1);
    let page = [0x11u8; PAGE_SIZE];
    dev.write(0, &page).unwrap();

    // Sector 1 (byte offset 512), a full page in length: 512-byte
    // aligned but not page-aligned, so it must be rejected.
    let mut buf = [0u8; PAGE_SIZE];
    let err = dev.read(cram_core::SECTOR_SIZE as u64, &mut buf).unwrap_err();
    assert!(matches!(err, cram_core::Error::InvalidIo { .. }));

    let io_stat = dev.read_attr("io_stat").unwrap();
    let invalid_io: u64 = io_stat.split_whitespace().nth(2).unwrap().parse().unwrap();
    assert_eq!(invalid_io, 1);

    let mut out = [0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, page, "data must be unchanged by the rejected request");
}

/// Discard then read yields zeros.
#[test]
fn law_discard_then_read_yields_zeros() {
    let dev = configured(1);
    dev.write(0, &[0x77; PAGE_SIZE]).unwrap();
    dev.discard(0, PAGE_SIZE).unwrap();

    let mut out = [0xFFu8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, [0u8; PAGE_SIZE]);
}

/// Writing a batch of low-entropy pages, marking them idle, and
/// writing them back leaves every page readable and correct, with
/// `bd_stat.count` reflecting the evicted count.
#[test]
fn scenario_idle_sweep_then_writeback_transparent() {
    let pages = 16;
    let (dev, dir) = backed(pages, pages as u64 * 2);
    dev.write_attr("low_ratio_threshold", "90").unwrap();

    let mut written = Vec::new();
    for i in 0..pages {
        // Low-entropy but not same-filled: a short repeating motif.
        let page: Vec<u8> = (0..PAGE_SIZE).map(|b| ((b / 64) % 3) as u8).collect();
        dev.write((i * PAGE_SIZE) as u64, &page).unwrap();
        written.push(page);
    }

    dev.write_attr("idle", "all").unwrap();
    let outcome = dev.run_writeback("idle").unwrap();
    assert!(outcome.pages_written > 0, "expected at least one eviction");

    let bd = dev.read_attr("bd_stat").unwrap();
    let count: u64 = bd.split_whitespace().next().unwrap().parse().unwrap();
    assert_eq!(count as usize, outcome.pages_written);

    for (i, expected) in written.iter().enumerate() {
        let mut out = vec![0u8; PAGE_SIZE];
        dev.read((i * PAGE_SIZE) as u64, &mut out).unwrap();
        assert_eq!(&out, expected, "page {i} must read back unchanged after writeback");
    }

    let _ = std::fs::remove_dir_all(&dir);
}

/// `writeback_limit`/`writeback_limit_enable` cap how many pages a
/// single `writeback idle` invocation will write.
#[test]
fn writeback_limit_caps_pages_written() {
    let pages = 8;
    let (dev, dir) = backed(pages, pages as u64 * 2);
    dev.write_attr("low_ratio_threshold", "90").unwrap();

    for i in 0..pages {
        let page = incompressible_page(i);
        dev.write((i * PAGE_SIZE) as u64, &page).unwrap();
    }
    dev.write_attr("idle", "all").unwrap();

    dev.write_attr("writeback_limit_enable", "1").unwrap();
    dev.write_attr("writeback_limit", "3").unwrap();

    let outcome = dev.run_writeback("idle").unwrap();
    assert!(outcome.pages_written <= 3);

    let _ = std::fs::remove_dir_all(&dir);
}

/// After `reset`, a freshly configured device has no leftover data
/// and zeroed counters.
#[test]
fn law_reset_yields_fresh_zeroed_device() {
    let dev = configured(4);
    dev.write(0, &[0x33; PAGE_SIZE]).unwrap();
    dev.write_attr("reset", "1").unwrap();
    assert_eq!(dev.read_attr("initstate").unwrap(), "0");

    dev.write_attr("disksize", &(4 * PAGE_SIZE).to_string())
        .unwrap();
    let mm = dev.read_attr("mm_stat").unwrap();
    for field in mm.split_whitespace() {
        assert_eq!(field, "0", "fresh device's mm_stat must be all zero");
    }

    let mut out = [0xFFu8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, [0u8; PAGE_SIZE]);
}

/// Reset is refused while the device has openers.
#[test]
fn reset_refused_while_device_has_openers() {
    let dev = configured(1);
    dev.open();
    assert!(matches!(
        dev.write_attr("reset", "1"),
        Err(cram_core::Error::DeviceBusy)
    ));
    dev.close();
    dev.write_attr("reset", "1").unwrap();
}

/// A writeback sweep that runs out of backing space mid-sweep leaves
/// every slot independently readable — none half-evicted.
#[test]
fn writeback_exhausted_backing_leaves_clean_state() {
    let pages = 8;
    // Only 2 backing blocks for 8 candidate pages: the sweep must
    // stop cleanly once `alloc_block` starts returning `None`.
    let (dev, dir) = backed(pages, 2);
    dev.write_attr("low_ratio_threshold", "90").unwrap();
    for i in 0..pages {
        dev.write((i * PAGE_SIZE) as u64, &incompressible_page(i))
            .unwrap();
    }
    dev.write_attr("idle", "all").unwrap();

    let outcome = dev.run_writeback("idle").unwrap();
    assert!(outcome.pages_written <= 2);

    for i in 0..pages {
        let mut out = vec![0u8; PAGE_SIZE];
        dev.read((i * PAGE_SIZE) as u64, &mut out).unwrap();
        assert_eq!(out, incompressible_page(i));
    }

    let _ = std::fs::remove_dir_all(&dir);
}
