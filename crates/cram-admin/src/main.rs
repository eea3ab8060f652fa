// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! cram Administration CLI
//!
//! Exercises a compressed RAM block device's control surface
//! (`disksize`, `writeback`, `mm_stat`/`io_stat`/`bd_stat`/`idle_stat`,
//! ...) against a freshly configured in-process [`cram_core::Device`].
//!
//! There is no daemon to attach to: the device lives only for the
//! duration of one invocation, so this tool is a way to configure a
//! device from flags, run one control-surface operation against it,
//! and print the result, rather than a client of a running service.
//!
//! # Usage
//!
//! ```bash
//! # Configure a 16M device and show its mm_stat after a demo write
//! cram-admin --disksize 16M demo
//!
//! # Configure with a backing file and run an idle writeback
//! cram-admin --disksize 16M --backing-dev /tmp/cram.img --backing-pages 4096 \
//!     writeback idle
//!
//! # Inspect a single attribute
//! cram-admin --disksize 16M get mm_stat
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use cram_core::Device;
use tabled::{Table, Tabled};
use tracing_subscriber::{fmt, EnvFilter};

/// cram Administration CLI
#[derive(Parser, Debug)]
#[command(name = "cram-admin")]
#[command(about = "Administration CLI for cram compressed RAM block devices")]
#[command(version)]
struct Args {
    /// Device size, accepts a byte count or a `K`/`M`/`G`-suffixed
    /// shorthand (e.g. `16M`). Rounded up to the page size.
    #[arg(short, long, default_value = "16M")]
    disksize: String,

    /// Compression backend name.
    #[arg(long, default_value = "deflate")]
    comp_algorithm: String,

    /// Path to a file used as the writeback backing device. Omit to
    /// run with no backing device (writeback then fails).
    #[arg(long)]
    backing_dev: Option<String>,

    /// Page count reserved on the backing device.
    #[arg(long, default_value = "0")]
    backing_pages: u64,

    /// Compressed size at/above which a page is stored uncompressed
    /// and flagged huge.
    #[arg(long)]
    huge_class_size: Option<usize>,

    /// Compression ratio percentage below which a page becomes
    /// eligible for idle-mode writeback.
    #[arg(long)]
    low_ratio_threshold: Option<u8>,

    /// Increase log verbosity.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show configured-device info (initstate, disksize, codec, backing).
    Info,

    /// Show one or all stat blocks (mm_stat / io_stat / bd_stat / idle_stat).
    Stat {
        /// Which block to print; omit for all.
        #[arg(value_enum)]
        which: Option<StatKind>,
    },

    /// Read a single control attribute.
    Get {
        /// Attribute name, e.g. `mm_stat`.
        key: String,
    },

    /// Write a single control attribute.
    Set {
        /// `key=value`, e.g. `mem_limit=4096`.
        assignment: String,
    },

    /// Run a `writeback` sweep (`huge`, `idle`, or `idle <max> [<min>]`).
    Writeback {
        /// The mode string, passed through to the `writeback` attribute.
        #[arg(default_value = "idle")]
        mode_str: String,
    },

    /// Tear the device back down to unconfigured.
    Reset,

    /// Write a handful of same-filled, random, and huge-class pages
    /// and print `mm_stat` before/after, to sanity-check the pipeline
    /// end to end.
    Demo {
        /// Number of pages to write.
        #[arg(short, long, default_value = "8")]
        pages: usize,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StatKind {
    Mm,
    Io,
    Bd,
    Idle,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("cram_admin=debug,cram_core=debug")
    } else {
        EnvFilter::new("cram_admin=info,cram_core=warn")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(args) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let dev = Device::new();

    if let Some(ref path) = args.backing_dev {
        dev.write_attr("backing_dev", path)
            .context("setting backing_dev")?;
        dev.write_attr("backing_page_count", &args.backing_pages.to_string())
            .context("setting backing_page_count")?;
    }
    dev.write_attr("comp_algorithm", &args.comp_algorithm)
        .context("setting comp_algorithm")?;
    if let Some(size) = args.huge_class_size {
        dev.write_attr("huge_class_size", &size.to_string())
            .context("setting huge_class_size")?;
    }
    if let Some(pct) = args.low_ratio_threshold {
        dev.write_attr("low_ratio_threshold", &pct.to_string())
            .context("setting low_ratio_threshold")?;
    }

    let disksize = parse_size(&args.disksize)
        .with_context(|| format!("invalid --disksize {:?}", args.disksize))?;
    dev.write_attr("disksize", &disksize.to_string())
        .context("configuring disksize")?;

    tracing::info!(disksize, comp_algorithm = %args.comp_algorithm, "device configured");

    match args.command {
        Commands::Info => cmd_info(&dev),
        Commands::Stat { which } => cmd_stat(&dev, which),
        Commands::Get { key } => cmd_get(&dev, &key),
        Commands::Set { assignment } => cmd_set(&dev, &assignment),
        Commands::Writeback { mode_str } => cmd_writeback(&dev, &mode_str),
        Commands::Reset => cmd_reset(&dev),
        Commands::Demo { pages } => cmd_demo(&dev, pages),
    }
}

#[derive(Tabled)]
struct AttrRow {
    #[tabled(rename = "Attribute")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn cmd_info(dev: &Device) -> Result<()> {
    println!("{}", "Device Info".cyan().bold());
    let rows = ["initstate", "disksize", "comp_algorithm", "backing_dev"]
        .into_iter()
        .map(|key| {
            let value = dev.read_attr(key).unwrap_or_else(|e| format!("<{e}>"));
            AttrRow {
                key: key.to_string(),
                value,
            }
        })
        .collect::<Vec<_>>();
    println!("{}", Table::new(rows));
    Ok(())
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Field")]
    field: String,
    #[tabled(rename = "Value")]
    value: u64,
}

fn mm_rows(raw: &str) -> Vec<StatRow> {
    const FIELDS: &[&str] = &[
        "orig_data_size",
        "compr_data_size",
        "mem_used_total",
        "pages_stored",
        "mem_used_max",
        "same_pages",
        "huge_pages",
        "pages_compacted",
    ];
    zip_fields(FIELDS, raw)
}

fn io_rows(raw: &str) -> Vec<StatRow> {
    const FIELDS: &[&str] = &["failed_reads", "failed_writes", "invalid_io", "notify_free"];
    zip_fields(FIELDS, raw)
}

fn idle_rows(raw: &str) -> Vec<StatRow> {
    const FIELDS: &[&str] = &["marked", "cleared"];
    zip_fields(FIELDS, raw)
}

fn bd_rows(raw: &str) -> Vec<StatRow> {
    const FIELDS: &[&str] = &["count", "reads", "writes"];
    zip_fields(FIELDS, raw)
}

fn zip_fields(fields: &[&str], raw: &str) -> Vec<StatRow> {
    fields
        .iter()
        .zip(raw.split_whitespace())
        .map(|(&field, value)| StatRow {
            field: field.to_string(),
            value: value.parse().unwrap_or(0),
        })
        .collect()
}

fn cmd_stat(dev: &Device, which: Option<StatKind>) -> Result<()> {
    let kinds = match which {
        Some(k) => vec![k],
        None => vec![StatKind::Mm, StatKind::Io, StatKind::Bd, StatKind::Idle],
    };
    for kind in kinds {
        let (title, attr, rows) = match kind {
            StatKind::Mm => ("mm_stat", "mm_stat", mm_rows as fn(&str) -> Vec<StatRow>),
            StatKind::Io => ("io_stat", "io_stat", io_rows),
            StatKind::Bd => ("bd_stat", "bd_stat", bd_rows),
            StatKind::Idle => ("idle_stat", "idle_stat", idle_rows),
        };
        let raw = dev.read_attr(attr)?;
        println!("{}", title.cyan().bold());
        println!("{}", Table::new(rows(&raw)));
        println!();
    }
    Ok(())
}

fn cmd_get(dev: &Device, key: &str) -> Result<()> {
    println!("{}", dev.read_attr(key)?);
    Ok(())
}

fn cmd_set(dev: &Device, assignment: &str) -> Result<()> {
    let (key, value) = assignment
        .split_once('=')
        .context("expected key=value")?;
    dev.write_attr(key, value)?;
    println!("{} {}={}", "set".green().bold(), key, value);
    Ok(())
}

fn cmd_writeback(dev: &Device, mode_str: &str) -> Result<()> {
    let outcome = dev.run_writeback(mode_str)?;
    println!("{}", "Writeback Outcome".cyan().bold());
    println!("  pages_written: {}", outcome.pages_written);
    println!(
        "  io_errors:     {}",
        if outcome.io_errors > 0 {
            outcome.io_errors.to_string().red().to_string()
        } else {
            outcome.io_errors.to_string()
        }
    );
    println!("  cancelled:     {}", outcome.cancelled);
    Ok(())
}

fn cmd_reset(dev: &Device) -> Result<()> {
    dev.write_attr("reset", "1")?;
    println!("{}", "device reset".green().bold());
    Ok(())
}

fn cmd_demo(dev: &Device, pages: usize) -> Result<()> {
    println!("{}", "Before".cyan().bold());
    println!("{}", Table::new(mm_rows(&dev.read_attr("mm_stat")?)));

    for i in 0..pages {
        let page = match i % 3 {
            0 => vec![0x00u8; cram_core::PAGE_SIZE],
            1 => vec![0x5Au8; cram_core::PAGE_SIZE],
            _ => (0..cram_core::PAGE_SIZE)
                .map(|b| ((b * 2654435761usize + i) % 256) as u8)
                .collect(),
        };
        dev.write((i * cram_core::PAGE_SIZE) as u64, &page)
            .with_context(|| format!("writing demo page {i}"))?;
    }

    println!();
    println!("{}", "After".cyan().bold());
    println!("{}", Table::new(mm_rows(&dev.read_attr("mm_stat")?)));
    Ok(())
}

/// Parse a byte count with an optional `K`/`M`/`G` suffix.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let value = if let Some(num) = s.strip_suffix('K') {
        num.parse::<u64>()? * 1024
    } else if let Some(num) = s.strip_suffix('M') {
        num.parse::<u64>()? * 1024 * 1024
    } else if let Some(num) = s.strip_suffix('G') {
        num.parse::<u64>()? * 1024 * 1024 * 1024
    } else {
        s.parse::<u64>()?
    };
    if value == 0 {
        bail!("disksize must be nonzero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("16K").unwrap(), 16 * 1024);
        assert_eq!(parse_size("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("16m").unwrap(), 16 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_zero_and_garbage() {
        assert!(parse_size("0").is_err());
        assert!(parse_size("not-a-size").is_err());
    }

    #[test]
    fn set_requires_equals() {
        let dev = Device::new();
        dev.write_attr("disksize", "4096").unwrap();
        assert!(cmd_set(&dev, "no-equals-sign").is_err());
    }

    #[test]
    fn demo_round_trips_through_device() {
        let dev = Device::new();
        dev.write_attr("disksize", &(8 * cram_core::PAGE_SIZE).to_string())
            .unwrap();
        cmd_demo(&dev, 6).unwrap();
        let raw = dev.read_attr("mm_stat").unwrap();
        let pages_stored: u64 = raw.split_whitespace().nth(3).unwrap().parse().unwrap();
        assert_eq!(pages_stored, 6);
    }

    #[test]
    fn writeback_command_evicts_idle_pages() {
        let dir = tempfile::tempdir().unwrap();
        let backing_path = dir.path().join("backing.img");

        let dev = Device::new();
        dev.write_attr("backing_dev", backing_path.to_str().unwrap())
            .unwrap();
        dev.write_attr("backing_page_count", "16").unwrap();
        dev.write_attr("low_ratio_threshold", "90").unwrap();
        dev.write_attr("disksize", &(4 * cram_core::PAGE_SIZE).to_string())
            .unwrap();

        let incompressible: Vec<u8> = (0..cram_core::PAGE_SIZE)
            .map(|i| ((i * 2654435761usize) % 256) as u8)
            .collect();
        dev.write(0, &incompressible).unwrap();
        dev.write_attr("idle", "all").unwrap();

        cmd_writeback(&dev, "idle").unwrap();
        let stat = dev.read_attr("bd_stat").unwrap();
        let count: u64 = stat.split_whitespace().next().unwrap().parse().unwrap();
        assert_eq!(count, 1);
    }
}
