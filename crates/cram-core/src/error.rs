// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.

use std::fmt;
use std::io;

/// Errors produced by the compressed RAM block device engine.
#[derive(Debug)]
pub enum Error {
    /// I/O request fell outside the device bounds or was not
    /// sector-aligned.
    InvalidIo { sector: u64, len: usize },

    /// An attribute name or value did not parse.
    InvalidAttr(String),

    /// The device has not been configured (no `disksize` set yet).
    NotConfigured,

    /// `disksize` was written on an already-configured device.
    AlreadyConfigured,

    /// `reset` was requested while the device still has openers.
    DeviceBusy,

    /// The backing device has not been configured.
    NoBackingDevice,

    /// The compact allocator could not satisfy an allocation, even
    /// after a blocking retry.
    OutOfMemory,

    /// `mem_limit` would be exceeded by this allocation.
    LimitExceeded,

    /// Compression or decompression failed.
    Codec(String),

    /// A read/write against the backing device failed.
    BackingIo(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIo { sector, len } => {
                write!(f, "invalid I/O at sector {sector} len {len}")
            }
            Self::InvalidAttr(s) => write!(f, "invalid attribute: {s}"),
            Self::NotConfigured => write!(f, "device is not configured"),
            Self::AlreadyConfigured => write!(f, "device is already configured"),
            Self::DeviceBusy => write!(f, "device is busy, refusing reset"),
            Self::NoBackingDevice => write!(f, "no backing device configured"),
            Self::OutOfMemory => write!(f, "pool allocation failed"),
            Self::LimitExceeded => write!(f, "mem_limit exceeded"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::BackingIo(e) => write!(f, "backing device I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BackingIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::BackingIo(e)
    }
}

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
