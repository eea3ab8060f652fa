// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Compression backend abstraction.
//!
//! The engine treats compression as an external collaborator so it
//! can be swapped or mocked in tests; [`DeflateCodec`] is the default,
//! built on the `flate2` crate this workspace already depends on.

use crate::error::{Error, Result};

/// Stateless compress/decompress pair. Implementations must be safe
/// to share across threads; per-call state (e.g. a compressor
/// workspace) lives inside the call, not on `self`.
pub trait Codec: Send + Sync {
    /// Compress `src` (exactly one page) into a caller-owned buffer.
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `src` into `dst`, which is exactly `dst.len()` bytes
    /// (the original uncompressed size). Returns an error if the
    /// stream is malformed or doesn't expand to fill `dst`.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// DEFLATE-based codec via `flate2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        use std::io::Write;
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder
            .write_all(src)
            .map_err(|e| Error::Codec(e.to_string()))?;
        encoder.finish().map_err(|e| Error::Codec(e.to_string()))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        use std::io::Read;
        let mut decoder = flate2::read::DeflateDecoder::new(src);
        decoder
            .read_exact(dst)
            .map_err(|e| Error::Codec(e.to_string()))
    }
}
