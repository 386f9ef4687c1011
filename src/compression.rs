//! Chunk compression
//!
//! Uniform compress/decompress facade over the codecs a pack may use. Zstd
//! contexts are reused per thread; creating one per call measurably hurts
//! batch builds with many small cooked payloads.

use std::cell::RefCell;

use crate::error::{Error, Result};

/// Compression mode for pack chunks. The `u8` values are the on-disk
/// encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    #[default]
    Zstd = 2,
    Lz4Hc = 3,
    ZstdFast = 4,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Zstd),
            3 => Some(Compression::Lz4Hc),
            4 => Some(Compression::ZstdFast),
            _ => None,
        }
    }
}

/// Effort level within a compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionLevel {
    #[default]
    Default = 0,
    Fast = 1,
    High = 2,
    Max = 3,
}

impl CompressionLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionLevel::Default),
            1 => Some(CompressionLevel::Fast),
            2 => Some(CompressionLevel::High),
            3 => Some(CompressionLevel::Max),
            _ => None,
        }
    }
}

// LZ4-HC level range as defined by liblz4.
const LZ4HC_LEVEL_MIN: i32 = 3;
const LZ4HC_LEVEL_DEFAULT: i32 = 9;
const LZ4HC_LEVEL_MAX: i32 = 12;

const ZSTD_LEVEL_DEFAULT: i32 = 3;

fn lz4_mode(mode: Compression, level: CompressionLevel) -> lz4::block::CompressionMode {
    use lz4::block::CompressionMode;
    match mode {
        Compression::Lz4 => match level {
            CompressionLevel::Fast => CompressionMode::FAST(8),
            _ => CompressionMode::FAST(1),
        },
        Compression::Lz4Hc => match level {
            CompressionLevel::Fast => CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL_MIN),
            CompressionLevel::Default => CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL_DEFAULT),
            CompressionLevel::High => {
                CompressionMode::HIGHCOMPRESSION((LZ4HC_LEVEL_DEFAULT + 2).min(LZ4HC_LEVEL_MAX))
            }
            CompressionLevel::Max => CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL_MAX),
        },
        _ => unreachable!("not an lz4 mode"),
    }
}

fn zstd_level(mode: Compression, level: CompressionLevel) -> i32 {
    let max = *zstd::compression_level_range().end();
    match mode {
        Compression::Zstd => match level {
            CompressionLevel::Fast => 1,
            CompressionLevel::Default => ZSTD_LEVEL_DEFAULT,
            CompressionLevel::High => (ZSTD_LEVEL_DEFAULT + 5).min(max),
            CompressionLevel::Max => max,
        },
        Compression::ZstdFast => match level {
            CompressionLevel::Fast => -5,
            CompressionLevel::Default => -3,
            CompressionLevel::High => -2,
            CompressionLevel::Max => -1,
        },
        _ => unreachable!("not a zstd mode"),
    }
}

thread_local! {
    // Context cached alongside the level it was created with; rebuilt only
    // when a call asks for a different level.
    static ZSTD_COMPRESSOR: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
        const { RefCell::new(None) };
    static ZSTD_DECOMPRESSOR: RefCell<Option<zstd::bulk::Decompressor<'static>>> =
        const { RefCell::new(None) };
}

fn zstd_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    ZSTD_COMPRESSOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let needs_new = !matches!(&*slot, Some((l, _)) if *l == level);
        if needs_new {
            let ctx = zstd::bulk::Compressor::new(level)
                .map_err(|e| Error::Codec(format!("zstd compressor init failed: {e}")))?;
            *slot = Some((level, ctx));
        }
        let (_, ctx) = slot.as_mut().unwrap();
        ctx.compress(data)
            .map_err(|e| Error::Codec(format!("zstd compression failed: {e}")))
    })
}

fn zstd_decompress(data: &[u8], capacity: usize) -> Result<Vec<u8>> {
    ZSTD_DECOMPRESSOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let ctx = zstd::bulk::Decompressor::new()
                .map_err(|e| Error::Codec(format!("zstd decompressor init failed: {e}")))?;
            *slot = Some(ctx);
        }
        let ctx = slot.as_mut().unwrap();
        ctx.decompress(data, capacity)
            .map_err(|e| Error::Codec(format!("zstd decompression failed: {e}")))
    })
}

/// Compress `data` with the given mode and level.
///
/// `None` mode and empty inputs pass through unchanged.
pub fn compress(data: &[u8], mode: Compression, level: CompressionLevel) -> Result<Vec<u8>> {
    if mode == Compression::None || data.is_empty() {
        return Ok(data.to_vec());
    }

    match mode {
        Compression::Lz4 | Compression::Lz4Hc => {
            lz4::block::compress(data, Some(lz4_mode(mode, level)), false)
                .map_err(|e| Error::Codec(format!("lz4 compression failed: {e}")))
        }
        Compression::Zstd | Compression::ZstdFast => zstd_compress(data, zstd_level(mode, level)),
        Compression::None => unreachable!(),
    }
}

/// Decompress `data` into exactly `uncompressed_size` bytes.
///
/// A decompressed length that differs from `uncompressed_size` is an error:
/// the caller got the size from a validated index entry, so a mismatch means
/// the chunk body does not belong to that entry.
pub fn decompress(data: &[u8], uncompressed_size: usize, mode: Compression) -> Result<Vec<u8>> {
    if mode == Compression::None || data.is_empty() {
        if data.len() != uncompressed_size {
            return Err(Error::Codec(format!(
                "stored chunk is {} bytes but index expects {}",
                data.len(),
                uncompressed_size
            )));
        }
        return Ok(data.to_vec());
    }

    let out = match mode {
        Compression::Lz4 | Compression::Lz4Hc => {
            lz4::block::decompress(data, Some(uncompressed_size as i32))
                .map_err(|e| Error::Codec(format!("lz4 decompression failed: {e}")))?
        }
        Compression::Zstd | Compression::ZstdFast => zstd_decompress(data, uncompressed_size)?,
        Compression::None => unreachable!(),
    };

    if out.len() != uncompressed_size {
        return Err(Error::Codec(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            uncompressed_size
        )));
    }

    Ok(out)
}
