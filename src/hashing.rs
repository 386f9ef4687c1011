//! XXH3 hashing
//!
//! All content hashes in the pack format are XXH3: 64-bit for name lookups
//! and file-change detection, 128-bit for integrity checks. The streaming
//! hasher lets the reader verify large index blocks without concatenating
//! them into a scratch buffer first.

use twox_hash::{XxHash3_128, XxHash3_64};

/// A 128-bit hash split into the high and low halves stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash128 {
    pub hi: u64,
    pub lo: u64,
}

impl Hash128 {
    fn from_u128(v: u128) -> Self {
        Hash128 {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }
}

/// One-shot XXH3-64.
pub fn hash64(data: &[u8]) -> u64 {
    XxHash3_64::oneshot(data)
}

/// One-shot XXH3-128.
pub fn hash128(data: &[u8]) -> Hash128 {
    Hash128::from_u128(XxHash3_128::oneshot(data))
}

/// Streaming XXH3-128 for hashing disjoint regions as one logical stream.
pub struct Hash128Builder {
    state: XxHash3_128,
}

impl Hash128Builder {
    pub fn new() -> Self {
        Hash128Builder {
            state: XxHash3_128::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.write(data);
    }

    pub fn finish(self) -> Hash128 {
        Hash128::from_u128(self.state.finish_128())
    }
}

impl Default for Hash128Builder {
    fn default() -> Self {
        Self::new()
    }
}
