// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SNPAK v1 on-disk layout
//!
//! All integers are little-endian and all structs are byte-packed; the
//! `SIZE` constants are part of the format contract. A fresh pack is laid
//! out as `[header][string block][(chunk header + payload)...][index
//! block]`. An append-update appends a new string block, new chunks and a
//! new index, then rewrites the header in place to point at the new index;
//! earlier indices stay in the file and are reachable through
//! `previous_index_offset`.
//!
//! Three XXH3-128 hashes guard the metadata: the string block header hashes
//! the string bytes, the index header hashes the entry arrays, and the pack
//! header hashes the whole index block including the index header. Each
//! chunk additionally carries a hash of its decompressed payload.

use crate::hashing::Hash128;

/// File magic, 8 bytes: `"SNPAK\0\0\0"`.
pub const PACK_MAGIC: [u8; 8] = *b"SNPAK\0\0\0";
/// Chunk header magic.
pub const CHUNK_MAGIC: [u8; 4] = *b"CHNK";
/// Index block magic.
pub const INDEX_MAGIC: [u8; 4] = *b"INDX";
/// String block magic.
pub const STRING_MAGIC: [u8; 4] = *b"STRS";

/// Current file format version.
pub const PACK_VERSION: u32 = 1;

/// Written natively by the host; a reader seeing any other value holds a
/// pack produced on a foreign-endian machine and must refuse it.
pub const ENDIAN_MARKER: u32 = 0x0102_0304;

/// Sentinel string id meaning "no variant key".
pub const VARIANT_NONE: u32 = 0xFFFF_FFFF;

/// Pack header flag: the index at `index_offset` was produced by an
/// append-update and chains to a previous index.
pub const FLAG_HAS_TRAILING_INDEX: u32 = 1 << 0;
/// Pack header flag: reserved for a future type table block.
pub const FLAG_HAS_TYPE_TABLE: u32 = 1 << 1;

/// Index entry flag: the asset owns one or more bulk chunks.
pub const ENTRY_FLAG_HAS_BULK: u8 = 1 << 0;

/// Discriminates the two chunk kinds in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    MainPayload = 0,
    Bulk = 1,
}

impl ChunkKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChunkKind::MainPayload),
            1 => Some(ChunkKind::Bulk),
            _ => None,
        }
    }
}

// Cursor helpers for the fixed-layout structs. Callers guarantee the slice
// is at least SIZE bytes; the get/put pairs below keep offsets in one place
// per struct so a field can't silently shift.

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes())
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Pack file header, written at offset 0 and rewritten in place once the
/// final offsets are known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub header_size: u32,
    pub endian_marker: u32,
    pub file_size: u64,
    pub index_offset: u64,
    pub index_size: u64,
    pub string_table_offset: u64,
    pub string_table_size: u64,
    /// Zero while no type table exists.
    pub type_table_offset: u64,
    pub type_table_size: u64,
    /// XXH3-128 of the entire index block, index header included.
    pub index_hash: Hash128,
    pub flags: u32,
    pub previous_index_offset: u64,
    pub previous_index_size: u64,
}

impl PackHeader {
    pub const SIZE: usize = 180;

    pub fn new() -> Self {
        PackHeader {
            magic: PACK_MAGIC,
            version: PACK_VERSION,
            header_size: Self::SIZE as u32,
            endian_marker: ENDIAN_MARKER,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.magic);
        w.u32(self.version);
        w.u32(self.header_size);
        w.u32(self.endian_marker);
        w.u64(self.file_size);
        w.u64(self.index_offset);
        w.u64(self.index_size);
        w.u64(self.string_table_offset);
        w.u64(self.string_table_size);
        w.u64(self.type_table_offset);
        w.u64(self.type_table_size);
        w.u64(self.index_hash.hi);
        w.u64(self.index_hash.lo);
        w.u32(self.flags);
        w.u32(0); // reserved0
        w.u64(self.previous_index_offset);
        w.u64(self.previous_index_size);
        w.skip(64); // reserved
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let header = PackHeader {
            magic: r.bytes(),
            version: r.u32(),
            header_size: r.u32(),
            endian_marker: r.u32(),
            file_size: r.u64(),
            index_offset: r.u64(),
            index_size: r.u64(),
            string_table_offset: r.u64(),
            string_table_size: r.u64(),
            type_table_offset: r.u64(),
            type_table_size: r.u64(),
            index_hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
            flags: {
                let flags = r.u32();
                r.skip(4); // reserved0
                flags
            },
            previous_index_offset: r.u64(),
            previous_index_size: r.u64(),
        };
        r.skip(64);
        debug_assert_eq!(r.pos, Self::SIZE);
        header
    }
}

/// Header of a string block: an offset array followed by NUL-terminated
/// UTF-8 string bytes. The hash covers the string bytes only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StrBlockHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Total block size, this header included.
    pub block_size: u64,
    pub string_count: u32,
    pub hash: Hash128,
}

impl StrBlockHeader {
    pub const SIZE: usize = 40;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.magic);
        w.u32(self.version);
        w.u64(self.block_size);
        w.u32(self.string_count);
        w.u32(0); // reserved0
        w.u64(self.hash.hi);
        w.u64(self.hash.lo);
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let header = StrBlockHeader {
            magic: r.bytes(),
            version: r.u32(),
            block_size: r.u64(),
            string_count: {
                let count = r.u32();
                r.skip(4); // reserved0
                count
            },
            hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
        };
        debug_assert_eq!(r.pos, Self::SIZE);
        header
    }
}

/// Header of an index block. `entries_hash` covers the entry array followed
/// by the bulk entry array, this header excluded; the pack header's
/// `index_hash` covers the whole block so corruption of this header itself
/// is detectable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Header plus both arrays.
    pub block_size: u64,
    pub entry_count: u32,
    pub bulk_entry_count: u32,
    pub entries_hash: Hash128,
    pub previous_index_offset: u64,
    pub previous_index_size: u64,
}

impl IndexHeader {
    pub const SIZE: usize = 88;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.magic);
        w.u32(self.version);
        w.u64(self.block_size);
        w.u32(self.entry_count);
        w.u32(self.bulk_entry_count);
        w.u64(self.entries_hash.hi);
        w.u64(self.entries_hash.lo);
        w.u64(self.previous_index_offset);
        w.u64(self.previous_index_size);
        w.skip(32); // reserved
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let header = IndexHeader {
            magic: r.bytes(),
            version: r.u32(),
            block_size: r.u64(),
            entry_count: r.u32(),
            bulk_entry_count: r.u32(),
            entries_hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
            previous_index_offset: r.u64(),
            previous_index_size: r.u64(),
        };
        r.skip(32);
        debug_assert_eq!(r.pos, Self::SIZE);
        header
    }
}

/// One asset in the index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub asset_id: [u8; 16],
    pub asset_kind: [u8; 16],
    pub cooked_payload_type: [u8; 16],
    pub cooked_schema_version: u32,
    pub name_string_id: u32,
    pub name_hash64: u64,
    /// [`VARIANT_NONE`] when the asset has no variant key.
    pub variant_string_id: u32,
    pub variant_hash64: u64,
    pub payload_chunk_offset: u64,
    /// Chunk header plus compressed payload bytes.
    pub payload_chunk_size_compressed: u64,
    pub payload_chunk_size_uncompressed: u64,
    pub compression: u8,
    pub flags: u8,
    /// Low byte stores the compression level the payload was written with.
    pub reserved0: u16,
    pub bulk_first_index: u32,
    pub bulk_count: u32,
    pub payload_hash: Hash128,
}

impl IndexEntry {
    pub const SIZE: usize = 128;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.asset_id);
        w.bytes(&self.asset_kind);
        w.bytes(&self.cooked_payload_type);
        w.u32(self.cooked_schema_version);
        w.u32(self.name_string_id);
        w.u64(self.name_hash64);
        w.u32(self.variant_string_id);
        w.u64(self.variant_hash64);
        w.u64(self.payload_chunk_offset);
        w.u64(self.payload_chunk_size_compressed);
        w.u64(self.payload_chunk_size_uncompressed);
        w.u8(self.compression);
        w.u8(self.flags);
        w.u16(self.reserved0);
        w.u32(self.bulk_first_index);
        w.u32(self.bulk_count);
        w.u64(self.payload_hash.hi);
        w.u64(self.payload_hash.lo);
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let entry = IndexEntry {
            asset_id: r.bytes(),
            asset_kind: r.bytes(),
            cooked_payload_type: r.bytes(),
            cooked_schema_version: r.u32(),
            name_string_id: r.u32(),
            name_hash64: r.u64(),
            variant_string_id: r.u32(),
            variant_hash64: r.u64(),
            payload_chunk_offset: r.u64(),
            payload_chunk_size_compressed: r.u64(),
            payload_chunk_size_uncompressed: r.u64(),
            compression: r.u8(),
            flags: r.u8(),
            reserved0: r.u16(),
            bulk_first_index: r.u32(),
            bulk_count: r.u32(),
            payload_hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
        };
        debug_assert_eq!(r.pos, Self::SIZE);
        entry
    }

    pub fn has_bulk(&self) -> bool {
        self.flags & ENTRY_FLAG_HAS_BULK != 0
    }
}

/// One bulk chunk in the index. Bulk entries for an asset are stored
/// contiguously; `sub_index` must equal the chunk's position within its
/// asset's bulk list, and the reader rejects any mismatch as corruption.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BulkEntry {
    /// Semantic tag stored as a u32.
    pub semantic: u32,
    pub sub_index: u32,
    pub chunk_offset: u64,
    /// Chunk header plus compressed bytes.
    pub size_compressed: u64,
    pub size_uncompressed: u64,
    pub compression: u8,
    /// Compression level the chunk was written with.
    pub level: u8,
    pub hash: Hash128,
}

impl BulkEntry {
    pub const SIZE: usize = 56;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.u32(self.semantic);
        w.u32(self.sub_index);
        w.u64(self.chunk_offset);
        w.u64(self.size_compressed);
        w.u64(self.size_uncompressed);
        w.u8(self.compression);
        w.u8(self.level);
        w.skip(6); // rest of reserved0
        w.u64(self.hash.hi);
        w.u64(self.hash.lo);
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let entry = BulkEntry {
            semantic: r.u32(),
            sub_index: r.u32(),
            chunk_offset: r.u64(),
            size_compressed: r.u64(),
            size_uncompressed: r.u64(),
            compression: r.u8(),
            level: {
                let level = r.u8();
                r.skip(6);
                level
            },
            hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
        };
        debug_assert_eq!(r.pos, Self::SIZE);
        entry
    }
}

/// Header preceding every chunk payload in the file. Carries enough
/// identity for the reader to cross-check it against the index entry that
/// pointed here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub asset_id: [u8; 16],
    /// Cooked payload type; bulk chunks carry the owning asset's payload
    /// type for diagnostic correlation.
    pub payload_type: [u8; 16],
    /// Zero for bulk chunks.
    pub schema_version: u32,
    pub compression: u8,
    pub chunk_kind: u8,
    /// Low byte stores the compression level.
    pub reserved0: u16,
    pub size_compressed: u64,
    pub size_uncompressed: u64,
    /// XXH3-128 of the decompressed payload.
    pub hash: Hash128,
}

impl ChunkHeader {
    pub const SIZE: usize = 80;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.magic);
        w.u32(self.version);
        w.bytes(&self.asset_id);
        w.bytes(&self.payload_type);
        w.u32(self.schema_version);
        w.u8(self.compression);
        w.u8(self.chunk_kind);
        w.u16(self.reserved0);
        w.u64(self.size_compressed);
        w.u64(self.size_uncompressed);
        w.u64(self.hash.hi);
        w.u64(self.hash.lo);
        debug_assert_eq!(w.pos, Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let header = ChunkHeader {
            magic: r.bytes(),
            version: r.u32(),
            asset_id: r.bytes(),
            payload_type: r.bytes(),
            schema_version: r.u32(),
            compression: r.u8(),
            chunk_kind: r.u8(),
            reserved0: r.u16(),
            size_compressed: r.u64(),
            size_uncompressed: r.u64(),
            hash: Hash128 {
                hi: r.u64(),
                lo: r.u64(),
            },
        };
        debug_assert_eq!(r.pos, Self::SIZE);
        header
    }
}
