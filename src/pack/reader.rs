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

//! Pack reader
//!
//! Opens and validates `.snpak` files under adversarial input assumptions:
//! no offset, size or count read from disk is trusted before it has been
//! checked against the validated file size and the hard sanity caps, and
//! every hashed region is verified before its contents are used.
//!
//! After `open` completes, chunk loads never touch shared state. Each load
//! opens its own file handle, so any number of threads can pull chunks from
//! one reader concurrently without a lock.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::compression::{decompress, Compression};
use crate::error::{Error, Result};
use crate::hashing::{hash128, hash64, Hash128Builder};
use crate::id::{AssetId, Uuid};
use crate::pack::format::{
    BulkEntry, ChunkHeader, ChunkKind, IndexEntry, IndexHeader, PackHeader, StrBlockHeader,
    CHUNK_MAGIC, ENDIAN_MARKER, INDEX_MAGIC, PACK_MAGIC, PACK_VERSION, STRING_MAGIC, VARIANT_NONE,
};
use crate::pack::{AssetInfo, BulkChunkInfo, BulkSemantic};
use crate::payload::TypedPayload;

// Hard caps protecting allocations against corrupted count fields.
const MAX_STRING_COUNT: u64 = 10_000_000;
const MAX_ENTRY_COUNT: u64 = 10_000_000;
const MAX_BULK_ENTRY_COUNT: u64 = 100_000_000;
const MAX_BLOCK_SIZE: u64 = 1_000_000_000;

/// What a chunk load is expected to be, for identity cross-checks against
/// the index.
enum ChunkExpectation<'a> {
    Main(&'a IndexEntry),
    Bulk {
        entry: &'a BulkEntry,
        asset_id: &'a [u8; 16],
    },
}

/// Validated, random-access view of one pack file.
#[derive(Debug)]
pub struct PackReader {
    path: PathBuf,
    header: PackHeader,
    strings: Vec<String>,
    entries: Vec<IndexEntry>,
    bulk_entries: Vec<BulkEntry>,
    id_to_index: FxHashMap<AssetId, u32>,
    name_hash_to_indices: FxHashMap<u64, SmallVec<[u32; 2]>>,
    validated_file_size: u64,
}

fn check_range(offset: u64, size: u64, file_size: u64) -> bool {
    size <= file_size && offset <= file_size - size
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8], file_size: u64) -> Result<()> {
    if !check_range(offset, buf.len() as u64, file_size) {
        return Err(Error::Bounds(format!(
            "read of {} bytes at offset {} exceeds file bounds ({})",
            buf.len(),
            offset,
            file_size
        )));
    }
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
        .map_err(|e| Error::Io(format!("short read at offset {offset}: {e}")))
}

impl PackReader {
    /// Open and fully validate a pack. On success the string table and
    /// index are resident in memory; chunk payloads stay on disk until
    /// loaded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.display())))?;

        let actual_size = file.metadata()?.len();
        if actual_size < PackHeader::SIZE as u64 {
            return Err(Error::Format("file too small to contain pack header".into()));
        }

        let mut header_buf = [0u8; PackHeader::SIZE];
        read_exact_at(&mut file, 0, &mut header_buf, actual_size)?;
        let header = PackHeader::decode(&header_buf);

        if header.magic != PACK_MAGIC {
            return Err(Error::Format("invalid pack file magic".into()));
        }
        if header.version != PACK_VERSION {
            return Err(Error::Format(format!(
                "unsupported pack version: {}",
                header.version
            )));
        }
        if header.header_size != PackHeader::SIZE as u32 {
            return Err(Error::Format(format!(
                "header size mismatch: expected {}, got {}",
                PackHeader::SIZE,
                header.header_size
            )));
        }
        if header.endian_marker != ENDIAN_MARKER {
            return Err(Error::Format(
                "endian mismatch: pack was created on a different architecture".into(),
            ));
        }
        if header.file_size > actual_size {
            return Err(Error::Format(format!(
                "header file size ({}) exceeds actual file size ({})",
                header.file_size, actual_size
            )));
        }
        // Everything after this point is bounded by the smaller of the two
        // sizes.
        let validated_file_size = header.file_size;

        let strings = Self::read_string_table(&mut file, &header, validated_file_size)?;
        let (entries, bulk_entries) = Self::read_index(&mut file, &header, validated_file_size)?;

        let mut id_to_index = FxHashMap::default();
        let mut name_hash_to_indices: FxHashMap<u64, SmallVec<[u32; 2]>> = FxHashMap::default();
        for (i, entry) in entries.iter().enumerate() {
            id_to_index.insert(Uuid(entry.asset_id), i as u32);
            name_hash_to_indices
                .entry(entry.name_hash64)
                .or_default()
                .push(i as u32);
        }

        Ok(PackReader {
            path,
            header,
            strings,
            entries,
            bulk_entries,
            id_to_index,
            name_hash_to_indices,
            validated_file_size,
        })
    }

    fn read_string_table(
        file: &mut File,
        header: &PackHeader,
        file_size: u64,
    ) -> Result<Vec<String>> {
        if !check_range(header.string_table_offset, header.string_table_size, file_size) {
            return Err(Error::Bounds("string table offset/size exceeds file bounds".into()));
        }
        if header.string_table_size < StrBlockHeader::SIZE as u64 {
            return Err(Error::Format("string table size too small for header".into()));
        }

        let mut str_header_buf = [0u8; StrBlockHeader::SIZE];
        read_exact_at(file, header.string_table_offset, &mut str_header_buf, file_size)?;
        let str_header = StrBlockHeader::decode(&str_header_buf);

        if str_header.magic != STRING_MAGIC {
            return Err(Error::Format("invalid string table magic".into()));
        }
        if str_header.version != 1 {
            return Err(Error::Format(format!(
                "unsupported string table version: {}",
                str_header.version
            )));
        }
        if str_header.block_size != header.string_table_size {
            return Err(Error::Format("string table block size mismatch with header".into()));
        }
        if u64::from(str_header.string_count) > MAX_STRING_COUNT {
            return Err(Error::SanityLimit(format!(
                "string count {} exceeds cap",
                str_header.string_count
            )));
        }
        if str_header.block_size > MAX_BLOCK_SIZE {
            return Err(Error::SanityLimit(format!(
                "string block size {} exceeds cap",
                str_header.block_size
            )));
        }

        let offsets_size = str_header.string_count as u64 * 4;
        let min_expected = StrBlockHeader::SIZE as u64 + offsets_size;
        if str_header.block_size < min_expected {
            return Err(Error::Format(
                "string table block size too small for offset array".into(),
            ));
        }
        if !check_range(header.string_table_offset, str_header.block_size, file_size) {
            return Err(Error::Bounds("string table block exceeds file bounds".into()));
        }

        let mut offsets_buf = vec![0u8; offsets_size as usize];
        let offsets_at = header.string_table_offset + StrBlockHeader::SIZE as u64;
        read_exact_at(file, offsets_at, &mut offsets_buf, file_size)?;
        let offsets: Vec<u32> = offsets_buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let string_data_size = str_header.block_size - min_expected;
        let mut string_data = vec![0u8; string_data_size as usize];
        read_exact_at(file, offsets_at + offsets_size, &mut string_data, file_size)?;

        if hash128(&string_data) != str_header.hash {
            return Err(Error::Integrity("string table hash mismatch".into()));
        }

        let mut strings = Vec::with_capacity(offsets.len());
        for (i, &offset) in offsets.iter().enumerate() {
            let offset = offset as usize;
            if offset >= string_data.len() {
                return Err(Error::Bounds(format!("string offset {i} out of bounds")));
            }
            let rest = &string_data[offset..];
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::Bounds(format!("string {i} missing NUL terminator")))?;
            let s = std::str::from_utf8(&rest[..nul])
                .map_err(|_| Error::Format(format!("string {i} is not valid UTF-8")))?;
            strings.push(s.to_string());
        }

        Ok(strings)
    }

    fn read_index(
        file: &mut File,
        header: &PackHeader,
        file_size: u64,
    ) -> Result<(Vec<IndexEntry>, Vec<BulkEntry>)> {
        if !check_range(header.index_offset, header.index_size, file_size) {
            return Err(Error::Bounds("index offset/size exceeds file bounds".into()));
        }
        if header.index_size < IndexHeader::SIZE as u64 {
            return Err(Error::Format("index size too small for header".into()));
        }

        let mut idx_header_buf = [0u8; IndexHeader::SIZE];
        read_exact_at(file, header.index_offset, &mut idx_header_buf, file_size)?;
        let idx_header = IndexHeader::decode(&idx_header_buf);

        if idx_header.magic != INDEX_MAGIC {
            return Err(Error::Format("invalid index magic".into()));
        }
        if idx_header.version != 1 {
            return Err(Error::Format(format!(
                "unsupported index version: {}",
                idx_header.version
            )));
        }
        if idx_header.block_size != header.index_size {
            return Err(Error::Format("index block size mismatch with header".into()));
        }
        if u64::from(idx_header.entry_count) > MAX_ENTRY_COUNT {
            return Err(Error::SanityLimit(format!(
                "entry count {} exceeds cap",
                idx_header.entry_count
            )));
        }
        if u64::from(idx_header.bulk_entry_count) > MAX_BULK_ENTRY_COUNT {
            return Err(Error::SanityLimit(format!(
                "bulk entry count {} exceeds cap",
                idx_header.bulk_entry_count
            )));
        }
        if idx_header.block_size > MAX_BLOCK_SIZE {
            return Err(Error::SanityLimit(format!(
                "index block size {} exceeds cap",
                idx_header.block_size
            )));
        }

        let entries_size = idx_header.entry_count as u64 * IndexEntry::SIZE as u64;
        let bulk_size = idx_header.bulk_entry_count as u64 * BulkEntry::SIZE as u64;
        let expected = IndexHeader::SIZE as u64 + entries_size + bulk_size;
        if idx_header.block_size != expected {
            return Err(Error::Format(
                "index block size does not match declared entry counts".into(),
            ));
        }
        if !check_range(header.index_offset, idx_header.block_size, file_size) {
            return Err(Error::Bounds("index block exceeds file bounds".into()));
        }

        let mut entries_buf = vec![0u8; entries_size as usize];
        let entries_at = header.index_offset + IndexHeader::SIZE as u64;
        read_exact_at(file, entries_at, &mut entries_buf, file_size)?;

        let mut bulk_buf = vec![0u8; bulk_size as usize];
        read_exact_at(file, entries_at + entries_size, &mut bulk_buf, file_size)?;

        // Entries hash covers the two arrays; the streaming hasher avoids
        // gluing them into one scratch buffer.
        let mut entries_hash = Hash128Builder::new();
        entries_hash.update(&entries_buf);
        entries_hash.update(&bulk_buf);
        if entries_hash.finish() != idx_header.entries_hash {
            return Err(Error::Integrity("index entries hash mismatch".into()));
        }

        // The pack header's hash covers the whole block, index header
        // included, so corruption of the index header itself is caught.
        // Hash the raw header bytes as read, not a re-encoding.
        let mut block_hash = Hash128Builder::new();
        block_hash.update(&idx_header_buf);
        block_hash.update(&entries_buf);
        block_hash.update(&bulk_buf);
        if block_hash.finish() != header.index_hash {
            return Err(Error::Integrity("index block hash mismatch with pack header".into()));
        }

        let entries = entries_buf
            .chunks_exact(IndexEntry::SIZE)
            .map(|c| IndexEntry::decode(c.try_into().unwrap()))
            .collect();
        let bulk_entries = bulk_buf
            .chunks_exact(BulkEntry::SIZE)
            .map(|c| BulkEntry::decode(c.try_into().unwrap()))
            .collect();

        Ok((entries, bulk_entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn asset_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// View of the asset at a dense index position.
    pub fn asset_info(&self, index: u32) -> Result<AssetInfo> {
        let entry = self
            .entries
            .get(index as usize)
            .ok_or_else(|| Error::Bounds(format!("asset index {index} out of range")))?;
        Ok(self.info_for_entry(entry))
    }

    fn info_for_entry(&self, entry: &IndexEntry) -> AssetInfo {
        let name = self
            .strings
            .get(entry.name_string_id as usize)
            .cloned()
            .unwrap_or_default();
        let variant_key = if entry.variant_string_id == VARIANT_NONE {
            String::new()
        } else {
            self.strings
                .get(entry.variant_string_id as usize)
                .cloned()
                .unwrap_or_default()
        };

        AssetInfo {
            id: Uuid(entry.asset_id),
            asset_kind: Uuid(entry.asset_kind),
            cooked_payload_type: Uuid(entry.cooked_payload_type),
            schema_version: entry.cooked_schema_version,
            name,
            variant_key,
            bulk_chunk_count: entry.bulk_count,
        }
    }

    fn entry_for(&self, id: AssetId) -> Result<&IndexEntry> {
        let index = self
            .id_to_index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("asset {id}")))?;
        Ok(&self.entries[*index as usize])
    }

    pub fn find_asset(&self, id: AssetId) -> Result<AssetInfo> {
        self.entry_for(id).map(|e| self.info_for_entry(e))
    }

    /// All assets sharing a logical name, across variants, in index order.
    pub fn find_assets_by_name(&self, name: &str) -> Vec<AssetInfo> {
        let Some(indices) = self.name_hash_to_indices.get(&hash64(name.as_bytes())) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|&i| self.info_for_entry(&self.entries[i as usize]))
            .filter(|info| info.name == name)
            .collect()
    }

    /// The canonical asset for a name: the variant-less entry when one
    /// exists, otherwise the first match.
    pub fn find_asset_by_name(&self, name: &str) -> Result<AssetInfo> {
        let matches = self.find_assets_by_name(name);
        matches
            .iter()
            .find(|info| info.variant_key.is_empty())
            .or_else(|| matches.first())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("asset {name:?}")))
    }

    /// Load and verify an asset's cooked payload.
    pub fn load_cooked_payload(&self, id: AssetId) -> Result<TypedPayload> {
        let entry = self.entry_for(id)?;
        let bytes = self.load_chunk(
            entry.payload_chunk_offset,
            entry.payload_chunk_size_compressed,
            entry.payload_chunk_size_uncompressed,
            ChunkExpectation::Main(entry),
        )?;

        Ok(TypedPayload {
            payload_type: Uuid(entry.cooked_payload_type),
            schema_version: entry.cooked_schema_version,
            bytes,
        })
    }

    fn bulk_entry_for(&self, id: AssetId, bulk_index: u32) -> Result<(&IndexEntry, &BulkEntry)> {
        let entry = self.entry_for(id)?;
        if !entry.has_bulk() || bulk_index >= entry.bulk_count {
            return Err(Error::Bounds(format!(
                "bulk chunk index {bulk_index} out of range for asset {id}"
            )));
        }

        let global = entry.bulk_first_index as usize + bulk_index as usize;
        let bulk = self
            .bulk_entries
            .get(global)
            .ok_or_else(|| Error::Bounds(format!("bulk entry index {global} out of range")))?;

        // A writer that emitted bulk entries out of order produced a
        // corrupt pack; refuse it rather than serve the wrong level.
        if bulk.sub_index != bulk_index {
            return Err(Error::Identity(format!(
                "bulk sub-index mismatch: expected {bulk_index}, got {}",
                bulk.sub_index
            )));
        }

        Ok((entry, bulk))
    }

    /// Load and verify one bulk chunk.
    pub fn load_bulk_chunk(&self, id: AssetId, bulk_index: u32) -> Result<Vec<u8>> {
        let (entry, bulk) = self.bulk_entry_for(id, bulk_index)?;
        self.load_chunk(
            bulk.chunk_offset,
            bulk.size_compressed,
            bulk.size_uncompressed,
            ChunkExpectation::Bulk {
                entry: bulk,
                asset_id: &entry.asset_id,
            },
        )
    }

    /// Bulk chunk metadata without loading the chunk.
    pub fn bulk_chunk_info(&self, id: AssetId, bulk_index: u32) -> Result<BulkChunkInfo> {
        let (_, bulk) = self.bulk_entry_for(id, bulk_index)?;
        Ok(BulkChunkInfo {
            semantic: BulkSemantic::from_u32(bulk.semantic),
            sub_index: bulk.sub_index,
            uncompressed_size: bulk.size_uncompressed,
        })
    }

    fn load_chunk(
        &self,
        offset: u64,
        expected_total_size: u64,
        expected_uncompressed_size: u64,
        expectation: ChunkExpectation<'_>,
    ) -> Result<Vec<u8>> {
        // A dedicated handle per load: concurrent chunk loads never contend
        // on a shared file position.
        let mut file = File::open(&self.path)
            .map_err(|e| Error::Io(format!("failed to reopen {}: {e}", self.path.display())))?;

        if !check_range(offset, expected_total_size, self.validated_file_size) {
            return Err(Error::Bounds("chunk offset/size exceeds file bounds".into()));
        }
        if expected_total_size < ChunkHeader::SIZE as u64 {
            return Err(Error::Format("chunk total size too small for header".into()));
        }

        let mut header_buf = [0u8; ChunkHeader::SIZE];
        read_exact_at(&mut file, offset, &mut header_buf, self.validated_file_size)?;
        let chunk = ChunkHeader::decode(&header_buf);

        if chunk.magic != CHUNK_MAGIC {
            return Err(Error::Format("invalid chunk magic".into()));
        }
        if chunk.version != PACK_VERSION {
            return Err(Error::Format(format!(
                "unsupported chunk version: {}",
                chunk.version
            )));
        }
        if chunk.size_uncompressed != expected_uncompressed_size {
            return Err(Error::Identity(
                "chunk uncompressed size mismatch with index".into(),
            ));
        }
        if chunk.size_compressed != expected_total_size - ChunkHeader::SIZE as u64 {
            return Err(Error::Identity(
                "chunk compressed size mismatch with index".into(),
            ));
        }
        if chunk.size_compressed > MAX_BLOCK_SIZE || chunk.size_uncompressed > MAX_BLOCK_SIZE {
            return Err(Error::SanityLimit("chunk size exceeds cap".into()));
        }

        match expectation {
            ChunkExpectation::Main(entry) => {
                if chunk.chunk_kind != ChunkKind::MainPayload as u8 {
                    return Err(Error::Identity("chunk kind mismatch: expected main payload".into()));
                }
                if chunk.asset_id != entry.asset_id {
                    return Err(Error::Identity("chunk asset id mismatch with index entry".into()));
                }
                if chunk.payload_type != entry.cooked_payload_type {
                    return Err(Error::Identity(
                        "chunk payload type mismatch with index entry".into(),
                    ));
                }
                if chunk.schema_version != entry.cooked_schema_version {
                    return Err(Error::Identity(
                        "chunk schema version mismatch with index entry".into(),
                    ));
                }
                if chunk.compression != entry.compression {
                    return Err(Error::Identity(
                        "chunk compression mismatch with index entry".into(),
                    ));
                }
            }
            ChunkExpectation::Bulk { entry, asset_id } => {
                if chunk.chunk_kind != ChunkKind::Bulk as u8 {
                    return Err(Error::Identity("chunk kind mismatch: expected bulk".into()));
                }
                if chunk.compression != entry.compression {
                    return Err(Error::Identity(
                        "bulk chunk compression mismatch with bulk entry".into(),
                    ));
                }
                if &chunk.asset_id != asset_id {
                    return Err(Error::Identity(
                        "bulk chunk belongs to a different asset".into(),
                    ));
                }
            }
        }

        let mode = Compression::from_u8(chunk.compression)
            .ok_or_else(|| Error::Format(format!("unknown compression mode {}", chunk.compression)))?;

        let data_at = offset + ChunkHeader::SIZE as u64;
        let output = if mode == Compression::None {
            if chunk.size_compressed != chunk.size_uncompressed {
                return Err(Error::Identity("uncompressed chunk has mismatched sizes".into()));
            }
            // Read straight into the output buffer, skipping the scratch
            // copy a compressed chunk needs.
            let mut out = vec![0u8; chunk.size_uncompressed as usize];
            if !out.is_empty() {
                read_exact_at(&mut file, data_at, &mut out, self.validated_file_size)?;
            }
            out
        } else {
            let mut compressed = vec![0u8; chunk.size_compressed as usize];
            if !compressed.is_empty() {
                read_exact_at(&mut file, data_at, &mut compressed, self.validated_file_size)?;
            }
            decompress(&compressed, chunk.size_uncompressed as usize, mode)?
        };

        if hash128(&output) != chunk.hash {
            return Err(Error::Integrity("chunk hash mismatch".into()));
        }

        Ok(output)
    }

    // Internal views used by the writer's append-update merge.

    pub(crate) fn header(&self) -> &PackHeader {
        &self.header
    }

    pub(crate) fn raw_entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub(crate) fn raw_bulk_entries(&self) -> &[BulkEntry] {
        &self.bulk_entries
    }

    pub(crate) fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(|s| s.as_str())
    }
}
