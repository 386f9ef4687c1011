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

//! Pack writer
//!
//! Queues assets in memory and serializes them into a `.snpak` file. Fresh
//! writes go to a temporary sibling file and land with an atomic rename so
//! no partial pack is ever visible at the destination. Append-updates add a
//! new tranche (string block, chunks, index) to the end of an existing pack
//! and rewrite its header in place; index entries for assets that were not
//! superseded are carried into the new index so the latest index always
//! describes the complete pack, while their chunk bytes stay where they
//! were.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::compression::{compress, Compression, CompressionLevel};
use crate::error::{Error, Result};
use crate::hashing::{hash128, hash64};
use crate::pack::format::{
    BulkEntry, ChunkHeader, ChunkKind, IndexEntry, IndexHeader, PackHeader, StrBlockHeader,
    CHUNK_MAGIC, ENTRY_FLAG_HAS_BULK, FLAG_HAS_TRAILING_INDEX, INDEX_MAGIC, PACK_MAGIC,
    PACK_VERSION, STRING_MAGIC, VARIANT_NONE,
};
use crate::pack::reader::PackReader;
use crate::pack::AssetPackEntry;

/// Dense string interner for one write tranche. Interning is two-phase:
/// every string is collected before the block is serialized, after which
/// the table freezes and a lookup for an unknown string is a bug.
struct StringTable {
    strings: Vec<String>,
    ids: FxHashMap<String, u32>,
    frozen: bool,
}

impl StringTable {
    fn new() -> Self {
        StringTable {
            strings: Vec::new(),
            ids: FxHashMap::default(),
            frozen: false,
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        if self.frozen {
            panic!("string table frozen: attempted to add new string {s:?}");
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    fn id(&self, s: &str) -> u32 {
        *self
            .ids
            .get(s)
            .unwrap_or_else(|| panic!("string not found in frozen table: {s:?}"))
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Serialize the block: header, u32 offset array, NUL-terminated
    /// string bytes. The header's hash covers the string bytes only.
    fn serialize(&self) -> Vec<u8> {
        let mut offsets = Vec::with_capacity(self.strings.len());
        let mut string_data = Vec::new();
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            string_data.extend_from_slice(s.as_bytes());
            string_data.push(0);
        }

        let header = StrBlockHeader {
            magic: STRING_MAGIC,
            version: 1,
            block_size: (StrBlockHeader::SIZE + offsets.len() * 4 + string_data.len()) as u64,
            string_count: self.strings.len() as u32,
            hash: hash128(&string_data),
        };

        let mut block = Vec::with_capacity(header.block_size as usize);
        block.extend_from_slice(&header.encode());
        for offset in &offsets {
            block.extend_from_slice(&offset.to_le_bytes());
        }
        block.extend_from_slice(&string_data);
        block
    }
}

/// An index entry carried forward from a previous tranche during an
/// append-update. Chunk locations are reused verbatim; only string ids and
/// the bulk array base need remapping into the new tranche.
struct CarriedEntry {
    entry: IndexEntry,
    name: String,
    variant: String,
    bulk: Vec<BulkEntry>,
}

fn build_index_block(
    entries: &[IndexEntry],
    bulk_entries: &[BulkEntry],
    previous_offset: u64,
    previous_size: u64,
) -> Vec<u8> {
    let entries_size = entries.len() * IndexEntry::SIZE;
    let bulk_size = bulk_entries.len() * BulkEntry::SIZE;

    let mut arrays = Vec::with_capacity(entries_size + bulk_size);
    for entry in entries {
        arrays.extend_from_slice(&entry.encode());
    }
    for bulk in bulk_entries {
        arrays.extend_from_slice(&bulk.encode());
    }

    let header = IndexHeader {
        magic: INDEX_MAGIC,
        version: 1,
        block_size: (IndexHeader::SIZE + entries_size + bulk_size) as u64,
        entry_count: entries.len() as u32,
        bulk_entry_count: bulk_entries.len() as u32,
        entries_hash: hash128(&arrays),
        previous_index_offset: previous_offset,
        previous_index_size: previous_size,
    };

    let mut block = Vec::with_capacity(header.block_size as usize);
    block.extend_from_slice(&header.encode());
    block.extend_from_slice(&arrays);
    block
}

/// Assembles assets into SNPAK files.
#[derive(Default)]
pub struct PackWriter {
    assets: Vec<AssetPackEntry>,
    compression: Compression,
    level: CompressionLevel,
}

impl PackWriter {
    pub fn new() -> Self {
        PackWriter::default()
    }

    /// Pack-wide compression mode for payloads and compressible bulk
    /// chunks. Defaults to Zstd.
    pub fn set_compression(&mut self, mode: Compression) {
        self.compression = mode;
    }

    pub fn set_compression_level(&mut self, level: CompressionLevel) {
        self.level = level;
    }

    pub fn set_max_compression(&mut self, enable: bool) {
        self.level = if enable {
            CompressionLevel::Max
        } else {
            CompressionLevel::Default
        };
    }

    /// Queue an asset for the next `write` or `append_update`.
    pub fn add_asset(&mut self, entry: AssetPackEntry) {
        self.assets.push(entry);
    }

    pub fn clear(&mut self) {
        self.assets.clear();
    }

    pub fn pending_asset_count(&self) -> u32 {
        self.assets.len() as u32
    }

    /// Write a fresh pack. The file is assembled at `path + ".tmp"` and
    /// atomically renamed over the destination.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tmp_path = PathBuf::from(path.as_os_str().to_os_string());
        tmp_path.as_mut_os_string().push(".tmp");

        let mut file = File::create(&tmp_path)
            .map_err(|e| Error::Io(format!("failed to create {}: {e}", tmp_path.display())))?;

        let mut header = PackHeader::new();
        file.write_all(&header.encode())?;

        let tranche = self.write_tranche(&mut file, PackHeader::SIZE as u64, &[], 0, 0)?;

        header.file_size = tranche.end_offset;
        header.string_table_offset = tranche.string_table_offset;
        header.string_table_size = tranche.string_table_size;
        header.index_offset = tranche.index_offset;
        header.index_size = tranche.index_size;
        header.index_hash = tranche.index_hash;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        drop(file);

        std::fs::rename(&tmp_path, path).map_err(|e| {
            Error::Io(format!(
                "failed to rename {} over {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;

        debug!(
            path = %path.display(),
            assets = self.assets.len(),
            bytes = header.file_size,
            "wrote pack"
        );
        Ok(())
    }

    /// Append queued assets to an existing pack, preserving its history.
    /// Assets already present under the same id are superseded by the
    /// queued version; everything else is carried into the new index
    /// unchanged. Falls back to `write` when the pack does not exist.
    pub fn append_update(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return self.write(path);
        }

        // Full validation of the existing pack; also the source of the
        // carried-forward entries.
        let existing = PackReader::open(path)?;
        let old_header = existing.header().clone();

        let carried = self.collect_carried(&existing)?;
        drop(existing);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.display())))?;
        let append_at = file.seek(SeekFrom::End(0))?;

        let tranche = self.write_tranche(
            &mut file,
            append_at,
            &carried,
            old_header.index_offset,
            old_header.index_size,
        )?;

        let mut header = old_header.clone();
        header.file_size = tranche.end_offset;
        header.string_table_offset = tranche.string_table_offset;
        header.string_table_size = tranche.string_table_size;
        header.index_offset = tranche.index_offset;
        header.index_size = tranche.index_size;
        header.index_hash = tranche.index_hash;
        header.previous_index_offset = old_header.index_offset;
        header.previous_index_size = old_header.index_size;
        header.flags |= FLAG_HAS_TRAILING_INDEX;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.flush()?;

        debug!(
            path = %path.display(),
            appended = self.assets.len(),
            carried = carried.len(),
            "appended pack update"
        );
        Ok(())
    }

    fn collect_carried(&self, existing: &PackReader) -> Result<Vec<CarriedEntry>> {
        let superseded: FxHashSet<[u8; 16]> = self.assets.iter().map(|a| a.id.0).collect();

        let mut carried = Vec::new();
        for entry in existing.raw_entries() {
            if superseded.contains(&entry.asset_id) {
                continue;
            }

            let name = existing
                .string(entry.name_string_id)
                .ok_or_else(|| {
                    Error::Format(format!(
                        "existing entry references unknown string id {}",
                        entry.name_string_id
                    ))
                })?
                .to_string();
            let variant = if entry.variant_string_id == VARIANT_NONE {
                String::new()
            } else {
                existing
                    .string(entry.variant_string_id)
                    .ok_or_else(|| {
                        Error::Format(format!(
                            "existing entry references unknown string id {}",
                            entry.variant_string_id
                        ))
                    })?
                    .to_string()
            };

            let bulk = if entry.has_bulk() {
                let first = entry.bulk_first_index as usize;
                let count = entry.bulk_count as usize;
                existing
                    .raw_bulk_entries()
                    .get(first..first + count)
                    .ok_or_else(|| {
                        Error::Format("existing entry references out-of-range bulk entries".into())
                    })?
                    .to_vec()
            } else {
                Vec::new()
            };

            carried.push(CarriedEntry {
                entry: entry.clone(),
                name,
                variant,
                bulk,
            });
        }
        Ok(carried)
    }

    fn write_tranche(
        &self,
        file: &mut File,
        start_offset: u64,
        carried: &[CarriedEntry],
        previous_index_offset: u64,
        previous_index_size: u64,
    ) -> Result<Tranche> {
        // Phase one: collect every string this tranche's index will
        // reference, then freeze the table. A string surfacing after this
        // point is a writer bug.
        let mut strings = StringTable::new();
        for c in carried {
            strings.intern(&c.name);
            if !c.variant.is_empty() {
                strings.intern(&c.variant);
            }
        }
        for asset in &self.assets {
            strings.intern(&asset.name);
            if !asset.variant_key.is_empty() {
                strings.intern(&asset.variant_key);
            }
        }

        let string_block = strings.serialize();
        strings.freeze();

        let string_table_offset = start_offset;
        file.write_all(&string_block)?;
        let mut offset = start_offset + string_block.len() as u64;

        let mut entries = Vec::with_capacity(carried.len() + self.assets.len());
        let mut bulk_entries = Vec::new();

        // Carried entries keep their chunk locations; string ids and the
        // bulk array base are remapped into this tranche.
        for c in carried {
            let mut entry = c.entry.clone();
            entry.name_string_id = strings.id(&c.name);
            entry.variant_string_id = if c.variant.is_empty() {
                VARIANT_NONE
            } else {
                strings.id(&c.variant)
            };
            if entry.has_bulk() {
                entry.bulk_first_index = bulk_entries.len() as u32;
                bulk_entries.extend(c.bulk.iter().cloned());
            } else {
                entry.bulk_first_index = 0;
            }
            entries.push(entry);
        }

        for asset in &self.assets {
            let entry = self.write_asset(file, &mut offset, &strings, &mut bulk_entries, asset)?;
            entries.push(entry);
        }

        let index_block = build_index_block(
            &entries,
            &bulk_entries,
            previous_index_offset,
            previous_index_size,
        );
        let index_offset = offset;
        file.write_all(&index_block)?;
        offset += index_block.len() as u64;

        Ok(Tranche {
            string_table_offset,
            string_table_size: string_block.len() as u64,
            index_offset,
            index_size: index_block.len() as u64,
            index_hash: hash128(&index_block),
            end_offset: offset,
        })
    }

    fn write_asset(
        &self,
        file: &mut File,
        offset: &mut u64,
        strings: &StringTable,
        bulk_entries: &mut Vec<BulkEntry>,
        asset: &AssetPackEntry,
    ) -> Result<IndexEntry> {
        let mut entry = IndexEntry {
            asset_id: asset.id.0,
            asset_kind: asset.asset_kind.0,
            cooked_payload_type: asset.cooked.payload_type.0,
            cooked_schema_version: asset.cooked.schema_version,
            name_string_id: strings.id(&asset.name),
            name_hash64: hash64(asset.name.as_bytes()),
            ..Default::default()
        };

        if asset.variant_key.is_empty() {
            entry.variant_string_id = VARIANT_NONE;
            entry.variant_hash64 = 0;
        } else {
            entry.variant_string_id = strings.id(&asset.variant_key);
            entry.variant_hash64 = hash64(asset.variant_key.as_bytes());
        }

        // Main payload chunk.
        let payload_hash = hash128(&asset.cooked.bytes);
        let compressed = compress(&asset.cooked.bytes, self.compression, self.level)?;

        let chunk_header = ChunkHeader {
            magic: CHUNK_MAGIC,
            version: PACK_VERSION,
            asset_id: asset.id.0,
            payload_type: asset.cooked.payload_type.0,
            schema_version: asset.cooked.schema_version,
            compression: self.compression as u8,
            chunk_kind: ChunkKind::MainPayload as u8,
            reserved0: self.level as u16,
            size_compressed: compressed.len() as u64,
            size_uncompressed: asset.cooked.bytes.len() as u64,
            hash: payload_hash,
        };

        entry.payload_chunk_offset = *offset;
        entry.payload_chunk_size_compressed = (ChunkHeader::SIZE + compressed.len()) as u64;
        entry.payload_chunk_size_uncompressed = asset.cooked.bytes.len() as u64;
        entry.compression = self.compression as u8;
        entry.reserved0 = self.level as u16;
        entry.payload_hash = payload_hash;

        file.write_all(&chunk_header.encode())?;
        file.write_all(&compressed)?;
        *offset += (ChunkHeader::SIZE + compressed.len()) as u64;

        // Bulk chunks, if any.
        if asset.bulk.is_empty() {
            entry.bulk_first_index = 0;
            entry.bulk_count = 0;
            return Ok(entry);
        }

        entry.flags |= ENTRY_FLAG_HAS_BULK;
        entry.bulk_first_index = bulk_entries.len() as u32;
        entry.bulk_count = asset.bulk.len() as u32;

        for (bulk_index, bulk) in asset.bulk.iter().enumerate() {
            let (mode, level) = if bulk.compress {
                (
                    bulk.compression_override.unwrap_or(self.compression),
                    bulk.level_override.unwrap_or(self.level),
                )
            } else {
                (Compression::None, CompressionLevel::Default)
            };

            let bulk_hash = hash128(&bulk.bytes);
            let compressed = compress(&bulk.bytes, mode, level)?;

            let bulk_header = ChunkHeader {
                magic: CHUNK_MAGIC,
                version: PACK_VERSION,
                asset_id: asset.id.0,
                payload_type: asset.cooked.payload_type.0,
                schema_version: 0,
                compression: mode as u8,
                chunk_kind: ChunkKind::Bulk as u8,
                reserved0: level as u16,
                size_compressed: compressed.len() as u64,
                size_uncompressed: bulk.bytes.len() as u64,
                hash: bulk_hash,
            };

            bulk_entries.push(BulkEntry {
                semantic: bulk.semantic,
                // The array position, not the caller-supplied field; the
                // reader verifies the two agree.
                sub_index: bulk_index as u32,
                chunk_offset: *offset,
                size_compressed: (ChunkHeader::SIZE + compressed.len()) as u64,
                size_uncompressed: bulk.bytes.len() as u64,
                compression: mode as u8,
                level: level as u8,
                hash: bulk_hash,
            });

            file.write_all(&bulk_header.encode())?;
            file.write_all(&compressed)?;
            *offset += (ChunkHeader::SIZE + compressed.len()) as u64;
        }

        Ok(entry)
    }
}

struct Tranche {
    string_table_offset: u64,
    string_table_size: u64,
    index_offset: u64,
    index_size: u64,
    index_hash: crate::hashing::Hash128,
    end_offset: u64,
}

/// Validate that a file looks like a compatible pack before appending to
/// it. Used by tooling that wants the check without a full open.
pub fn validate_pack_header(path: impl AsRef<Path>) -> Result<PackHeader> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.display())))?;
    let actual_size = file.metadata()?.len();

    if actual_size < PackHeader::SIZE as u64 {
        return Err(Error::Format("file too small to contain pack header".into()));
    }

    let mut buf = [0u8; PackHeader::SIZE];
    std::io::Read::read_exact(&mut file, &mut buf)?;
    let header = PackHeader::decode(&buf);

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
    if header.endian_marker != crate::pack::format::ENDIAN_MARKER {
        return Err(Error::Format(
            "endian mismatch: pack was created on a different architecture".into(),
        ));
    }
    if header.file_size > actual_size {
        return Err(Error::Format(format!(
            "header file size ({}) exceeds actual file size ({}): pack may be truncated",
            header.file_size, actual_size
        )));
    }

    Ok(header)
}
