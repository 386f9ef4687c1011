//! Cross-module integration tests: pack round-trips, overlay resolution,
//! corruption handling, append-updates, async loading and the source
//! asset fallback.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::cache::CacheConfig;
use crate::compression::{Compression, CompressionLevel};
use crate::error::{Error, Result};
use crate::id::{deterministic_asset_id, TypeId, Uuid};
use crate::loader::{CancellationToken, LoadPriority};
use crate::manager::{
    AssetFactory, AssetLoadContext, AssetManager, ManagerConfig, PackMountOptions,
};
use crate::pack::format::{IndexHeader, PackHeader};
use crate::pack::{AssetInfo, AssetPackEntry, BulkChunk, BulkSemantic, PackReader, PackWriter};
use crate::payload::TypedPayload;
use crate::pipeline::test_support::{text_cooked_type, TextCooker, TextImporter};
use crate::pipeline::RuntimePipelineConfig;
use crate::source::SourceMountConfig;

/// Install a subscriber once so `RUST_LOG` surfaces engine diagnostics
/// from failing tests. Later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tex_kind() -> TypeId {
    Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "tests.kind.texture")
}

fn tex_payload_type() -> TypeId {
    Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "tests.payload.texture")
}

fn entry(name: &str, variant: &str, cooked: Vec<u8>, bulk: Vec<BulkChunk>) -> AssetPackEntry {
    AssetPackEntry {
        id: deterministic_asset_id(name, variant),
        asset_kind: tex_kind(),
        name: name.to_string(),
        variant_key: variant.to_string(),
        cooked: TypedPayload::new(tex_payload_type(), 1, cooked),
        bulk,
    }
}

fn write_pack(path: &std::path::Path, entries: Vec<AssetPackEntry>, mode: Compression) {
    let mut writer = PackWriter::new();
    writer.set_compression(mode);
    writer.set_compression_level(CompressionLevel::Default);
    for e in entries {
        writer.add_asset(e);
    }
    writer.write(path).unwrap();
}

/// Factory that exposes the cooked payload bytes as the runtime object.
struct BytesFactory {
    cooked_type: TypeId,
}

impl AssetFactory for BytesFactory {
    fn cooked_payload_type(&self) -> TypeId {
        self.cooked_type
    }

    fn load(&self, ctx: &AssetLoadContext) -> Result<Box<dyn Any + Send + Sync>> {
        Ok(Box::new(ctx.cooked.bytes.clone()))
    }
}

/// Runtime type whose factory loads slowly, for pinning a loader worker.
struct SlowBytes(#[allow(dead_code)] Vec<u8>);

struct SlowFactory {
    cooked_type: TypeId,
}

impl AssetFactory for SlowFactory {
    fn cooked_payload_type(&self) -> TypeId {
        self.cooked_type
    }

    fn load(&self, ctx: &AssetLoadContext) -> Result<Box<dyn Any + Send + Sync>> {
        std::thread::sleep(Duration::from_millis(100));
        Ok(Box::new(SlowBytes(ctx.cooked.bytes.clone())))
    }
}

/// Factory that concatenates the cooked payload with every bulk chunk.
struct ConcatFactory {
    cooked_type: TypeId,
}

impl AssetFactory for ConcatFactory {
    fn cooked_payload_type(&self) -> TypeId {
        self.cooked_type
    }

    fn load(&self, ctx: &AssetLoadContext) -> Result<Box<dyn Any + Send + Sync>> {
        let mut out = ctx.cooked.bytes.clone();
        for i in 0..ctx.info.bulk_chunk_count {
            out.extend_from_slice(&ctx.load_bulk(i)?);
        }
        Ok(Box::new(out))
    }
}

// ---- round trips ----

#[test]
fn roundtrip_one_asset() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    write_pack(
        &pack,
        vec![entry(
            "textures/sky",
            "",
            vec![1, 2, 3, 4],
            vec![BulkChunk::new(BulkSemantic::Level, 0, vec![0xAA, 0xBB])],
        )],
        Compression::Zstd,
    );

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_count(), 1);

    let info = reader.asset_info(0).unwrap();
    assert_eq!(info.name, "textures/sky");
    assert_eq!(info.variant_key, "");
    assert_eq!(info.asset_kind, tex_kind());
    assert_eq!(info.cooked_payload_type, tex_payload_type());
    assert_eq!(info.bulk_chunk_count, 1);

    let payload = reader.load_cooked_payload(info.id).unwrap();
    assert_eq!(payload.bytes, vec![1, 2, 3, 4]);
    assert_eq!(payload.schema_version, 1);

    assert_eq!(reader.load_bulk_chunk(info.id, 0).unwrap(), vec![0xAA, 0xBB]);

    let bulk_info = reader.bulk_chunk_info(info.id, 0).unwrap();
    assert_eq!(bulk_info.semantic, BulkSemantic::Level);
    assert_eq!(bulk_info.sub_index, 0);
    assert_eq!(bulk_info.uncompressed_size, 2);
}

#[test]
fn roundtrip_all_compression_modes() {
    let dir = tempfile::tempdir().unwrap();
    let cooked: Vec<u8> = (0..2000u32).map(|i| (i % 200) as u8).collect();
    let bulk: Vec<u8> = (0..5000u32).map(|i| (i % 17) as u8).collect();

    for mode in [
        Compression::None,
        Compression::Lz4,
        Compression::Lz4Hc,
        Compression::Zstd,
        Compression::ZstdFast,
    ] {
        let pack = dir.path().join(format!("p_{}.snpak", mode as u8));
        write_pack(
            &pack,
            vec![entry(
                "a",
                "",
                cooked.clone(),
                vec![BulkChunk::new(BulkSemantic::Aux, 0, bulk.clone())],
            )],
            mode,
        );

        let reader = PackReader::open(&pack).unwrap();
        let info = reader.asset_info(0).unwrap();
        assert_eq!(reader.load_cooked_payload(info.id).unwrap().bytes, cooked);
        assert_eq!(reader.load_bulk_chunk(info.id, 0).unwrap(), bulk);
    }
}

#[test]
fn asset_info_fields_survive_write_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    let original = entry("mat/m", "hdr", vec![9, 9], vec![]);
    let expected = AssetInfo {
        id: original.id,
        asset_kind: original.asset_kind,
        cooked_payload_type: tex_payload_type(),
        schema_version: 1,
        name: "mat/m".to_string(),
        variant_key: "hdr".to_string(),
        bulk_chunk_count: 0,
    };
    write_pack(&pack, vec![original], Compression::Lz4);

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_info(0).unwrap(), expected);
    assert_eq!(reader.find_asset(expected.id).unwrap(), expected);
}

#[test]
fn multiple_bulk_chunks_keep_their_order() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    let chunks: Vec<BulkChunk> = (0..4u32)
        .map(|i| BulkChunk::new(BulkSemantic::Level, i, vec![i as u8; 16 + i as usize]))
        .collect();
    write_pack(&pack, vec![entry("mesh", "", vec![1], chunks)], Compression::Zstd);

    let reader = PackReader::open(&pack).unwrap();
    let info = reader.asset_info(0).unwrap();
    assert_eq!(info.bulk_chunk_count, 4);
    for i in 0..4u32 {
        let bytes = reader.load_bulk_chunk(info.id, i).unwrap();
        assert_eq!(bytes, vec![i as u8; 16 + i as usize]);
        assert_eq!(reader.bulk_chunk_info(info.id, i).unwrap().sub_index, i);
    }
    // Past the end fails cleanly.
    assert!(reader.load_bulk_chunk(info.id, 4).is_err());
}

#[test]
fn parallel_chunk_loads() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    let entries: Vec<AssetPackEntry> = (0..8)
        .map(|i| {
            entry(
                &format!("asset/{i}"),
                "",
                vec![i as u8; 512],
                vec![BulkChunk::new(BulkSemantic::Aux, 0, vec![i as u8; 2048])],
            )
        })
        .collect();
    write_pack(&pack, entries, Compression::Zstd);

    let reader = Arc::new(PackReader::open(&pack).unwrap());
    let mut handles = Vec::new();
    for i in 0..8 {
        let reader = Arc::clone(&reader);
        handles.push(std::thread::spawn(move || {
            let info = reader.find_asset_by_name(&format!("asset/{i}")).unwrap();
            for _ in 0..16 {
                let payload = reader.load_cooked_payload(info.id).unwrap();
                assert_eq!(payload.bytes, vec![i as u8; 512]);
                let bulk = reader.load_bulk_chunk(info.id, 0).unwrap();
                assert_eq!(bulk, vec![i as u8; 2048]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

// ---- variants ----

#[test]
fn variants_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    write_pack(
        &pack,
        vec![
            entry("mat/m", "", vec![1], vec![]),
            entry("mat/m", "hdr", vec![2], vec![]),
        ],
        Compression::Zstd,
    );

    let reader = PackReader::open(&pack).unwrap();
    let variants = reader.find_assets_by_name("mat/m");
    assert_eq!(variants.len(), 2);

    // The canonical lookup picks the variant-less entry.
    let canonical = reader.find_asset_by_name("mat/m").unwrap();
    assert_eq!(canonical.variant_key, "");
    assert_eq!(reader.load_cooked_payload(canonical.id).unwrap().bytes, vec![1]);
}

// ---- corruption and boundaries ----

#[test]
fn open_rejects_tiny_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.snpak");
    std::fs::write(&path, vec![0u8; 50]).unwrap();
    assert!(matches!(PackReader::open(&path), Err(Error::Format(_))));
}

#[test]
fn open_rejects_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.snpak");
    std::fs::write(&path, b"").unwrap();
    assert!(PackReader::open(&path).is_err());
}

#[test]
fn open_rejects_missing_file() {
    let err = PackReader::open("/nonexistent/nowhere.snpak").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn open_rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::None);

    let mut bytes = std::fs::read(&pack).unwrap();
    bytes[0] = b'X';
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("magic"), "{err}");
}

#[test]
fn open_rejects_wrong_version() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::None);

    let mut bytes = std::fs::read(&pack).unwrap();
    bytes[8] = 99;
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("version"), "{err}");
}

#[test]
fn open_rejects_foreign_endian() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::None);

    let mut bytes = std::fs::read(&pack).unwrap();
    // Endian marker sits after magic, version and header size.
    bytes[16..20].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("ndian"), "{err}");
}

#[test]
fn open_rejects_oversized_file_size_claim() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::None);

    let mut bytes = std::fs::read(&pack).unwrap();
    let mut header_buf = [0u8; PackHeader::SIZE];
    header_buf.copy_from_slice(&bytes[..PackHeader::SIZE]);
    let mut header = PackHeader::decode(&header_buf);
    header.file_size = bytes.len() as u64 + 1000;
    bytes[..PackHeader::SIZE].copy_from_slice(&header.encode());
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("exceeds actual file size"), "{err}");
}

fn header_of(pack: &std::path::Path) -> PackHeader {
    let bytes = std::fs::read(pack).unwrap();
    let mut buf = [0u8; PackHeader::SIZE];
    buf.copy_from_slice(&bytes[..PackHeader::SIZE]);
    PackHeader::decode(&buf)
}

#[test]
fn flip_in_index_entries_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1, 2, 3], vec![])], Compression::None);

    let header = header_of(&pack);
    let mut bytes = std::fs::read(&pack).unwrap();
    // Flip one byte inside the entry array, past the index header.
    let target = header.index_offset as usize + IndexHeader::SIZE + 40;
    bytes[target] ^= 0xFF;
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("hash mismatch"), "{err}");
}

#[test]
fn flip_in_index_header_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1, 2, 3], vec![])], Compression::None);

    let header = header_of(&pack);
    let mut bytes = std::fs::read(&pack).unwrap();
    // The reserved tail of the index header is covered only by the pack
    // header's block hash.
    let target = header.index_offset as usize + IndexHeader::SIZE - 4;
    bytes[target] ^= 0xFF;
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("hash mismatch"), "{err}");
}

#[test]
fn flip_in_string_data_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![entry("some/asset/name", "", vec![1], vec![])],
        Compression::None,
    );

    let header = header_of(&pack);
    let mut bytes = std::fs::read(&pack).unwrap();
    // Last byte of the string block is string data.
    let target = (header.string_table_offset + header.string_table_size) as usize - 2;
    bytes[target] ^= 0xFF;
    std::fs::write(&pack, bytes).unwrap();

    let err = PackReader::open(&pack).unwrap_err();
    assert!(err.to_string().contains("hash mismatch"), "{err}");
}

#[test]
fn flip_in_chunk_payload_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![entry("a", "", vec![7u8; 64], vec![])],
        Compression::None,
    );

    // The open succeeds (chunks are not validated eagerly); the load
    // fails.
    let header = header_of(&pack);
    let mut bytes = std::fs::read(&pack).unwrap();
    let payload_at = header.string_table_offset as usize + header.string_table_size as usize;
    let target = payload_at + crate::pack::format::ChunkHeader::SIZE + 10;
    bytes[target] ^= 0xFF;
    std::fs::write(&pack, bytes).unwrap();

    let reader = PackReader::open(&pack).unwrap();
    let info = reader.asset_info(0).unwrap();
    let err = reader.load_cooked_payload(info.id).unwrap_err();
    assert!(err.to_string().contains("hash mismatch"), "{err}");
}

// ---- append-update ----

#[test]
fn append_update_preserves_and_extends() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    write_pack(
        &pack,
        vec![entry(
            "x",
            "",
            vec![1, 1, 1],
            vec![BulkChunk::new(BulkSemantic::Level, 0, vec![0x10; 64])],
        )],
        Compression::Zstd,
    );
    let old_header = header_of(&pack);

    let mut writer = PackWriter::new();
    writer.set_compression(Compression::Zstd);
    writer.add_asset(entry("y", "", vec![2, 2, 2], vec![]));
    writer.append_update(&pack).unwrap();

    let new_header = header_of(&pack);
    assert_eq!(new_header.previous_index_offset, old_header.index_offset);
    assert_eq!(new_header.previous_index_size, old_header.index_size);
    assert_ne!(new_header.flags & crate::pack::format::FLAG_HAS_TRAILING_INDEX, 0);

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_count(), 2);

    let x = reader.find_asset_by_name("x").unwrap();
    assert_eq!(reader.load_cooked_payload(x.id).unwrap().bytes, vec![1, 1, 1]);
    assert_eq!(reader.load_bulk_chunk(x.id, 0).unwrap(), vec![0x10; 64]);

    let y = reader.find_asset_by_name("y").unwrap();
    assert_eq!(reader.load_cooked_payload(y.id).unwrap().bytes, vec![2, 2, 2]);
}

#[test]
fn append_update_supersedes_same_id() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    write_pack(&pack, vec![entry("x", "", vec![1], vec![])], Compression::Zstd);

    let mut writer = PackWriter::new();
    writer.set_compression(Compression::Zstd);
    writer.add_asset(entry("x", "", vec![9, 9], vec![]));
    writer.append_update(&pack).unwrap();

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_count(), 1);
    let x = reader.find_asset_by_name("x").unwrap();
    assert_eq!(reader.load_cooked_payload(x.id).unwrap().bytes, vec![9, 9]);
}

#[test]
fn append_update_on_missing_path_writes_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("new.snpak");

    let mut writer = PackWriter::new();
    writer.add_asset(entry("only", "", vec![5], vec![]));
    writer.append_update(&pack).unwrap();

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_count(), 1);
    assert_eq!(header_of(&pack).previous_index_offset, 0);
}

#[test]
fn chained_appends_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");

    for i in 0..4u8 {
        let mut writer = PackWriter::new();
        writer.set_compression(Compression::Lz4);
        writer.add_asset(entry(&format!("asset/{i}"), "", vec![i; 8], vec![]));
        writer.append_update(&pack).unwrap();
    }

    let reader = PackReader::open(&pack).unwrap();
    assert_eq!(reader.asset_count(), 4);
    for i in 0..4u8 {
        let info = reader.find_asset_by_name(&format!("asset/{i}")).unwrap();
        assert_eq!(reader.load_cooked_payload(info.id).unwrap().bytes, vec![i; 8]);
    }
}

// ---- manager: overlays, cache, hot reload ----

#[test]
fn overlay_priority_patch_wins() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.snpak");
    let patch = dir.path().join("patch.snpak");
    write_pack(&base, vec![entry("t/c", "", vec![0x01], vec![])], Compression::Zstd);
    write_pack(&patch, vec![entry("t/c", "", vec![0x02], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig::default());
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });

    manager
        .mount_pack(&base, PackMountOptions { priority: 0, ..Default::default() })
        .unwrap();
    manager
        .mount_pack(&patch, PackMountOptions { priority: 100, ..Default::default() })
        .unwrap();

    let bytes = manager.load::<Vec<u8>>("t/c").unwrap();
    assert_eq!(bytes[0], 0x02);

    manager.unmount_pack(&patch);
    let bytes = manager.load::<Vec<u8>>("t/c").unwrap();
    assert_eq!(bytes[0], 0x01);
}

#[test]
fn mount_point_prefixes_names() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("dlc.snpak");
    write_pack(&pack, vec![entry("maps/town", "", vec![7], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig::default());
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });
    manager
        .mount_pack(
            &pack,
            PackMountOptions {
                mount_point: "dlc1/".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(manager.find_asset("maps/town").is_err());
    assert!(manager.find_asset("dlc1/maps/town").is_ok());
    assert_eq!(*manager.load::<Vec<u8>>("dlc1/maps/town").unwrap(), vec![7]);
}

#[test]
fn duplicate_mount_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig::default());
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();
    assert!(manager.mount_pack(&pack, PackMountOptions::default()).is_err());
}

#[test]
fn factory_type_mismatch_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig::default());
    // Factory declares a different cooked type than the asset carries.
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: Uuid::new_v4(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let err = manager.load::<Vec<u8>>("a").unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert!(err.to_string().contains("mismatch"));
}

#[test]
fn missing_factory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig::default());
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let err = manager.load::<Vec<u8>>("a").unwrap_err();
    assert!(err.to_string().contains("no factory"));
}

#[test]
fn cached_get_returns_shared_handles() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![entry(
            "a",
            "",
            vec![3, 3],
            vec![BulkChunk::new(BulkSemantic::Aux, 0, vec![0u8; 4096])],
        )],
        Compression::Zstd,
    );

    let manager = AssetManager::new(ManagerConfig::default());
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let first = manager.get::<Vec<u8>>("a").unwrap();
    assert!(first.is_valid());
    let id = first.asset_id().unwrap();
    assert!(manager.is_cached::<Vec<u8>>(id));

    let second = manager.get::<Vec<u8>>("a").unwrap();
    assert_eq!(second.use_count(), 2);
    // Size estimate comes from the uncompressed bulk sizes.
    assert_eq!(manager.cache().memory_usage(), 4096);
}

#[test]
fn factory_size_estimate_overrides_heuristic() {
    struct SizedFactory {
        cooked_type: TypeId,
    }

    impl AssetFactory for SizedFactory {
        fn cooked_payload_type(&self) -> TypeId {
            self.cooked_type
        }

        fn estimate_size(&self, ctx: &AssetLoadContext) -> usize {
            // Pretend the runtime object decompresses to four times its
            // cooked size.
            ctx.cooked.bytes.len() * 4
        }

        fn load(&self, ctx: &AssetLoadContext) -> Result<Box<dyn Any + Send + Sync>> {
            Ok(Box::new(ctx.cooked.bytes.clone()))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![entry(
            "sized",
            "",
            vec![0u8; 100],
            // Without the factory estimate this would be accounted at the
            // bulk sum of 4096 bytes.
            vec![BulkChunk::new(BulkSemantic::Aux, 0, vec![0u8; 4096])],
        )],
        Compression::Zstd,
    );

    let manager = AssetManager::new(ManagerConfig::default());
    manager.register_factory::<Vec<u8>>(SizedFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let handle = manager.get::<Vec<u8>>("sized").unwrap();
    assert!(handle.is_valid());
    assert_eq!(manager.cache().memory_usage(), 400);
}

#[test]
fn bulk_closures_feed_factories() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![entry(
            "combined",
            "",
            vec![1, 2],
            vec![
                BulkChunk::new(BulkSemantic::Level, 0, vec![3, 4]),
                BulkChunk::new(BulkSemantic::Level, 1, vec![5]),
            ],
        )],
        Compression::Lz4,
    );

    let manager = AssetManager::new(ManagerConfig::default());
    manager.register_factory::<Vec<u8>>(ConcatFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    assert_eq!(*manager.load::<Vec<u8>>("combined").unwrap(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn eviction_age_gate_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![
            entry("big/1", "", vec![1], vec![BulkChunk::new(BulkSemantic::Aux, 0, vec![0u8; 900])]),
            entry("big/2", "", vec![2], vec![BulkChunk::new(BulkSemantic::Aux, 0, vec![0u8; 900])]),
        ],
        Compression::Zstd,
    );

    let manager = AssetManager::new(ManagerConfig {
        cache: CacheConfig {
            max_memory_bytes: 1024,
            min_age_before_eviction: Duration::from_secs(10),
            ..CacheConfig::default()
        },
        ..ManagerConfig::default()
    });
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let first = manager.get::<Vec<u8>>("big/1").unwrap();
    let first_id = first.asset_id().unwrap();
    drop(first);

    // Inserting the second crosses the threshold, but the first is too
    // young to evict.
    let _second = manager.get::<Vec<u8>>("big/2").unwrap();
    assert!(manager.is_cached::<Vec<u8>>(first_id));
    assert_eq!(manager.cache().memory_usage(), 1800);
}

#[test]
fn async_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(
        &pack,
        vec![
            entry("gate", "", vec![0], vec![]),
            entry("low", "", vec![1], vec![]),
            entry("normal", "", vec![2], vec![]),
            entry("critical", "", vec![3], vec![]),
        ],
        Compression::Zstd,
    );

    let manager = AssetManager::new(ManagerConfig {
        loader_threads: 1,
        ..ManagerConfig::default()
    });
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });
    manager.register_factory::<SlowBytes>(SlowFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = Arc::clone(order);
        move |result: crate::manager::AsyncLoadResult<Vec<u8>>| {
            assert!(result.is_success());
            order.lock().push(label);
        }
    };

    // Pin the single worker on a slow load so the next three sort in the
    // queue.
    let gate_order = Arc::clone(&order);
    let gate = manager.load_async::<SlowBytes>(
        "gate",
        LoadPriority::Critical,
        None,
        move |result| {
            assert!(result.is_success());
            gate_order.lock().push("gate");
        },
        CancellationToken::new(),
    );
    let low = manager.load_async::<Vec<u8>>(
        "low",
        LoadPriority::Low,
        None,
        record("low", &order),
        CancellationToken::new(),
    );
    let normal = manager.load_async::<Vec<u8>>(
        "normal",
        LoadPriority::Normal,
        None,
        record("normal", &order),
        CancellationToken::new(),
    );
    let critical = manager.load_async::<Vec<u8>>(
        "critical",
        LoadPriority::Critical,
        None,
        record("critical", &order),
        CancellationToken::new(),
    );

    for handle in [&gate, &low, &normal, &critical] {
        manager.async_loader().wait(handle);
    }

    let observed = order.lock().clone();
    assert_eq!(observed[1..], ["critical", "normal", "low"]);
}

#[test]
fn hot_reload_swaps_readers_and_reports_ids() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let pack = dir.path().join("p.snpak");
    write_pack(&pack, vec![entry("a", "", vec![1], vec![])], Compression::Zstd);

    let manager = AssetManager::new(ManagerConfig {
        hot_reload: true,
        // Manual checks only.
        hot_reload_poll: Duration::ZERO,
        ..ManagerConfig::default()
    });
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: tex_payload_type(),
    });
    manager.mount_pack(&pack, PackMountOptions::default()).unwrap();

    let reported: Arc<Mutex<Vec<crate::id::AssetId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    manager.set_hot_reload_callback(move |ids| sink.lock().extend_from_slice(ids));

    // Unchanged file: nothing happens.
    assert!(manager.check_for_changes().is_empty());

    // Replace the pack and push its mtime forward so the change is
    // unambiguous even on coarse-grained filesystems.
    write_pack(&pack, vec![entry("a", "", vec![2], vec![])], Compression::Zstd);
    let file = std::fs::OpenOptions::new().write(true).open(&pack).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
    drop(file);

    let reloaded = manager.check_for_changes();
    assert_eq!(reloaded, vec![pack.clone()]);
    assert_eq!(reported.lock().len(), 1);

    assert_eq!(*manager.load::<Vec<u8>>("a").unwrap(), vec![2]);
}

#[test]
fn auto_mount_scans_search_paths() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("packs/nested");
    std::fs::create_dir_all(&sub).unwrap();
    write_pack(&sub.join("found.snpak"), vec![entry("a", "", vec![1], vec![])], Compression::Zstd);
    std::fs::write(dir.path().join("packs/not_a_pack.bin"), b"junk").unwrap();

    let manager = AssetManager::new(ManagerConfig {
        pack_search_paths: vec![dir.path().join("packs")],
        ..ManagerConfig::default()
    });
    assert_eq!(manager.mounted_packs().len(), 1);
    assert!(manager.find_asset("a").is_ok());
}

// ---- source asset fallback ----

#[test]
fn source_fallback_cooks_and_loads() {
    init_tracing();
    let source_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("note.txt"), b"from source").unwrap();

    let manager = AssetManager::new(ManagerConfig {
        source_assets: true,
        source_roots: vec![SourceMountConfig {
            root_path: source_dir.path().to_path_buf(),
            priority: 0,
            mount_point: String::new(),
        }],
        runtime_pipeline: RuntimePipelineConfig {
            output_directory: out_dir.path().to_path_buf(),
            ..RuntimePipelineConfig::default()
        },
        ..ManagerConfig::default()
    });

    manager.register_importer(Box::new(TextImporter));
    manager.register_cooker(Box::new(TextCooker::default()));
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: text_cooked_type(),
    });

    // No pack is mounted; the name resolves through the source root.
    let bytes = manager.load::<Vec<u8>>("note.txt").unwrap();
    assert_eq!(*bytes, b"from source".to_vec());
    assert_eq!(manager.dirty_asset_count(), 1);

    manager.save_runtime_assets().unwrap();
    assert_eq!(manager.dirty_asset_count(), 0);

    let runtime_pack = out_dir.path().join("runtime_assets.snpak");
    let reader = PackReader::open(&runtime_pack).unwrap();
    assert_eq!(reader.asset_count(), 1);
}

#[test]
fn source_fallback_miss_is_not_found() {
    let source_dir = tempfile::tempdir().unwrap();

    let manager = AssetManager::new(ManagerConfig {
        source_assets: true,
        source_roots: vec![SourceMountConfig {
            root_path: source_dir.path().to_path_buf(),
            priority: 0,
            mount_point: String::new(),
        }],
        ..ManagerConfig::default()
    });
    manager.register_factory::<Vec<u8>>(BytesFactory {
        cooked_type: text_cooked_type(),
    });

    assert!(matches!(
        manager.load::<Vec<u8>>("absent.txt"),
        Err(Error::NotFound(_))
    ));
}
