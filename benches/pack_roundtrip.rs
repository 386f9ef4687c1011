//! Pack write/open/load throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use snpak::{
    deterministic_asset_id, AssetPackEntry, BulkChunk, BulkSemantic, Compression, PackReader,
    PackWriter, TypedPayload, Uuid,
};

fn make_entries(count: usize, bulk_size: usize) -> Vec<AssetPackEntry> {
    let kind = Uuid::new_v5(&snpak::id::ASSET_NAMESPACE, "bench.kind");
    let payload_type = Uuid::new_v5(&snpak::id::ASSET_NAMESPACE, "bench.payload");

    (0..count)
        .map(|i| {
            let name = format!("bench/asset_{i}");
            let cooked: Vec<u8> = (0..256).map(|j| ((i + j) % 251) as u8).collect();
            let bulk: Vec<u8> = (0..bulk_size).map(|j| ((i * 7 + j) % 253) as u8).collect();
            AssetPackEntry {
                id: deterministic_asset_id(&name, ""),
                asset_kind: kind,
                name,
                variant_key: String::new(),
                cooked: TypedPayload::new(payload_type, 1, cooked),
                bulk: vec![BulkChunk::new(BulkSemantic::Level, 0, bulk)],
            }
        })
        .collect()
}

fn write_pack(path: &std::path::Path, entries: &[AssetPackEntry], mode: Compression) {
    let mut writer = PackWriter::new();
    writer.set_compression(mode);
    for entry in entries {
        writer.add_asset(entry.clone());
    }
    writer.write(path).unwrap();
}

fn bench_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let entries = make_entries(64, 16 * 1024);

    let mut group = c.benchmark_group("pack_write");
    for mode in [Compression::None, Compression::Lz4, Compression::Zstd] {
        group.bench_function(format!("{mode:?}"), |b| {
            let path = dir.path().join("bench.snpak");
            b.iter(|| write_pack(black_box(&path), black_box(&entries), mode));
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.snpak");
    write_pack(&path, &make_entries(256, 4 * 1024), Compression::Zstd);

    c.bench_function("pack_open", |b| {
        b.iter(|| black_box(PackReader::open(&path).unwrap()));
    });
}

fn bench_chunk_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.snpak");
    let entries = make_entries(64, 64 * 1024);
    write_pack(&path, &entries, Compression::Lz4);

    let reader = PackReader::open(&path).unwrap();
    let ids: Vec<_> = entries.iter().map(|e| e.id).collect();

    c.bench_function("bulk_chunk_load", |b| {
        let mut i = 0;
        b.iter(|| {
            let id = ids[i % ids.len()];
            i += 1;
            black_box(reader.load_bulk_chunk(id, 0).unwrap())
        });
    });
}

criterion_group!(benches, bench_write, bench_open, bench_chunk_load);
criterion_main!(benches);
