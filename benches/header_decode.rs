//! Benchmark suite for the header decoder and the info extractor.
//!
//! Run: cargo bench --bench header_decode

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rpmdb::header::{tag, Kind};
use rpmdb::io::Rope;
use rpmdb::{Header, Info};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Serialize a header: preamble, index entries, data arena. Kept local so
/// the bench does not depend on the library's test fixtures.
fn build_header(entries: &[(i32, Kind, Vec<u8>, u32)]) -> Vec<u8> {
    let mut arena = Vec::new();
    let mut index = Vec::new();
    for (tag, kind, data, count) in entries {
        while arena.len() as u64 % kind.alignment() != 0 {
            arena.push(0);
        }
        index.push((*tag, *kind, arena.len() as u32, *count));
        arena.extend_from_slice(data);
    }
    let mut blob = Vec::new();
    blob.extend((entries.len() as u32).to_be_bytes());
    blob.extend((arena.len() as u32).to_be_bytes());
    for (tag, kind, offset, count) in index {
        blob.extend(tag.to_be_bytes());
        blob.extend((kind as u32).to_be_bytes());
        blob.extend((offset as i32).to_be_bytes());
        blob.extend(count.to_be_bytes());
    }
    blob.extend(arena);
    blob
}

fn str_entry(tag: i32, s: &str) -> (i32, Kind, Vec<u8>, u32) {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    (tag, Kind::String, data, 1)
}

fn str_array_entry(tag: i32, strings: &[String]) -> (i32, Kind, Vec<u8>, u32) {
    let mut data = Vec::new();
    for s in strings {
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }
    (tag, Kind::StringArray, data, strings.len() as u32)
}

/// A header shaped like a real package: NVR, arch, and a file list of the
/// given size.
fn package_blob(file_count: usize) -> Vec<u8> {
    let bases: Vec<String> = (0..file_count).map(|i| format!("file-{i:04}")).collect();
    let indexes: Vec<u8> = (0..file_count)
        .flat_map(|_| 0i32.to_be_bytes())
        .collect();
    build_header(&[
        str_entry(tag::TAG_NAME, "bench-package"),
        str_entry(tag::TAG_VERSION, "1.2.3"),
        str_entry(tag::TAG_RELEASE, "4.el9"),
        str_entry(tag::TAG_ARCH, "x86_64"),
        str_entry(tag::TAG_SOURCE_RPM, "bench-package-1.2.3-4.el9.src.rpm"),
        (tag::TAG_DIR_INDEXES, Kind::Int32, indexes, file_count as u32),
        str_array_entry(tag::TAG_BASENAMES, &bases),
        str_array_entry(tag::TAG_DIR_NAMES, &["/usr/share/bench/".to_string()]),
    ])
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_parse");
    for file_count in [10usize, 100, 1000] {
        let blob = package_blob(file_count);
        group.bench_function(format!("files_{file_count}"), |b| {
            b.iter(|| {
                let h = Header::parse(Rope::from_vec(black_box(blob.clone()))).unwrap();
                black_box(h.entries().len())
            })
        });
    }
    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("info_load");
    for file_count in [10usize, 100, 1000] {
        let blob = package_blob(file_count);
        let header = Header::parse(Rope::from_vec(blob)).unwrap();
        group.bench_function(format!("files_{file_count}"), |b| {
            b.iter(|| {
                let info = Info::load(black_box(&header)).unwrap().unwrap();
                black_box(info.filenames.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_extract);
criterion_main!(benches);
