use criterion::{black_box, criterion_group, criterion_main, Criterion};
use isptar::gzip::GzipWriter;
use isptar::record::{FileRecord, Kind, NameCache};
use isptar::walk::alpha_slash_cmp;

fn bench_gzip_feed(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024];
    c.bench_function("gzip_feed_1mb_level6", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            let mut writer = GzipWriter::new(&mut out, 6);
            writer.feed(black_box(&data)).unwrap();
            writer.finish_and_reset().unwrap();
        })
    });
}

fn bench_record_line_roundtrip(c: &mut Criterion) {
    let mut names = NameCache::new();
    let record = FileRecord {
        filename: "some/deeply/nested/path/to/a/file.txt".to_string(),
        user: names.user_name(1000),
        group: names.group_name(1000),
        mode: 0o644,
        kind: Kind::File,
        size: 4096,
        ..Default::default()
    };
    let line = record.to_line();
    c.bench_function("record_parse", |b| {
        b.iter(|| FileRecord::parse(black_box(&line)).unwrap())
    });
}

fn bench_alpha_slash_sort(c: &mut Criterion) {
    let names: Vec<String> = (0..1000).map(|i| format!("dir{}/file{}.txt", i % 20, i)).collect();
    c.bench_function("alpha_slash_sort_1000", |b| {
        b.iter(|| {
            let mut copy = names.clone();
            copy.sort_by(|a, b| alpha_slash_cmp(black_box(a), black_box(b)));
        })
    });
}

criterion_group!(benches, bench_gzip_feed, bench_record_line_roundtrip, bench_alpha_slash_sort);
criterion_main!(benches);
