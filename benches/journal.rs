use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tidelog::journal::{Journal, JournalOptions};
use tidelog::SyncMode;

fn bench_append(c: &mut Criterion) {
  let mut group = c.benchmark_group("journal_append");
  for size in [64usize, 1024, 16 * 1024] {
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function(format!("{size}b"), |b| {
      let dir = tempfile::tempdir().expect("tempdir");
      let mut journal = Journal::open(
        dir.path(),
        JournalOptions {
          max_segment_bytes: 256 * 1024 * 1024,
          max_log_bytes: 0,
          max_log_age_ms: None,
          sync_mode: SyncMode::Never,
        },
      )
      .expect("open");
      let payload = vec![0xabu8; size];
      b.iter(|| {
        let record = journal.append(black_box(payload.clone())).expect("append");
        black_box(record.index)
      });
    });
  }
  group.finish();
}

fn bench_read(c: &mut Criterion) {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut journal = Journal::open(
    dir.path(),
    JournalOptions {
      max_segment_bytes: 4 * 1024 * 1024,
      max_log_bytes: 0,
      max_log_age_ms: None,
      sync_mode: SyncMode::Never,
    },
  )
  .expect("open");
  for i in 0..10_000u64 {
    journal.append(format!("record-{i}").into_bytes()).expect("append");
  }

  c.bench_function("journal_read_1k_batch", |b| {
    let mut from = 1u64;
    b.iter(|| {
      let (records, next) = journal.read(from, 64 * 1024).expect("read");
      from = if next > 10_000 { 1 } else { next };
      black_box(records.len())
    });
  });
}

criterion_group!(benches, bench_append, bench_read);
criterion_main!(benches);
