//! Benchmarks for chunk allocation and bump allocation inside a chunk.

use criterion::{BatchSize, Criterion};
use mmtk_metaspace::metaspace::{MetadataType, MetaspaceContext};
use mmtk_metaspace::util::options::Options;
use std::hint::black_box;

fn context() -> MetaspaceContext {
    let mut options = Options::default();
    options.verify_metaspace = false;
    MetaspaceContext::new(options)
}

pub fn bench(c: &mut Criterion) {
    let ctx = context();
    let small = ctx.chunk_sizes(MetadataType::NonClass).small();

    c.bench_function("chunk_alloc_return_small", |b| {
        b.iter(|| {
            let chunk = ctx.allocate_chunk(MetadataType::NonClass, small).unwrap();
            ctx.return_chunk(black_box(chunk));
        })
    });

    let specialized = ctx.chunk_sizes(MetadataType::NonClass).specialized();
    c.bench_function("chunk_alloc_return_split_merge", |b| {
        b.iter(|| {
            // Each specialized chunk comes from splitting a larger free chunk, and the
            // returns merge them back.
            let chunks: Vec<_> = (0..8)
                .map(|_| {
                    ctx.allocate_chunk(MetadataType::NonClass, specialized)
                        .unwrap()
                })
                .collect();
            for chunk in chunks {
                ctx.return_chunk(chunk);
            }
        })
    });

    c.bench_function("metachunk_bump_allocate", |b| {
        b.iter_batched(
            || ctx.allocate_chunk(MetadataType::NonClass, small).unwrap(),
            |mut chunk| {
                while let Some(p) = chunk.allocate(black_box(2)) {
                    black_box(p);
                }
                ctx.return_chunk(chunk);
            },
            BatchSize::SmallInput,
        )
    });
}
