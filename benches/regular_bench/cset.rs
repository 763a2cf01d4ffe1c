//! Benchmarks for rebuilding and draining the collection set candidates.

use criterion::Criterion;
use mmtk_metaspace::cset::CollectionSetChooser;
use mmtk_metaspace::util::options::Options;
use mmtk_metaspace::util::test_util::MockRegion;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const NUM_REGIONS: usize = 4096;

/// Get a deterministic seeded Rng.
fn get_rng() -> ChaCha8Rng {
    const SEED64: u64 = 0x4050cb1b5ab26c70;
    ChaCha8Rng::seed_from_u64(SEED64)
}

fn make_heap(region_bytes: usize) -> Vec<MockRegion> {
    let mut rng = get_rng();
    (0..NUM_REGIONS as u32)
        .map(|index| {
            let live_bytes = rng.random_range(0..=region_bytes);
            MockRegion::old(index, live_bytes, region_bytes - live_bytes)
        })
        .collect()
}

pub fn bench(c: &mut Criterion) {
    let mut options = Options::default();
    options.verify_metaspace = false;
    let heap = make_heap(options.region_bytes);
    let n_workers = options.threads;

    c.bench_function("cset_rebuild_parallel", |b| {
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        b.iter(|| chooser.rebuild(n_workers, NUM_REGIONS))
    });

    c.bench_function("cset_build_serial_and_drain", |b| {
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        b.iter(|| {
            chooser.clear();
            for r in heap.iter() {
                if chooser.should_add(r) {
                    chooser.add_region(r);
                }
            }
            chooser.sort_regions();
            while chooser.pop().is_some() {}
        })
    });
}
