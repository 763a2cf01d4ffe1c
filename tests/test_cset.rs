use mmtk_metaspace::cset::{CollectionSetChooser, HeapRegion};
use mmtk_metaspace::util::test_util::{chooser_options, panic_after, MockRegion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Get a deterministic seeded Rng.
fn get_rng() -> ChaCha8Rng {
    const SEED64: u64 = 0x4050cb1b5ab26c70;
    ChaCha8Rng::seed_from_u64(SEED64)
}

/// A heap of mixed region kinds with random liveness.
fn random_heap(n_regions: usize, region_bytes: usize) -> Vec<MockRegion> {
    let mut rng = get_rng();
    (0..n_regions as u32)
        .map(|index| {
            let live_bytes = rng.random_range(0..=region_bytes);
            let region = MockRegion::old(index, live_bytes, region_bytes - live_bytes);
            match rng.random_range(0..20) {
                0 => region.young(),
                1 => region.humongous(),
                2 => region.free(),
                3 => region.pinned(),
                4 => region.incomplete_rem_set(),
                5 => region.old_gc_alloc(),
                _ => region,
            }
        })
        .collect()
}

fn serial_candidates(heap: &[MockRegion], chooser: &CollectionSetChooser<MockRegion>) -> Vec<u32> {
    heap.iter()
        .filter(|r| chooser.should_add(r) && !r.is_old_gc_alloc_region())
        .map(|r| r.hrm_index())
        .collect()
}

#[test]
fn parallel_rebuild_matches_serial_selection() {
    let options = chooser_options();
    let heap = random_heap(1000, options.region_bytes);

    let mut serial = CollectionSetChooser::new(&heap, &options);
    let expected = serial_candidates(&heap, &serial);
    for index in expected.iter() {
        serial.add_region(&heap[*index as usize]);
    }
    serial.sort_regions();

    for n_workers in [1, 3, 8] {
        let mut parallel = CollectionSetChooser::new(&heap, &options);
        parallel.rebuild(n_workers, heap.len());
        parallel.verify();
        assert_eq!(parallel.remaining_regions(), serial.remaining_regions());
        assert_eq!(
            parallel.remaining_reclaimable_bytes(),
            serial.remaining_reclaimable_bytes()
        );

        // Ties may come in a different order, the reclaimable sequence may not.
        let mut serial_order = vec![];
        serial.iterate(|r| {
            serial_order.push(r.reclaimable_bytes());
            false
        });
        let mut parallel_order = vec![];
        let mut parallel_indices = vec![];
        parallel.iterate(|r| {
            parallel_order.push(r.reclaimable_bytes());
            parallel_indices.push(r.hrm_index());
            false
        });
        assert_eq!(parallel_order, serial_order);
        parallel_indices.sort_unstable();
        assert_eq!(parallel_indices, expected);
    }
}

#[test]
fn drain_conserves_reclaimable_bytes() {
    let options = chooser_options();
    let heap = random_heap(300, options.region_bytes);
    let mut chooser = CollectionSetChooser::new(&heap, &options);
    chooser.rebuild(options.threads, heap.len());

    let mut last = usize::MAX;
    let mut popped = 0;
    while !chooser.is_empty() {
        let before = chooser.remaining_reclaimable_bytes();
        let r = chooser.pop().unwrap();
        assert!(r.reclaimable_bytes() <= last);
        last = r.reclaimable_bytes();
        assert_eq!(chooser.remaining_reclaimable_bytes() + r.reclaimable_bytes(), before);
        popped += 1;
    }
    assert!(popped > 0);
    assert_eq!(chooser.remaining_reclaimable_bytes(), 0);
    chooser.verify();
}

#[test]
fn rebuild_twice() {
    let options = chooser_options();
    let heap = random_heap(200, options.region_bytes);
    let mut chooser = CollectionSetChooser::new(&heap, &options);
    chooser.rebuild(4, heap.len());
    let first = chooser.remaining_regions();
    chooser.pop();
    chooser.rebuild(2, heap.len());
    assert_eq!(chooser.remaining_regions(), first);
    chooser.verify();
}

#[test]
fn rebuild_does_not_hang() {
    panic_after(10_000, || {
        let options = chooser_options();
        let heap = random_heap(5000, options.region_bytes);
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        chooser.rebuild(16, heap.len());
        chooser.remaining_regions()
    });
}

#[test]
fn empty_heap() {
    let options = chooser_options();
    let heap: Vec<MockRegion> = vec![];
    let mut chooser = CollectionSetChooser::new(&heap, &options);
    chooser.rebuild(4, 0);
    assert!(chooser.is_empty());
    assert!(chooser.pop().is_none());
}
