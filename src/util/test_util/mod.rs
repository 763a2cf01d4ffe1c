//! Fixtures shared by the unit tests, the integration tests and the benchmarks.

use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::cset::HeapRegion;
use crate::metaspace::MetaspaceContext;
use crate::util::logger;
use crate::util::options::Options;

/// Options with tiny chunk sizes so that tests can reason about exact layouts.
///
/// Both metadata types use 40/160/640 word chunks. Non-class nodes are 2560 words
/// (four medium chunks), the non-class space may reserve 10240 words, the class space is
/// a single 2560 word node, and nodes are committed one medium chunk at a time.
pub fn small_chunk_options() -> Options {
    let mut options = Options::default();
    options.verify_metaspace = true;
    options.threads = 4;
    options.specialized_chunk_words = 40;
    options.small_chunk_words = 160;
    options.medium_chunk_words = 640;
    options.class_specialized_chunk_words = 40;
    options.class_small_chunk_words = 160;
    options.class_medium_chunk_words = 640;
    options.virtual_space_node_words = 2560;
    options.max_metaspace_words = 10240;
    options.class_space_words = 2560;
    options.commit_granule_words = 640;
    options.region_bytes = 1000;
    options
}

/// A verifying context built from [`small_chunk_options`].
pub fn small_chunk_context() -> MetaspaceContext {
    logger::init_for_test();
    MetaspaceContext::new(small_chunk_options())
}

/// Options for chooser tests: 1000 byte regions, so the live threshold is 850 bytes.
pub fn chooser_options() -> Options {
    logger::init_for_test();
    let mut options = small_chunk_options();
    options.mixed_gc_live_threshold_percent = 85;
    options
}

/// A heap region with fixed properties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockRegion {
    pub index: u32,
    pub live_bytes: usize,
    pub reclaimable_bytes: usize,
    pub pinned: bool,
    pub young: bool,
    pub old: bool,
    pub humongous: bool,
    pub free: bool,
    pub rem_set_complete: bool,
    pub old_gc_alloc: bool,
}

impl MockRegion {
    /// An old, unpinned region with a complete remembered set.
    pub fn old(index: u32, live_bytes: usize, reclaimable_bytes: usize) -> Self {
        MockRegion {
            index,
            live_bytes,
            reclaimable_bytes,
            pinned: false,
            young: false,
            old: true,
            humongous: false,
            free: false,
            rem_set_complete: true,
            old_gc_alloc: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn young(mut self) -> Self {
        self.old = false;
        self.young = true;
        self
    }

    pub fn humongous(mut self) -> Self {
        self.old = false;
        self.humongous = true;
        self
    }

    pub fn free(mut self) -> Self {
        self.old = false;
        self.free = true;
        self
    }

    pub fn incomplete_rem_set(mut self) -> Self {
        self.rem_set_complete = false;
        self
    }

    pub fn old_gc_alloc(mut self) -> Self {
        self.old_gc_alloc = true;
        self
    }
}

impl HeapRegion for MockRegion {
    fn hrm_index(&self) -> u32 {
        self.index
    }
    fn live_bytes(&self) -> usize {
        self.live_bytes
    }
    fn reclaimable_bytes(&self) -> usize {
        self.reclaimable_bytes
    }
    fn is_pinned(&self) -> bool {
        self.pinned
    }
    fn is_young(&self) -> bool {
        self.young
    }
    fn is_old(&self) -> bool {
        self.old
    }
    fn is_humongous(&self) -> bool {
        self.humongous
    }
    fn is_free(&self) -> bool {
        self.free
    }
    fn rem_set_is_complete(&self) -> bool {
        self.rem_set_complete
    }
    fn is_old_gc_alloc_region(&self) -> bool {
        self.old_gc_alloc
    }
}

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

// A global lock to make tests serial.
static SERIAL_TEST_LOCK: Mutex<()> = Mutex::new(());

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}
