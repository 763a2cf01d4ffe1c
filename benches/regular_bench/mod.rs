use criterion::Criterion;

pub mod cset;
pub mod metaspace;

pub fn bench(c: &mut Criterion) {
    metaspace::bench(c);
    cset::bench(c);
}
