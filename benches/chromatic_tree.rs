use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};

use chromatic::{CglChromaticTree, FglChromaticTree};

fn read_cgl(c: &mut Criterion) {
    let tree: CglChromaticTree<usize, usize> = CglChromaticTree::new(1024);
    for k in 0..1024 {
        assert!(tree.insert(k, k).is_ok());
    }
    c.bench_function("CglChromaticTree: read", |b| {
        b.iter(|| {
            tree.read(&512, |_, v| assert_eq!(*v, 512));
        })
    });
}

fn read_fgl(c: &mut Criterion) {
    let tree: FglChromaticTree<usize, usize> = FglChromaticTree::new(1024);
    for k in 0..1024 {
        assert!(tree.insert(k, k).is_ok());
    }
    c.bench_function("FglChromaticTree: read", |b| {
        b.iter(|| {
            tree.read(&512, |_, v| assert_eq!(*v, 512));
        })
    });
}

fn insert_remove_cgl(c: &mut Criterion) {
    c.bench_function("CglChromaticTree: insert-remove", |b| {
        b.iter_custom(|iters| {
            let tree: CglChromaticTree<u64, u64> = CglChromaticTree::new(iters as usize);
            let start = Instant::now();
            for i in 0..iters {
                assert!(tree.insert(i, i).is_ok());
            }
            for i in 0..iters {
                assert!(tree.remove(&i).is_ok());
            }
            start.elapsed()
        })
    });
}

fn insert_remove_fgl(c: &mut Criterion) {
    c.bench_function("FglChromaticTree: insert-remove", |b| {
        b.iter_custom(|iters| {
            // Unlinked nodes may outlive an iteration until they are reclaimed.
            let tree: FglChromaticTree<u64, u64> = FglChromaticTree::new(iters as usize * 4);
            let start = Instant::now();
            for i in 0..iters {
                let _result = tree.insert(i, i);
            }
            for i in 0..iters {
                let _result = tree.remove(&i);
            }
            start.elapsed()
        })
    });
}

criterion_group!(
    chromatic_tree,
    read_cgl,
    read_fgl,
    insert_remove_cgl,
    insert_remove_fgl
);
criterion_main!(chromatic_tree);
