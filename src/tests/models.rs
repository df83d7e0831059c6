use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use loom::model::Builder;
use loom::thread::{spawn, yield_now};
use sdd::Guard;

use crate::FglChromaticTree;

#[derive(Debug)]
struct A(usize, Arc<AtomicUsize>);
impl A {
    fn new(d: usize, c: Arc<AtomicUsize>) -> Self {
        c.fetch_add(1, Relaxed);
        Self(d, c)
    }
}
impl Clone for A {
    fn clone(&self) -> Self {
        self.1.fetch_add(1, Relaxed);
        Self(self.0, self.1.clone())
    }
}
impl Drop for A {
    fn drop(&mut self) {
        self.1.fetch_sub(1, Relaxed);
    }
}

static SERIALIZER: Mutex<()> = Mutex::new(());

fn wait_for_garbage(cnt: &AtomicUsize) {
    while cnt.load(Relaxed) != 0 {
        Guard::new().accelerate();
        yield_now();
    }
}

// Checks if a key stays visible while another thread restructures the tree around it.
#[test]
fn chromatic_tree_key_visibility() {
    let _guard = SERIALIZER.lock().unwrap();

    for max_key in 1..4 {
        let mut model_builder = Builder::new();
        model_builder.max_threads = 2;
        model_builder.max_branches = 1_048_576;
        model_builder.check(move || {
            let cnt = Arc::new(AtomicUsize::new(0));
            let tree: Arc<FglChromaticTree<usize, A>> = Arc::new(FglChromaticTree::new(8));
            for k in 0..max_key {
                assert!(tree.insert(k, A::new(k, cnt.clone())).is_ok());
            }
            let tree_clone = tree.clone();
            let cnt_clone = cnt.clone();
            let thread_insert = spawn(move || {
                assert!(tree_clone
                    .insert(usize::MAX, A::new(usize::MAX, cnt_clone))
                    .is_ok());
                assert!(tree_clone.contains(&0));
            });
            for k in 0..max_key {
                assert_eq!(tree.read(&k, |_, v| v.0), Some(k));
            }
            assert!(thread_insert.join().is_ok());
            assert!(tree.contains(&usize::MAX));
            assert!(tree.is_balanced());
            drop(tree);
            wait_for_garbage(&cnt);
        });
    }
}

// Checks that concurrent updates on neighbouring keys are all applied.
#[test]
fn chromatic_tree_concurrent_updates() {
    let _guard = SERIALIZER.lock().unwrap();

    let mut model_builder = Builder::new();
    model_builder.max_threads = 2;
    model_builder.max_branches = 1_048_576;
    model_builder.check(|| {
        let cnt = Arc::new(AtomicUsize::new(0));
        let tree: Arc<FglChromaticTree<usize, A>> = Arc::new(FglChromaticTree::new(8));
        assert!(tree.insert(1, A::new(1, cnt.clone())).is_ok());
        assert!(tree.insert(2, A::new(2, cnt.clone())).is_ok());
        let tree_clone = tree.clone();
        let thread_remove = spawn(move || {
            assert_eq!(tree_clone.remove(&1).ok().flatten().map(|a| a.0), Some(1));
        });
        assert!(tree.insert(3, A::new(3, cnt.clone())).is_ok());
        assert!(thread_remove.join().is_ok());
        assert!(!tree.contains(&1));
        assert!(tree.contains(&2));
        assert!(tree.contains(&3));
        assert_eq!(tree.len(), 2);
        drop(tree);
        wait_for_garbage(&cnt);
    });
}
