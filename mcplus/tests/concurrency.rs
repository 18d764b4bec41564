mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use common::{ops, toy_builder};
use crossbeam::thread;
use mcinst::Inst;
use mcplus::FIRST_GENERIC_INDEX;

#[derive(Debug)]
struct Tracked(Arc<AtomicUsize>, usize);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn racing_registrations_agree_on_indices() {
    let mcb = toy_builder();
    let names: Vec<String> = (0..32).map(|i| format!("Pass{}", i)).collect();

    let seen: Vec<Vec<u8>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mcb = &mcb;
                let names = &names;
                s.spawn(move |_| {
                    names
                        .iter()
                        .map(|name| mcb.registry().index_or_create(name).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    for indices in &seen[1..] {
        assert_eq!(indices, &seen[0]);
    }
    let mut sorted = seen[0].clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len());
    assert!(sorted.iter().all(|&index| index >= FIRST_GENERIC_INDEX));
    assert_eq!(mcb.registry().generic_count(), names.len());
}

#[test]
fn allocators_are_isolated_between_threads() {
    let mcb = toy_builder();
    let drops = Arc::new(AtomicUsize::new(0));
    let per_thread = 200;
    let threads = 6;

    thread::scope(|s| {
        for t in 0..threads {
            let mcb = &mcb;
            let drops = drops.clone();
            s.spawn(move |_| {
                let id = mcb.create_allocator();
                let nop = ops(mcb).nop;
                for round in 0..3 {
                    let mut insts: Vec<Inst> = (0..per_thread).map(|_| Inst::new(nop)).collect();
                    for (i, inst) in insts.iter_mut().enumerate() {
                        mcb.set_offset(inst, i as u32);
                        mcb.add_annotation(inst, "Tracked", Tracked(drops.clone(), t * 1000 + i), id);
                    }
                    for (i, inst) in insts.iter().enumerate() {
                        let value = mcb.with_annotation(inst, "Tracked", |v: &Tracked| v.1);
                        assert_eq!(value, Some(t * 1000 + i), "round {}", round);
                        assert_eq!(mcb.get_offset(inst), Some(i as u32));
                    }
                    mcb.free_allocator_values(id).unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), per_thread * threads * 3);
}
