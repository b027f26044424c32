use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tilefuse::cache::{CompiledProgram, ProgramCache};
use tilefuse::{GeneratorError, GeneratorResult};

fn program(signature: &str, handle: u64) -> GeneratorResult<CompiledProgram<u64>> {
    Ok(CompiledProgram {
        name: signature.replace(':', "_"),
        signature: signature.to_owned(),
        handle,
        kernels: Vec::new(),
    })
}

#[test]
fn concurrent_lookups_share_one_build() {
    let cache: ProgramCache<u64> = ProgramCache::new();
    let builds = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    let programs: Vec<Arc<CompiledProgram<u64>>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache.get_or_compile("va:f", || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        program("va:f", 7)
                    })
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .expect("worker panicked")
                    .expect("build succeeds")
            })
            .collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
    for shared in &programs {
        assert!(Arc::ptr_eq(shared, &programs[0]));
        assert_eq!(shared.handle, 7);
    }
}

#[test]
fn distinct_signatures_build_independently() {
    let cache: ProgramCache<u64> = ProgramCache::new();
    let builds = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    thread::scope(|scope| {
        let cache = &cache;
        let builds = &builds;
        let barrier = &barrier;
        for worker in 0..8usize {
            scope.spawn(move || {
                let signature = if worker % 2 == 0 { "va:even" } else { "sr:odd" };
                barrier.wait();
                let shared = cache
                    .get_or_compile(signature, || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        program(signature, worker as u64 % 2)
                    })
                    .expect("build succeeds");
                assert_eq!(shared.signature, signature);
            });
        }
    });

    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
}

#[test]
fn contended_failures_leave_the_gate_open() {
    let cache: ProgramCache<u64> = ProgramCache::new();
    let attempts = AtomicUsize::new(0);
    let barrier = Barrier::new(4);

    thread::scope(|scope| {
        let cache = &cache;
        let attempts = &attempts;
        let barrier = &barrier;
        for _ in 0..4 {
            scope.spawn(move || {
                barrier.wait();
                let result = cache.get_or_compile("vr:mv", || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(GeneratorError::unsupported("compiler rejected the source"))
                });
                assert!(result.is_err());
            });
        }
    });

    // Nothing was cached, so every waiter ran its own attempt after the gate
    // reopened.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(cache.is_empty());

    let rebuilt = cache
        .get_or_compile("vr:mv", || program("vr:mv", 11))
        .expect("later build succeeds");
    assert_eq!(rebuilt.handle, 11);
    assert_eq!(cache.len(), 1);
}
