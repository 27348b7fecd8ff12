//! Multi-threaded integration tests.

use mempool::{allocate, deallocate, ALIGNMENT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

/// Ten threads cycling through the small classes, randomly releasing about
/// a quarter of their blocks as they go, then releasing the rest.
#[test]
fn test_many_threads_cycling_sizes() {
    const THREADS: usize = 10;
    const ALLOCS_PER_THREAD: usize = 10_000;
    const SIZES: [usize; 6] = [8, 16, 32, 64, 128, 256];

    static BALANCE: AtomicUsize = AtomicUsize::new(0);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + t as u64);
                let mut held: Vec<(usize, usize)> = Vec::new();

                for i in 0..ALLOCS_PER_THREAD {
                    let size = SIZES[i % SIZES.len()];
                    let p = allocate(size);
                    assert!(!p.is_null());
                    assert_eq!(p as usize % ALIGNMENT, 0);
                    BALANCE.fetch_add(1, Ordering::Relaxed);
                    held.push((p as usize, size));

                    if rng.gen_ratio(1, 4) {
                        let idx = rng.gen_range(0..held.len());
                        let (addr, size) = held.swap_remove(idx);
                        unsafe { deallocate(addr as *mut u8, size) };
                        BALANCE.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                for (addr, size) in held {
                    unsafe { deallocate(addr as *mut u8, size) };
                    BALANCE.fetch_sub(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(BALANCE.load(Ordering::Relaxed), 0);
}

/// Concurrent allocations never alias.
#[test]
fn test_no_aliasing_across_threads() {
    const THREADS: usize = 4;
    const COUNT: usize = 2000;
    const SIZE: usize = 64;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            std::thread::spawn(move || {
                let mut addrs = Vec::with_capacity(COUNT);
                for _ in 0..COUNT {
                    let p = allocate(SIZE);
                    assert!(!p.is_null());
                    unsafe { p.write_bytes(t as u8, SIZE) };
                    addrs.push(p as usize);
                }
                // Every block still carries this thread's fill.
                for &addr in &addrs {
                    let p = addr as *mut u8;
                    unsafe {
                        assert_eq!(p.read(), t as u8);
                        assert_eq!(p.add(SIZE - 1).read(), t as u8);
                    }
                }
                addrs
            })
        })
        .collect();

    let mut all: Vec<usize> = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0] + SIZE <= pair[1], "concurrent blocks overlap");
    }
    for addr in all {
        unsafe { deallocate(addr as *mut u8, SIZE) };
    }
}

/// Allocate on producer threads, release on the consumer.
#[test]
fn test_cross_thread_free() {
    const PRODUCERS: usize = 4;
    const ITEMS_PER_PRODUCER: usize = 500;
    const SIZE: usize = 64;

    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|t| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let items: Vec<usize> = (0..ITEMS_PER_PRODUCER)
                    .map(|i| {
                        let p = allocate(SIZE);
                        assert!(!p.is_null());
                        unsafe { p.write_bytes((t * 37 + i) as u8, SIZE) };
                        p as usize
                    })
                    .collect();
                tx.send(items).unwrap();
            })
        })
        .collect();

    drop(tx);

    let mut total = 0;
    for items in rx {
        total += items.len();
        for addr in items {
            unsafe { deallocate(addr as *mut u8, SIZE) };
        }
    }

    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(total, PRODUCERS * ITEMS_PER_PRODUCER);
}

/// Random sizes, random interleaving, then a reconciliation pass. The
/// balance must return to zero and total mapped memory must stay bounded.
#[test]
fn test_stress_random_sizes() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 10_000;

    static BALANCE: AtomicUsize = AtomicUsize::new(0);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xDEAD_BEEF ^ t as u64);
                let mut held: Vec<(usize, usize)> = Vec::new();

                for _ in 0..ITERATIONS {
                    // Sizes 8..=8192 in steps of 8.
                    let size = rng.gen_range(1..=1024) * 8;
                    let p = allocate(size);
                    assert!(!p.is_null());
                    unsafe {
                        p.write(0xEE);
                        p.add(size - 1).write(0xEE);
                    }
                    BALANCE.fetch_add(1, Ordering::Relaxed);
                    held.push((p as usize, size));

                    if !held.is_empty() && rng.gen_bool(0.5) {
                        let idx = rng.gen_range(0..held.len());
                        let (addr, size) = held.swap_remove(idx);
                        unsafe { deallocate(addr as *mut u8, size) };
                        BALANCE.fetch_sub(1, Ordering::Relaxed);
                    }
                }

                // Reconciliation: free everything still held.
                for (addr, size) in held {
                    unsafe { deallocate(addr as *mut u8, size) };
                    BALANCE.fetch_sub(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(BALANCE.load(Ordering::Relaxed), 0);

    // Peak live memory is ~ THREADS * ITERATIONS/2 * mean size; the pool may
    // over-retain by batches and spans but not unboundedly.
    assert!(mempool::allocator::mapped_bytes() < 2 << 30);
}
