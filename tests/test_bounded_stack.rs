extern crate core_affinity;
extern crate env_logger;
extern crate rs_lockstack;

use rs_lockstack::bounded_stack::BoundedStack;
use rs_lockstack::util;
use rs_lockstack::Status;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct Counted {
    cnt: Arc<AtomicI64>,
    v: i64,
}

impl Counted {
    fn new(cnt: &Arc<AtomicI64>, v: i64) -> Counted {
        cnt.fetch_add(1, Ordering::SeqCst);
        Counted { cnt: cnt.clone(), v }
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.cnt.fetch_sub(1, Ordering::SeqCst);
    }
}

fn set_cpu_affinity() {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
        }
    }
}

#[test]
fn test_exhaustion_and_recovery() {
    let capacity = 16;
    let stack = BoundedStack::with_capacity(capacity).unwrap();
    for i in 0..capacity {
        assert!(stack.try_push(i).is_ok());
    }
    let err = stack.try_push(capacity).unwrap_err();
    assert_eq!(err.status, Status::PoolExhausted);
    assert_eq!(err.into_inner(), capacity);
    assert_eq!(stack.len(), capacity);

    assert_eq!(stack.pop(), Some(capacity - 1));
    assert!(stack.try_push(100).is_ok());
    assert_eq!(stack.pop(), Some(100));
}

#[test]
fn test_concurrent_pushes_respect_capacity() {
    let _ = env_logger::try_init();
    let capacity = 64;
    let threads = 8;
    let stack = BoundedStack::with_capacity(capacity).unwrap();
    let accepted = AtomicUsize::new(0);
    let start = Barrier::new(threads);

    thread::scope(|s| {
        let mut pd = vec![];
        for t in 0..threads {
            let (stack, accepted, start) = (&stack, &accepted, &start);
            pd.push(s.spawn(move || {
                set_cpu_affinity();
                start.wait();
                for i in 0..capacity {
                    if stack.push(t * capacity + i) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for t in pd {
            t.join().unwrap();
        }
    });

    assert_eq!(accepted.load(Ordering::SeqCst), capacity);
    let mut popped = 0;
    while stack.pop().is_some() {
        popped += 1;
    }
    assert_eq!(popped, capacity);
    assert!(stack.is_empty());
    assert_eq!(stack.len(), 0);
}

#[test]
fn test_multi_thread_recycling() {
    let _ = env_logger::try_init();
    // a small pool forces slots to be recycled while other threads still hold old head words
    let capacity = 8;
    let producers = 4;
    let consumers = 4;
    let loops: i64 = 20_000;

    let cnt = Arc::new(AtomicI64::new(0));
    let stack = BoundedStack::with_capacity(capacity).unwrap();
    let producers_left = AtomicUsize::new(producers);
    let sum = AtomicI64::new(0);
    let popped = AtomicI64::new(0);
    let begin = util::get_cur_microseconds_time();

    thread::scope(|s| {
        let mut pd = vec![];
        for _ in 0..producers {
            let (stack, cnt, producers_left) = (&stack, &cnt, &producers_left);
            pd.push(s.spawn(move || {
                set_cpu_affinity();
                for i in 0..loops {
                    let mut v = Counted::new(cnt, i);
                    loop {
                        match stack.try_push(v) {
                            Ok(()) => break,
                            Err(e) => {
                                assert_eq!(e.status, Status::PoolExhausted);
                                v = e.into_inner();
                                thread::yield_now();
                            }
                        }
                    }
                }
                producers_left.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for _ in 0..consumers {
            let (stack, producers_left, sum, popped) = (&stack, &producers_left, &sum, &popped);
            pd.push(s.spawn(move || {
                set_cpu_affinity();
                let (mut local_sum, mut local_cnt) = (0, 0);
                loop {
                    match stack.pop() {
                        Some(c) => {
                            local_sum += c.v;
                            local_cnt += 1;
                        }
                        None => {
                            if producers_left.load(Ordering::SeqCst) == 0 && stack.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                sum.fetch_add(local_sum, Ordering::SeqCst);
                popped.fetch_add(local_cnt, Ordering::SeqCst);
            }));
        }
        for t in pd {
            t.join().unwrap();
        }
    });

    println!(
        "bounded stack recycled {} slots {} times in {}us",
        capacity,
        popped.load(Ordering::SeqCst),
        util::get_cur_microseconds_time() - begin
    );
    assert_eq!(popped.load(Ordering::SeqCst), producers as i64 * loops);
    assert_eq!(
        sum.load(Ordering::SeqCst),
        producers as i64 * (loops - 1) * loops / 2
    );
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    assert_eq!(stack.len(), 0);
}

#[test]
fn test_drop_releases_values() {
    let cnt = Arc::new(AtomicI64::new(0));
    let stack = BoundedStack::with_capacity(32).unwrap();
    for i in 0..32 {
        assert!(stack.push(Counted::new(&cnt, i)));
    }
    assert!(!stack.push(Counted::new(&cnt, 32)));
    assert_eq!(cnt.load(Ordering::SeqCst), 32);
    drop(stack);
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
}
