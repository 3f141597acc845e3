extern crate core_affinity;
extern crate env_logger;
extern crate rs_lockstack;
#[macro_use]
extern crate log;

use rs_lockstack::config::{HazardConfig, Quarantine, StackConfig};
use rs_lockstack::stack::{self, ConcurrentStack};
use rs_lockstack::util;
use rs_lockstack::PushError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::thread;

const THREAD_COUNT: i64 = 32;
const CYCLES: i64 = 100_000;

#[repr(align(16))]
struct StackValue {
    value: i64,
}

/// Lock based baseline.
struct MutexStack<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Send> ConcurrentStack<T> for MutexStack<T> {
    fn try_push(&self, v: T) -> Result<(), PushError<T>> {
        match self.items.lock() {
            Ok(mut items) => {
                items.push(v);
                Ok(())
            }
            Err(poisoned) => {
                poisoned.into_inner().push(v);
                Ok(())
            }
        }
    }

    fn pop(&self) -> Option<T> {
        match self.items.lock() {
            Ok(mut items) => items.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }

    fn is_empty(&self) -> bool {
        match self.items.lock() {
            Ok(items) => items.is_empty(),
            Err(poisoned) => poisoned.into_inner().is_empty(),
        }
    }
}

struct GlobalControl {
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
}

fn set_cpu_affinity() {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if cpus.is_empty() {
            return;
        }
        core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
        debug!(
            "set_cpu_affinity {} {}",
            util::get_thread_id(),
            util::get_thread_id() as usize % cpus.len()
        );
    }
}

fn producer_thread(stack: &dyn ConcurrentStack<StackValue>, control: &GlobalControl) {
    set_cpu_affinity();
    for i in 0..CYCLES {
        let mut v = StackValue { value: i };
        loop {
            match stack.try_push(v) {
                Ok(()) => break,
                Err(e) => {
                    v = e.into_inner();
                    thread::yield_now();
                }
            }
        }
    }
    control.produced.fetch_add(CYCLES, Ordering::SeqCst);
}

fn consumer_thread(stack: &dyn ConcurrentStack<StackValue>, control: &GlobalControl) {
    set_cpu_affinity();
    let mut tol = 0;
    let mut tol_val = 0;
    while tol < CYCLES {
        match stack.pop() {
            Some(v) => {
                tol_val += v.value;
                tol += 1;
            }
            None => thread::yield_now(),
        }
    }
    control.consumed.fetch_add(tol, Ordering::SeqCst);
    control.tol_val.fetch_add(tol_val, Ordering::SeqCst);
}

fn run(name: &str, stack: &dyn ConcurrentStack<StackValue>) {
    let control = GlobalControl {
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    };
    let producer_count = THREAD_COUNT / 2;
    let begin = util::get_cur_microseconds_time();

    thread::scope(|s| {
        let mut pd = vec![];
        for t in 0..THREAD_COUNT {
            let control = &control;
            pd.push(s.spawn(move || {
                if t < producer_count {
                    producer_thread(stack, control);
                } else {
                    consumer_thread(stack, control);
                }
            }));
        }
        for t in pd {
            t.join().unwrap();
        }
    });

    let cost_us = (util::get_cur_microseconds_time() - begin).max(1);
    let produced = control.produced.load(Ordering::SeqCst);
    let consumed = control.consumed.load(Ordering::SeqCst);
    assert_eq!(produced, consumed);
    assert_eq!(
        control.tol_val.load(Ordering::SeqCst),
        producer_count * (CYCLES - 1) * CYCLES / 2
    );
    assert!(stack.is_empty());
    info!(
        "{}: {} ops in {} ms, {} ops/ms",
        name,
        produced + consumed,
        cost_us / 1000,
        (produced + consumed) * 1000 / cost_us
    );
}

fn main() {
    env_logger::init();

    info!(
        "thread_count {} cycles {} per thread",
        THREAD_COUNT, CYCLES
    );

    let schemes = vec![
        ("bounded", StackConfig::bounded(4096)),
        ("hazard_global", StackConfig::Hazard(HazardConfig::default())),
        (
            "hazard_thread_local",
            StackConfig::Hazard(HazardConfig::default().quarantine(Quarantine::ThreadLocal)),
        ),
    ];
    for (name, config) in schemes {
        let stack = stack::build::<StackValue>(config).unwrap();
        run(name, &*stack);
    }

    let baseline = MutexStack {
        items: Mutex::new(Vec::new()),
    };
    run("mutex", &baseline);
}
