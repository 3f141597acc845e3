//! Small shared helpers: thread ids, cache line padding, clock and spinning.

use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Process wide id of the current thread, assigned on first call and never reused.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1));
    THREAD_ID
        .try_with(|tid| {
            if -1 == tid.get() {
                tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            tid.get()
        })
        .unwrap_or_else(|_| GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Pads `T` to its own cache line so hot atomics of different owners do not false share.
#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for CAS retry loops.
///
/// Spins `2^step` times per call until `SPIN_LIMIT`, then yields the time slice.
pub struct Backoff {
    step: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    /// Back off after a lost CAS.
    #[inline]
    pub fn spin(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                pause();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem;

    #[test]
    fn test_thread_id_is_stable_and_unique() {
        let main_id = get_thread_id();
        assert_eq!(main_id, get_thread_id());
        let other = thread::spawn(get_thread_id).join().unwrap();
        assert_ne!(main_id, other);
    }

    #[test]
    fn test_align() {
        let w = WrappedAlign64Type(7u8);
        assert_eq!(mem::align_of_val(&w), 64);
        assert_eq!(&w as *const _ as usize % 64, 0);
        assert_eq!(*w, 7);
    }

    #[test]
    fn test_backoff_escalates() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step, 0);
        for _ in 0..=SPIN_LIMIT {
            backoff.spin();
        }
        assert!(backoff.step > SPIN_LIMIT);
        for _ in 0..YIELD_LIMIT * 2 {
            backoff.spin();
        }
        assert_eq!(backoff.step, YIELD_LIMIT + 1);
    }

    #[test]
    fn test_clock_moves_forward() {
        let a = get_cur_microseconds_time();
        thread::sleep(std::time::Duration::from_millis(2));
        assert!(get_cur_microseconds_time() > a);
    }
}
