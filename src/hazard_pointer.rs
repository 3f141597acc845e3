//! Hazard pointer registry.
//!
//! Every thread that dereferences shared nodes claims one slot of a fixed size table and publishes
//! in it the node it is about to read. A detached node may only be freed once no slot announces
//! it; until then it waits in the quarantine (see `free_list`).
//!
//! The slot claimed by a thread is remembered in a thread local lease, so the table is scanned
//! only on the first use of a registry by a thread. The lease gives the slot back when the thread
//! exits.

use std::cell::{RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::config::{HazardConfig, Quarantine};
use crate::error::Status;
use crate::free_list::{DeferredFreeList, LocalFreeList, Retired};
use crate::util::{self, WrappedAlign64Type};

const NO_OWNER: u64 = 0;

// retires between two looks at the clock for the interval drain
const CLOCK_CHECK_PERIOD: usize = 32;

struct HazardSlot {
    owner: AtomicU64,
    borrowed: AtomicBool,
    watched: AtomicPtr<u8>,
    retires: AtomicUsize,
    // only touched by the current owner, handed over through `owner`
    local: UnsafeCell<LocalFreeList>,
}

impl Default for HazardSlot {
    fn default() -> Self {
        HazardSlot {
            owner: AtomicU64::new(NO_OWNER),
            borrowed: AtomicBool::new(false),
            watched: AtomicPtr::new(ptr::null_mut()),
            retires: AtomicUsize::new(0),
            local: UnsafeCell::new(LocalFreeList::new()),
        }
    }
}

struct SlotLease {
    registry: Weak<HazardRegistry>,
    index: usize,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release_slot(self.index);
        }
    }
}

thread_local!(static SLOT_LEASES: RefCell<Vec<SlotLease>> = RefCell::new(Vec::new()));

/// Fixed size table of hazard slots plus the quarantine of nodes they may protect.
pub struct HazardRegistry {
    config: HazardConfig,
    drain_threshold: usize,
    slots: Box<[WrappedAlign64Type<HazardSlot>]>,
    global: DeferredFreeList,
    staged: WrappedAlign64Type<AtomicUsize>,
    reclaimed: AtomicUsize,
    drain_passes: AtomicUsize,
    registered: AtomicUsize,
    last_drain_us: AtomicI64,
}

unsafe impl Send for HazardRegistry {}
unsafe impl Sync for HazardRegistry {}

impl HazardRegistry {
    pub fn new(config: HazardConfig) -> Result<Arc<Self>, Status> {
        config.validate()?;
        let slots = (0..config.max_threads)
            .map(|_| WrappedAlign64Type::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Arc::new(HazardRegistry {
            drain_threshold: config.drain_threshold(),
            config,
            slots,
            global: DeferredFreeList::new(),
            staged: WrappedAlign64Type(AtomicUsize::new(0)),
            reclaimed: AtomicUsize::new(0),
            drain_passes: AtomicUsize::new(0),
            registered: AtomicUsize::new(0),
            last_drain_us: AtomicI64::new(util::get_cur_microseconds_time()),
        }))
    }

    pub fn config(&self) -> &HazardConfig {
        &self.config
    }

    pub fn max_threads(&self) -> usize {
        self.slots.len()
    }

    /// Threads currently owning a slot.
    pub fn registered_threads(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    /// Nodes waiting in quarantine, over all topologies and threads.
    pub fn staged_count(&self) -> usize {
        self.staged.load(Ordering::Relaxed)
    }

    /// Drain passes run so far, forced ones included.
    pub fn drain_passes(&self) -> usize {
        self.drain_passes.load(Ordering::Relaxed)
    }

    /// Nodes freed through this registry so far.
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the slot of the current thread, claiming one on first use.
    ///
    /// Fails with `ThreadNumOverflow` when every slot is owned by another live thread and with
    /// `Busy` when this thread already holds a handle of this registry.
    pub fn acquire_slot_for_current_thread(
        self: &Arc<Self>,
    ) -> Result<HazardSlotHandle<'_>, Status> {
        let leased = SLOT_LEASES.try_with(|leases| -> Result<usize, Status> {
            let mut leases = leases.borrow_mut();
            leases.retain(|lease| lease.registry.strong_count() > 0);
            if let Some(lease) = leases
                .iter()
                .find(|lease| ptr::eq(lease.registry.as_ptr(), Arc::as_ptr(self)))
            {
                return Ok(lease.index);
            }
            let index = self.claim_slot()?;
            leases.push(SlotLease {
                registry: Arc::downgrade(self),
                index,
            });
            Ok(index)
        });
        let index = match leased {
            Ok(ret) => ret?,
            Err(_) => {
                warn!("thread local storage destroyed, can not lease a hazard slot");
                return Err(Status::ThreadExiting);
            }
        };

        if self.slots[index].borrowed.swap(true, Ordering::Acquire) {
            warn!(
                "current thread has already borrowed its hazard slot, index={}",
                index
            );
            return Err(Status::Busy);
        }
        Ok(HazardSlotHandle {
            registry: self,
            index,
            _marker: PhantomData,
        })
    }

    fn claim_slot(&self) -> Result<usize, Status> {
        let tid = util::get_thread_id() as u64 + 1;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.owner.load(Ordering::Relaxed) == NO_OWNER
                && slot
                    .owner
                    .compare_exchange(NO_OWNER, tid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                self.registered.fetch_add(1, Ordering::Relaxed);
                debug!("hazard slot claimed, index={}, tid={}", index, tid - 1);
                return Ok(index);
            }
        }
        warn!(
            "hazard slot table is full, max_threads={}",
            self.slots.len()
        );
        Err(Status::ThreadNumOverflow)
    }

    fn release_slot(&self, index: usize) {
        let slot = &self.slots[index];
        slot.watched.store(ptr::null_mut(), Ordering::Release);
        slot.owner.store(NO_OWNER, Ordering::Release);
        self.registered.fetch_sub(1, Ordering::Relaxed);
        debug!("hazard slot released, index={}", index);
    }

    /// True if any slot currently announces `node`.
    pub fn is_watched<N>(&self, node: *const N) -> bool {
        if node.is_null() {
            return false;
        }
        let node = node as *mut u8;
        self.slots
            .iter()
            .any(|slot| slot.watched.load(Ordering::SeqCst) == node)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn local_list(&self, index: usize) -> &mut LocalFreeList {
        &mut *self.slots[index].local.get()
    }

    fn pending(&self, index: usize) -> usize {
        match self.config.quarantine {
            Quarantine::Global => self.global.len(),
            Quarantine::ThreadLocal => unsafe { self.local_list(index).len() },
        }
    }

    fn retire(&self, index: usize, retired: Retired) {
        if !self.is_watched(retired.as_ptr()) {
            unsafe {
                retired.reclaim();
            }
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!("node is still watched, staged, node={:?}", retired);
            // counted before it becomes visible to drainers
            self.staged.fetch_add(1, Ordering::Relaxed);
            match self.config.quarantine {
                Quarantine::Global => self.global.stage(retired),
                Quarantine::ThreadLocal => unsafe { self.local_list(index).stage(retired) },
            };
        }
        self.maybe_drain(index);
    }

    fn maybe_drain(&self, index: usize) {
        let retires = self.slots[index].retires.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = self.pending(index);
        if pending == 0 {
            return;
        }
        if pending >= self.drain_threshold {
            self.drain(index);
        } else if self.config.drain_interval_us > 0
            && retires % CLOCK_CHECK_PERIOD == 0
            && util::get_cur_microseconds_time() - self.last_drain_us.load(Ordering::Relaxed)
                >= self.config.drain_interval_us
        {
            self.drain(index);
        }
    }

    fn drain(&self, index: usize) -> usize {
        let reclaimable = match self.config.quarantine {
            Quarantine::Global => self.global.drain(|node| self.is_watched(node)),
            Quarantine::ThreadLocal => unsafe {
                self.local_list(index).drain(|node| self.is_watched(node))
            },
        };
        let count = reclaimable.len();
        for retired in reclaimable {
            unsafe {
                retired.reclaim();
            }
        }
        self.staged.fetch_sub(count, Ordering::Relaxed);
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
        self.drain_passes.fetch_add(1, Ordering::Relaxed);
        self.last_drain_us
            .store(util::get_cur_microseconds_time(), Ordering::Relaxed);
        debug!(
            "hazard drain done, reclaimed={}, still_staged={}",
            count,
            self.staged_count()
        );
        count
    }
}

/// Exclusive access of the current thread to its hazard slot.
///
/// Dropping the handle retracts any announcement; the slot itself stays leased to the thread.
pub struct HazardSlotHandle<'a> {
    registry: &'a HazardRegistry,
    index: usize,
    _marker: PhantomData<*mut ()>,
}

impl<'a> HazardSlotHandle<'a> {
    #[inline]
    fn slot(&self) -> &HazardSlot {
        &self.registry.slots[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Announces `node` as being read by this thread.
    #[inline]
    pub fn announce<N>(&self, node: *mut N) {
        self.slot().watched.store(node as *mut u8, Ordering::SeqCst);
    }

    /// Announces the current value of `src` and returns it once a reload confirms it did not
    /// change in between. The returned node can not be reclaimed until `retract`.
    pub fn protect<N>(&self, src: &AtomicPtr<N>) -> *mut N {
        let mut curr = src.load(Ordering::Acquire);
        loop {
            self.announce(curr);
            let reloaded = src.load(Ordering::SeqCst);
            if reloaded == curr {
                return curr;
            }
            curr = reloaded;
        }
    }

    #[inline]
    pub fn retract(&self) {
        self.slot().watched.store(ptr::null_mut(), Ordering::Release);
    }

    /// Frees `node` now if nobody watches it, otherwise quarantines it. May trigger a drain pass.
    ///
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw`, be unreachable from shared state and be retired
    /// once. Its `Drop` runs on whichever thread ends up reclaiming it.
    pub unsafe fn retire<N>(&mut self, node: *mut N) {
        self.registry.retire(self.index, Retired::new(node));
    }

    /// Forced drain pass, returns how many nodes were freed.
    pub fn drain(&mut self) -> usize {
        self.registry.drain(self.index)
    }
}

impl<'a> Drop for HazardSlotHandle<'a> {
    fn drop(&mut self) {
        self.retract();
        self.slot().borrowed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked {
        v: u64,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry(max_threads: usize) -> Arc<HazardRegistry> {
        HazardRegistry::new(
            HazardConfig::default()
                .max_threads(max_threads)
                .drain_interval_us(0),
        )
        .unwrap()
    }

    #[test]
    fn test_slot_is_reused_by_same_thread() {
        let r = registry(4);
        let first = r.acquire_slot_for_current_thread().unwrap().index();
        let second = r.acquire_slot_for_current_thread().unwrap().index();
        assert_eq!(first, second);
        assert_eq!(r.registered_threads(), 1);
    }

    #[test]
    fn test_busy_while_handle_alive() {
        let r = registry(4);
        let handle = r.acquire_slot_for_current_thread().unwrap();
        assert_eq!(
            r.acquire_slot_for_current_thread().err(),
            Some(Status::Busy)
        );
        drop(handle);
        assert!(r.acquire_slot_for_current_thread().is_ok());
    }

    #[test]
    fn test_overflow_and_release_on_thread_exit() {
        let r = registry(1);
        let r2 = r.clone();
        thread::spawn(move || {
            assert!(r2.acquire_slot_for_current_thread().is_ok());
        })
        .join()
        .unwrap();
        // the exited thread gave its slot back
        assert_eq!(r.registered_threads(), 0);
        let handle = r.acquire_slot_for_current_thread().unwrap();

        let r3 = r.clone();
        let err = thread::spawn(move || r3.acquire_slot_for_current_thread().err())
            .join()
            .unwrap();
        assert_eq!(err, Some(Status::ThreadNumOverflow));
        drop(handle);
    }

    #[test]
    fn test_protect_and_retract() {
        let r = registry(2);
        let node = Box::into_raw(Box::new(Tracked { v: 1 }));
        let src = AtomicPtr::new(node);
        let handle = r.acquire_slot_for_current_thread().unwrap();
        assert_eq!(handle.protect(&src), node);
        assert!(r.is_watched(node));
        assert_eq!(unsafe { (*node).v }, 1);
        handle.retract();
        assert!(!r.is_watched(node));
        assert!(!r.is_watched(ptr::null::<Tracked>()));
        drop(unsafe { Box::from_raw(node) });
    }

    #[test]
    fn test_watched_node_waits_in_quarantine() {
        for quarantine in [Quarantine::Global, Quarantine::ThreadLocal] {
            let r = HazardRegistry::new(
                HazardConfig::default()
                    .quarantine(quarantine)
                    .drain_interval_us(0),
            )
            .unwrap();
            let node = Box::into_raw(Box::new(Tracked { v: 7 }));
            let mut handle = r.acquire_slot_for_current_thread().unwrap();
            handle.announce(node);

            let before = DROPPED.load(Ordering::SeqCst);
            unsafe { handle.retire(node) };
            assert_eq!(r.staged_count(), 1);
            assert_eq!(handle.drain(), 0);
            assert_eq!(r.staged_count(), 1);

            handle.retract();
            assert_eq!(handle.drain(), 1);
            assert_eq!(r.staged_count(), 0);
            assert_eq!(r.reclaimed_count(), 1);
            assert!(DROPPED.load(Ordering::SeqCst) > before);
        }
    }

    #[test]
    fn test_unwatched_node_reclaimed_at_once() {
        let r = registry(2);
        let mut handle = r.acquire_slot_for_current_thread().unwrap();
        let node = Box::into_raw(Box::new(Tracked { v: 3 }));
        unsafe { handle.retire(node) };
        assert_eq!(r.staged_count(), 0);
        assert_eq!(r.reclaimed_count(), 1);
    }

    #[test]
    fn test_registry_drop_reclaims_quarantine() {
        let r = HazardRegistry::new(
            HazardConfig::default()
                .max_threads(2)
                .cleanup_threshold(64)
                .drain_interval_us(0),
        )
        .unwrap();
        {
            let mut handle = r.acquire_slot_for_current_thread().unwrap();
            for v in 0..8 {
                let node = Box::into_raw(Box::new(Tracked { v }));
                handle.announce(node);
                unsafe { handle.retire(node) };
            }
            assert_eq!(r.staged_count(), 8);
            handle.retract();
        }
        let before = DROPPED.load(Ordering::SeqCst);
        drop(r);
        assert!(DROPPED.load(Ordering::SeqCst) >= before + 8);
    }

    #[test]
    fn test_interval_drain_checks_clock_periodically() {
        let r = HazardRegistry::new(
            HazardConfig::default()
                .max_threads(2)
                .cleanup_threshold(1_000)
                .drain_interval_us(1),
        )
        .unwrap();
        let mut handle = r.acquire_slot_for_current_thread().unwrap();
        let watched = Box::into_raw(Box::new(Tracked { v: 1 }));
        handle.announce(watched);
        unsafe { handle.retire(watched) };
        handle.retract();
        assert_eq!(r.staged_count(), 1);
        thread::sleep(std::time::Duration::from_millis(2));

        // the first retire was number one, the clock is looked at on number CLOCK_CHECK_PERIOD
        for v in 2..CLOCK_CHECK_PERIOD as u64 {
            unsafe { handle.retire(Box::into_raw(Box::new(Tracked { v }))) };
        }
        assert_eq!(r.staged_count(), 1);
        assert_eq!(r.drain_passes(), 0);

        unsafe { handle.retire(Box::into_raw(Box::new(Tracked { v: 0 }))) };
        assert_eq!(r.drain_passes(), 1);
        assert_eq!(r.staged_count(), 0);
    }
}
