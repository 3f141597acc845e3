//! Bounded node storage with generation tagged slots.
//!
//! All nodes live in one pre-allocated array and are named by `TaggedIndex`. A slot is owned by
//! whoever flipped its `allocated` flag from false to true; every allocation bumps the slot's
//! generation, so an index kept from an older allocation never compares equal to the current one.
//! Slot memory is never returned to the system allocator while the pool lives, a stale reader can
//! only see stale data, which its tagged CAS then rejects.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::config::PoolConfig;
use crate::error::Status;
use crate::tagged_ptr::{AtomicTaggedIndex, TaggedIndex};
use crate::util::WrappedAlign64Type;

pub struct PoolSlot<T> {
    allocated: AtomicBool,
    generation: AtomicU32,
    next: AtomicTaggedIndex,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> PoolSlot<T> {
    fn new() -> Self {
        PoolSlot {
            allocated: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            next: AtomicTaggedIndex::default(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Link to the node below this one on a stack.
    #[inline]
    pub fn next(&self) -> &AtomicTaggedIndex {
        &self.next
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// Caller owns the slot and its value storage is empty.
    #[inline]
    pub unsafe fn write(&self, value: T) {
        (*self.value.get()).as_mut_ptr().write(value);
    }

    /// # Safety
    ///
    /// Caller owns the slot and a value was written and not taken yet.
    #[inline]
    pub unsafe fn take(&self) -> T {
        ptr::read((*self.value.get()).as_ptr())
    }
}

/// Fixed capacity array of node slots.
///
/// The pool never drops values; whoever writes a value into a slot must take it back out before
/// giving the slot back.
pub struct NodePool<T> {
    slots: Box<[PoolSlot<T>]>,
    cursor: WrappedAlign64Type<AtomicUsize>,
    allocated: AtomicUsize,
}

unsafe impl<T: Send> Send for NodePool<T> {}
unsafe impl<T: Send> Sync for NodePool<T> {}

impl<T> NodePool<T> {
    pub fn new(config: &PoolConfig) -> Result<Self, Status> {
        config.validate()?;
        let slots = (0..config.capacity)
            .map(|_| PoolSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(NodePool {
            slots,
            cursor: WrappedAlign64Type(AtomicUsize::new(0)),
            allocated: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently handed out.
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Claims a free slot, scanning at most `capacity` slots from a rotating start position.
    /// Returns `None` when a full scan found nothing.
    pub fn alloc(&self) -> Option<TaggedIndex> {
        let capacity = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % capacity;
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            let slot = &self.slots[index];
            if !slot.allocated.load(Ordering::Relaxed)
                && slot
                    .allocated
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
                slot.generation.store(generation, Ordering::Relaxed);
                self.allocated.fetch_add(1, Ordering::Relaxed);
                return Some(TaggedIndex::new(index as u32, generation));
            }
        }
        trace!("node pool full scan failed, capacity={}", capacity);
        None
    }

    /// Gives the slot back; the next `alloc` of it hands out a new generation.
    ///
    /// # Safety
    ///
    /// `node` must be allocated, owned by the caller and its value already taken.
    pub unsafe fn dealloc(&self, node: TaggedIndex) {
        let slot = self.slot(node);
        debug_assert!(slot.is_allocated());
        debug_assert_eq!(slot.generation(), node.generation());
        slot.allocated.store(false, Ordering::Release);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Slot named by `node`, whatever generation it currently holds.
    #[inline]
    pub fn slot(&self, node: TaggedIndex) -> &PoolSlot<T> {
        &self.slots[node.index() as usize]
    }
}
