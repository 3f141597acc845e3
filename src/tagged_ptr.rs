//! Tagged words used to defeat the `ABA problem` on compare-and-swap.
//!
//! `TaggedPtr` packs a raw address and a 16 bit generation tag into one `u64`: the address lives
//! in the low 48 bits, the tag in the high 16. `TaggedIndex` does the same for an arena index and a
//! 32 bit generation, which does not rely on unused address bits at all.
//!
//! In both cases equality and CAS compare the whole word, so a change of either half is seen.
//! Generations wrap; after `2^16` (resp. `2^32`) reuses of one address a stale word can match
//! again. That is an accepted limitation.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

cfg_if! {
    if #[cfg(not(target_has_atomic = "64"))] {
        compile_error!("tagged words need lock-free 64 bit atomics on this target");
    }
}

const TAG_SHIFT: u32 = 48;
const MASK_PTR: u64 = (1u64 << TAG_SHIFT) - 1;

/// An address bundled with a generation tag.
pub struct TaggedPtr<T> {
    value: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> TaggedPtr<T> {
    #[inline]
    pub fn new(ptr: *mut T, tag: u16) -> Self {
        let addr = ptr as usize as u64;
        debug_assert_eq!(addr & !MASK_PTR, 0, "address uses the tag bits");
        TaggedPtr::from_raw(((tag as u64) << TAG_SHIFT) | (addr & MASK_PTR))
    }

    #[inline]
    pub fn null() -> Self {
        TaggedPtr::from_raw(0)
    }

    #[inline]
    fn from_raw(value: u64) -> Self {
        TaggedPtr {
            value,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn into_raw(self) -> u64 {
        self.value
    }

    #[inline]
    pub fn ptr(&self) -> *mut T {
        (self.value & MASK_PTR) as usize as *mut T
    }

    #[inline]
    pub fn tag(&self) -> u16 {
        (self.value >> TAG_SHIFT) as u16
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr().is_null()
    }

    /// Same address, different generation.
    #[inline]
    pub fn with_tag(&self, tag: u16) -> Self {
        TaggedPtr::new(self.ptr(), tag)
    }

    /// Same address, generation bumped by one (wrapping).
    #[inline]
    pub fn next_tag(&self) -> Self {
        self.with_tag(self.tag().wrapping_add(1))
    }
}

impl<T> Clone for TaggedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPtr<T> {}

impl<T> PartialEq for TaggedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> fmt::Debug for TaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, tag={})", self.ptr(), self.tag())
    }
}

/// Atomic cell holding a `TaggedPtr`.
pub struct AtomicTaggedPtr<T> {
    inner: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// same as `AtomicPtr`: the cell only moves addresses, owning the pointee is up to the user
unsafe impl<T> Send for AtomicTaggedPtr<T> {}
unsafe impl<T> Sync for AtomicTaggedPtr<T> {}

impl<T> Default for AtomicTaggedPtr<T> {
    fn default() -> Self {
        AtomicTaggedPtr::new(TaggedPtr::null())
    }
}

impl<T> AtomicTaggedPtr<T> {
    pub fn new(v: TaggedPtr<T>) -> Self {
        AtomicTaggedPtr {
            inner: AtomicU64::new(v.into_raw()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<T> {
        TaggedPtr::from_raw(self.inner.load(order))
    }

    #[inline]
    pub fn store(&self, v: TaggedPtr<T>, order: Ordering) {
        self.inner.store(v.into_raw(), order)
    }

    #[inline]
    pub fn swap(&self, v: TaggedPtr<T>, order: Ordering) -> TaggedPtr<T> {
        TaggedPtr::from_raw(self.inner.swap(v.into_raw(), order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.inner
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(TaggedPtr::from_raw)
            .map_err(TaggedPtr::from_raw)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.inner
            .compare_exchange_weak(current.into_raw(), new.into_raw(), success, failure)
            .map(TaggedPtr::from_raw)
            .map_err(TaggedPtr::from_raw)
    }
}

const NULL_INDEX: u32 = u32::MAX;

/// Arena slot index bundled with the generation of the allocation it names.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaggedIndex {
    value: u64,
}

impl TaggedIndex {
    /// Largest usable index; `u32::MAX` is reserved for null.
    pub const MAX_INDEX: u32 = NULL_INDEX - 1;

    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        debug_assert!(index <= Self::MAX_INDEX);
        TaggedIndex {
            value: ((generation as u64) << 32) | index as u64,
        }
    }

    #[inline]
    pub fn null() -> Self {
        TaggedIndex {
            value: NULL_INDEX as u64,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.value as u32
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        (self.value >> 32) as u32
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.index() == NULL_INDEX
    }
}

impl fmt::Debug for TaggedIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "TaggedIndex(null, gen={})", self.generation())
        } else {
            write!(f, "TaggedIndex({}, gen={})", self.index(), self.generation())
        }
    }
}

/// Atomic cell holding a `TaggedIndex`.
pub struct AtomicTaggedIndex {
    inner: AtomicU64,
}

impl Default for AtomicTaggedIndex {
    fn default() -> Self {
        AtomicTaggedIndex::new(TaggedIndex::null())
    }
}

impl AtomicTaggedIndex {
    pub fn new(v: TaggedIndex) -> Self {
        AtomicTaggedIndex {
            inner: AtomicU64::new(v.value),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedIndex {
        TaggedIndex {
            value: self.inner.load(order),
        }
    }

    #[inline]
    pub fn store(&self, v: TaggedIndex, order: Ordering) {
        self.inner.store(v.value, order)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.inner
            .compare_exchange_weak(current.value, new.value, success, failure)
            .map(|value| TaggedIndex { value })
            .map_err(|value| TaggedIndex { value })
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.inner
            .compare_exchange(current.value, new.value, success, failure)
            .map(|value| TaggedIndex { value })
            .map_err(|value| TaggedIndex { value })
    }
}
