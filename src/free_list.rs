//! Quarantine for nodes detached from a stack that may still be observed by other threads.
//!
//! A detached node is wrapped into a `Retired` entry, which erases its type but remembers how to
//! free it. Entries are staged either in the global `DeferredFreeList`, a lock-free singly linked
//! list shared by all threads, or in a `LocalFreeList`, a plain vector only its owner touches.
//! `drain` takes the current content, puts back what the predicate still reports as watched and
//! returns the rest to the caller, who reclaims it.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};

/// A detached node waiting for reclamation.
pub struct Retired {
    ptr: *mut u8,
    reclaim: unsafe fn(*mut u8),
}

// a retired node is exclusively owned by the quarantine, whoever drains it frees it
unsafe impl Send for Retired {}

unsafe fn reclaim_boxed<N>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut N));
}

impl Retired {
    /// # Safety
    ///
    /// `ptr` must come from `Box::<N>::into_raw`, be unreachable from any shared structure and
    /// be retired only once.
    pub unsafe fn new<N>(ptr: *mut N) -> Retired {
        Retired {
            ptr: ptr as *mut u8,
            reclaim: reclaim_boxed::<N>,
        }
    }

    /// Address used for hazard comparisons.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// # Safety
    ///
    /// No thread may still dereference the node.
    pub unsafe fn reclaim(self) {
        (self.reclaim)(self.ptr)
    }
}

impl fmt::Debug for Retired {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Retired({:p})", self.ptr)
    }
}

struct StagedNode {
    retired: Retired,
    next: TaggedPtr<StagedNode>,
}

/// Global lock-free staging list.
pub struct DeferredFreeList {
    top: AtomicTaggedPtr<StagedNode>,
    len: AtomicUsize,
    stage_counter: AtomicU16,
}

impl Default for DeferredFreeList {
    fn default() -> Self {
        DeferredFreeList::new()
    }
}

impl DeferredFreeList {
    pub fn new() -> Self {
        DeferredFreeList {
            top: AtomicTaggedPtr::default(),
            len: AtomicUsize::new(0),
            stage_counter: AtomicU16::new(0),
        }
    }

    /// Number of staged entries. Exact only when nobody stages or drains concurrently, otherwise
    /// it may count entries still being linked in.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// Stage one entry, returns the staged count right after.
    pub fn stage(&self, retired: Retired) -> usize {
        let node = Box::into_raw(Box::new(StagedNode {
            retired,
            next: TaggedPtr::null(),
        }));
        let head = TaggedPtr::new(node, self.next_tag());
        // counted before a drainer can see it, so `len` never wraps
        let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        unsafe {
            self.push_chain(head, node);
        }
        len
    }

    #[inline]
    fn next_tag(&self) -> u16 {
        self.stage_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Links `head ..= tail` in front of the current list.
    unsafe fn push_chain(&self, head: TaggedPtr<StagedNode>, tail: *mut StagedNode) {
        let mut curr = self.top.load(Ordering::Relaxed);
        loop {
            (*tail).next = curr;
            match self
                .top
                .compare_exchange_weak(curr, head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => curr = actual,
            }
        }
    }

    /// Take the whole list, keep what `is_watched` still reports, return the rest.
    pub fn drain<F>(&self, mut is_watched: F) -> Vec<Retired>
    where
        F: FnMut(*mut u8) -> bool,
    {
        let mut iter = self.top.swap(TaggedPtr::null(), Ordering::Acquire);
        let mut reclaimable = Vec::new();
        let mut kept_head = TaggedPtr::<StagedNode>::null();
        let mut kept_tail = ptr::null_mut::<StagedNode>();
        while !iter.is_null() {
            let node = iter.ptr();
            unsafe {
                let next = (*node).next;
                if is_watched((*node).retired.as_ptr()) {
                    (*node).next = kept_head;
                    if kept_tail.is_null() {
                        kept_tail = node;
                    }
                    kept_head = iter;
                } else {
                    let staged = Box::from_raw(node);
                    reclaimable.push(staged.retired);
                }
                iter = next;
            }
        }
        if !kept_head.is_null() {
            unsafe {
                self.push_chain(kept_head.with_tag(self.next_tag()), kept_tail);
            }
        }
        self.len.fetch_sub(reclaimable.len(), Ordering::Relaxed);
        reclaimable
    }

    /// Take everything regardless of hazards. Only sound once no thread can observe the nodes.
    pub fn take_all(&mut self) -> Vec<Retired> {
        self.drain(|_| false)
    }
}

impl Drop for DeferredFreeList {
    fn drop(&mut self) {
        for retired in self.take_all() {
            unsafe { retired.reclaim() }
        }
    }
}

/// Staging vector owned by a single thread.
#[derive(Default)]
pub struct LocalFreeList {
    list: Vec<Retired>,
}

impl LocalFreeList {
    pub fn new() -> Self {
        LocalFreeList { list: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn stage(&mut self, retired: Retired) -> usize {
        self.list.push(retired);
        self.list.len()
    }

    pub fn drain<F>(&mut self, mut is_watched: F) -> Vec<Retired>
    where
        F: FnMut(*mut u8) -> bool,
    {
        let mut kept = Vec::with_capacity(self.list.len());
        let mut reclaimable = Vec::new();
        for retired in self.list.drain(..) {
            if is_watched(retired.as_ptr()) {
                kept.push(retired);
            } else {
                reclaimable.push(retired);
            }
        }
        self.list = kept;
        reclaimable
    }

    pub fn take_all(&mut self) -> Vec<Retired> {
        std::mem::take(&mut self.list)
    }
}

impl Drop for LocalFreeList {
    fn drop(&mut self) {
        for retired in self.take_all() {
            unsafe { retired.reclaim() }
        }
    }
}
