//! Unbounded lock-free stack whose nodes are reclaimed through hazard pointers.

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::config::HazardConfig;
use crate::error::Status;
use crate::hazard_pointer::HazardRegistry;
use crate::util::{self, Backoff};

type LIFONodePtr<T> = *mut LIFONode<T>;

// `value` is moved out by the popping thread, dropping a retired node frees memory only
struct LIFONode<T> {
    value: ManuallyDrop<T>,
    next: LIFONodePtr<T>,
}

impl<T> LIFONode<T> {
    fn new(value: T) -> Self {
        LIFONode {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }
    }
}

/// Treiber stack, popped nodes go through the hazard registry before they are freed.
///
/// Push never fails. Every thread that pops takes one slot of the registry for its lifetime, so
/// at most `max_threads` distinct live threads may pop from one stack.
pub struct LockFreeStack<T> {
    top: util::WrappedAlign64Type<AtomicPtr<LIFONode<T>>>,
    registry: Arc<HazardRegistry>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        LockFreeStack::new()
    }
}

impl<T> LockFreeStack<T> {
    /// Stack with `HazardConfig::default()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_lockstack::lockfree_stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.push(10);
    /// stack.push(20);
    /// assert_eq!(stack.pop(), Some(20));
    /// assert_eq!(stack.pop(), Some(10));
    /// assert_eq!(stack.pop(), None);
    /// ```
    pub fn new() -> Self {
        LockFreeStack {
            top: util::WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            registry: Self::default_registry(),
            _marker: PhantomData,
        }
    }

    fn default_registry() -> Arc<HazardRegistry> {
        match HazardRegistry::new(HazardConfig::default()) {
            Ok(registry) => registry,
            Err(status) => unreachable!("default hazard config rejected, ret={}", status),
        }
    }

    pub fn with_config(config: HazardConfig) -> Result<Self, Status> {
        Ok(LockFreeStack {
            top: util::WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            registry: HazardRegistry::new(config)?,
            _marker: PhantomData,
        })
    }

    pub fn hazard_registry(&self) -> &Arc<HazardRegistry> {
        &self.registry
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    pub fn push(&self, v: T) {
        let node = Box::into_raw(Box::new(LIFONode::new(v)));
        let mut backoff = Backoff::new();
        let mut curr = self.top.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).next = curr;
            }
            match self
                .top
                .compare_exchange_weak(curr, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    curr = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the top value.
    ///
    /// # Panics
    ///
    /// When the current thread can not get a hazard slot, i.e. more than `max_threads` live
    /// threads pop from this stack. Use `try_pop` to handle that case.
    pub fn pop(&self) -> Option<T> {
        match self.try_pop() {
            Ok(ret) => ret,
            Err(status) => panic!(
                "can not pop without a hazard slot, ret={}, max_threads={}",
                status,
                self.registry.max_threads()
            ),
        }
    }

    /// Pops the top value. `Ok(None)` means the stack was empty.
    pub fn try_pop(&self) -> Result<Option<T>, Status> {
        let mut handle = self.registry.acquire_slot_for_current_thread()?;
        let mut backoff = Backoff::new();
        let node = loop {
            let curr = handle.protect(&self.top);
            if curr.is_null() {
                handle.retract();
                return Ok(None);
            }
            // `curr` is announced and was still on top afterwards, so it is not freed under us
            let next = unsafe { (*curr).next };
            if self
                .top
                .compare_exchange(curr, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break curr;
            }
            backoff.spin();
        };
        handle.retract();
        unsafe {
            let v = ManuallyDrop::into_inner(ptr::read(ptr::addr_of!((*node).value)));
            handle.retire(node);
            Ok(Some(v))
        }
    }

    unsafe fn destroy(&mut self) {
        let mut head = *self.top.get_mut();
        while !head.is_null() {
            let mut node = Box::from_raw(head);
            ManuallyDrop::drop(&mut node.value);
            head = node.next;
        }
        *self.top.get_mut() = ptr::null_mut();
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}
