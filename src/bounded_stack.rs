//! Bounded lock-free stack on top of `NodePool`.
//!
//! Nodes are pool slots and the head is a `TaggedIndex`, so a popped slot can be recycled right
//! away: a thread still holding the old head word fails its CAS because the generation moved on.
//! Push fails with `PoolExhausted` instead of growing.

use std::sync::atomic::Ordering;

use crate::config::PoolConfig;
use crate::error::{PushError, Status};
use crate::node_pool::NodePool;
use crate::tagged_ptr::{AtomicTaggedIndex, TaggedIndex};
use crate::util::{Backoff, WrappedAlign64Type};

pub struct BoundedStack<T> {
    top: WrappedAlign64Type<AtomicTaggedIndex>,
    pool: NodePool<T>,
}

impl<T> BoundedStack<T> {
    /// # Examples
    ///
    /// ```
    /// use rs_lockstack::bounded_stack::BoundedStack;
    ///
    /// let stack = BoundedStack::with_capacity(1).unwrap();
    /// assert!(stack.push(10));
    /// assert!(!stack.push(20));
    /// assert_eq!(stack.pop(), Some(10));
    /// ```
    pub fn with_capacity(capacity: usize) -> Result<Self, Status> {
        Self::with_config(&PoolConfig::new(capacity))
    }

    pub fn with_config(config: &PoolConfig) -> Result<Self, Status> {
        Ok(BoundedStack {
            top: WrappedAlign64Type(AtomicTaggedIndex::new(TaggedIndex::null())),
            pool: NodePool::new(config)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Occupied slots, including nodes being pushed or popped right now.
    pub fn len(&self) -> usize {
        self.pool.allocated_count()
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// Pushes `v`, or hands it back with `PoolExhausted` when every slot is taken.
    pub fn try_push(&self, v: T) -> Result<(), PushError<T>> {
        let node = match self.pool.alloc() {
            Some(node) => node,
            None => {
                debug!("node pool exhausted, capacity={}", self.capacity());
                return Err(PushError::new(Status::PoolExhausted, v));
            }
        };
        let slot = self.pool.slot(node);
        unsafe {
            slot.write(v);
        }
        let mut backoff = Backoff::new();
        let mut curr = self.top.load(Ordering::Relaxed);
        loop {
            slot.next().store(curr, Ordering::Relaxed);
            match self
                .top
                .compare_exchange_weak(curr, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => {
                    curr = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns false when the pool is exhausted; `v` is dropped in that case.
    pub fn push(&self, v: T) -> bool {
        self.try_push(v).is_ok()
    }

    pub fn pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        let mut curr = self.top.load(Ordering::Acquire);
        loop {
            if curr.is_null() {
                return None;
            }
            // the slot may already be recycled, then `next` is garbage and the CAS fails
            let next = self.pool.slot(curr).next().load(Ordering::Relaxed);
            match self
                .top
                .compare_exchange_weak(curr, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => {
                    curr = actual;
                    backoff.spin();
                }
            }
        }
        unsafe {
            let v = self.pool.slot(curr).take();
            self.pool.dealloc(curr);
            Some(v)
        }
    }
}

impl<T> Drop for BoundedStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
