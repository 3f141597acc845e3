//! Lock-free LIFO stacks for Rust with two ways of reclaiming popped nodes.
//!
//! A lock-free stack can not free a popped node right away: another thread may have read the same
//! head a moment earlier and be about to dereference it, or about to CAS with an address that has
//! meanwhile been freed and handed out again (the [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem)).
//!
//! `LockFreeStack` is unbounded and uses [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf):
//! before reading a node a thread announces it in its slot of a `HazardRegistry`, and a popped
//! node is freed only when no slot announces it. Until then it waits in a quarantine list, either
//! one global lock-free list or one vector per thread, which is drained in batches.
//!
//! `BoundedStack` keeps its nodes in a pre-allocated `NodePool` and names them by slot index plus
//! a generation tag. Popped slots are recycled at once; a stale head word fails its CAS because
//! the generation moved on. Push fails with `PoolExhausted` instead of allocating.
//!
//! Both implement `stack::ConcurrentStack`, and `stack::build` picks one from a `StackConfig`.
//!

pub mod bounded_stack;
pub mod config;
pub mod error;
pub mod free_list;
pub mod hazard_pointer;
pub mod lockfree_stack;
pub mod node_pool;
pub mod stack;
pub mod tagged_ptr;
pub mod util;

pub use bounded_stack::BoundedStack;
pub use config::{HazardConfig, PoolConfig, Quarantine, StackConfig};
pub use error::{PushError, Status};
pub use lockfree_stack::LockFreeStack;
pub use stack::ConcurrentStack;

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;
