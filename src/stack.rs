//! Common interface over the stack flavours and a factory picking one from `StackConfig`.

use crate::bounded_stack::BoundedStack;
use crate::config::StackConfig;
use crate::error::{PushError, Status};
use crate::lockfree_stack::LockFreeStack;

/// A multi-producer multi-consumer LIFO container.
pub trait ConcurrentStack<T>: Send + Sync {
    /// Pushes `v` or hands it back on failure.
    fn try_push(&self, v: T) -> Result<(), PushError<T>>;

    /// `None` when the stack is empty.
    fn pop(&self) -> Option<T>;

    fn is_empty(&self) -> bool;

    /// Returns false only when a bounded stack is out of slots.
    fn push(&self, v: T) -> bool {
        self.try_push(v).is_ok()
    }
}

impl<T: Send> ConcurrentStack<T> for LockFreeStack<T> {
    fn try_push(&self, v: T) -> Result<(), PushError<T>> {
        LockFreeStack::push(self, v);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        LockFreeStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        LockFreeStack::is_empty(self)
    }
}

impl<T: Send> ConcurrentStack<T> for BoundedStack<T> {
    fn try_push(&self, v: T) -> Result<(), PushError<T>> {
        BoundedStack::try_push(self, v)
    }

    fn pop(&self) -> Option<T> {
        BoundedStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        BoundedStack::is_empty(self)
    }
}

/// Builds the stack described by `config`.
///
/// # Examples
///
/// ```
/// use rs_lockstack::config::StackConfig;
/// use rs_lockstack::stack;
///
/// let bounded = stack::build::<u32>(StackConfig::bounded(1)).unwrap();
/// assert!(bounded.push(1));
/// assert!(!bounded.push(2));
///
/// let unbounded = stack::build::<u32>(StackConfig::hazard(8)).unwrap();
/// assert!(unbounded.push(1));
/// assert_eq!(unbounded.pop(), Some(1));
/// ```
pub fn build<T>(config: StackConfig) -> Result<Box<dyn ConcurrentStack<T>>, Status>
where
    T: Send + 'static,
{
    config.validate()?;
    debug!("building stack, config={:?}", config);
    Ok(match config {
        StackConfig::Bounded(c) => Box::new(BoundedStack::with_config(&c)?),
        StackConfig::Hazard(c) => Box::new(LockFreeStack::with_config(c)?),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(stack: &dyn ConcurrentStack<i32>) {
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
        assert!(stack.push(10));
        assert_eq!(stack.pop(), Some(10));
        assert!(stack.push(10));
        assert!(stack.push(20));
        assert_eq!(stack.pop(), Some(20));
        assert_eq!(stack.pop(), Some(10));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_every_scheme_round_trips() {
        for config in vec![StackConfig::bounded(4), StackConfig::default()] {
            let stack = build::<i32>(config).unwrap();
            round_trip(&*stack);
        }
    }

    #[test]
    fn test_build_rejects_bad_config() {
        assert_eq!(
            build::<i32>(StackConfig::bounded(0)).err(),
            Some(Status::InvalidParam)
        );
    }
}
