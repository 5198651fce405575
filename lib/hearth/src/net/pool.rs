use std::sync::Mutex;

/// Bounded LIFO cache of reusable objects. Push beyond the bound discards
/// the object (the allocator reclaims it); pop on an empty stack returns
/// None and the caller allocates. Mirrors the channel free-list the
/// endpoint keeps, generalized to cross-thread use.
pub struct SyncStack<T> {
    items: Mutex<Vec<T>>,
    bound: usize,
}

impl<T> SyncStack<T> {
    pub fn new(bound: usize) -> SyncStack<T> {
        SyncStack {
            items: Mutex::new(Vec::with_capacity(bound.min(64))),
            bound,
        }
    }

    /// Returns false when the stack is full and the item was discarded.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().expect("SyncStack lock poisoned");

        if items.len() >= self.bound {
            return false;
        }

        items.push(item);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().expect("SyncStack lock poisoned").pop()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("SyncStack lock poisoned").len()
    }

    /// Drops every cached object. Called on endpoint stop.
    pub fn clear(&self) {
        self.items.lock().expect("SyncStack lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let stack = SyncStack::new(4);

        assert!(stack.push(1));
        assert!(stack.push(2));
        assert!(stack.push(3));

        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_overflow_discards() {
        let stack = SyncStack::new(2);

        assert!(stack.push(1));
        assert!(stack.push(2));
        assert!(!stack.push(3));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_clear() {
        let stack = SyncStack::new(2);
        stack.push(1);
        stack.clear();
        assert_eq!(stack.pop(), None);
    }
}
