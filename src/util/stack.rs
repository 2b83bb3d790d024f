use arrayvec::ArrayVec;

/// Fixed capacity LIFO stack living on the call stack.
/// Pushing onto a full stack panics.
#[derive(Clone, Debug)]
pub struct BoundedStack<T, const CAP: usize> {
    items: ArrayVec<T, CAP>,
}

impl<T, const CAP: usize> BoundedStack<T, CAP> {
    pub fn new() -> Self {
        BoundedStack {
            items: ArrayVec::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, item: T) {
        assert!(!self.items.is_full(), "traversal stack overflow ({CAP} entries)");
        self.items.push(item);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }
}

impl<T, const CAP: usize> Default for BoundedStack<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn lifo_order() {
        let mut stack = BoundedStack::<u32, 4>::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert!(stack.peek() == Some(&3));
        assert!(stack.len() == 3);
        assert!(stack.pop() == Some(3));
        assert!(stack.pop() == Some(2));
        assert!(stack.pop() == Some(1));
        assert!(stack.pop() == None);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic]
    fn overflow_panics() {
        let mut stack = BoundedStack::<u32, 2>::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
    }
}
