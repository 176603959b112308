use std::collections::VecDeque;

/// Ordered FIFO of pending outgoing buffers.
///
/// The queue itself carries no lock: it is designed to sit inside the same
/// mutex that guards the socket handle, so the front element can be swapped
/// for a partial-write remainder without the handle closing mid-drain.
#[derive(Debug)]
pub struct SendQueue<T> {
    inner: VecDeque<T>,
}

impl<T> SendQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    /// Front element without removing it, if any.
    pub fn peek(&self) -> Option<&T> {
        self.inner.front()
    }

    /// Remove and return the front element.
    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Replace the front element in place, returning the previous one.
    ///
    /// Used to put the unsent remainder of a partially written buffer back
    /// at the head so a later drain resumes exactly where it stopped.
    pub fn exchange(&mut self, value: T) -> Option<T> {
        match self.inner.front_mut() {
            Some(front) => Some(std::mem::replace(front, value)),
            None => {
                self.inner.push_front(value);
                None
            }
        }
    }

    /// Append behind every buffer that is already pending.
    pub fn push_back(&mut self, value: T) {
        self.inner.push_back(value);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Discard every pending element.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<T> Default for SendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_fifo_order() {
        let mut q = SendQueue::new();
        q.push_back(Bytes::from_static(b"a"));
        q.push_back(Bytes::from_static(b"b"));
        q.push_back(Bytes::from_static(b"c"));

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"c"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut q = SendQueue::new();
        q.push_back(Bytes::from_static(b"front"));

        assert_eq!(q.peek().unwrap(), &Bytes::from_static(b"front"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"front"));
        assert!(q.peek().is_none());
    }

    #[test]
    fn test_exchange_replaces_front() {
        let mut q = SendQueue::new();
        q.push_back(Bytes::from_static(b"partial-message"));
        q.push_back(Bytes::from_static(b"next"));

        // Simulate a partial write: the front shrinks to its unsent suffix.
        let old = q.exchange(Bytes::from_static(b"message"));
        assert_eq!(old.unwrap(), Bytes::from_static(b"partial-message"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"message"));
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"next"));
    }

    #[test]
    fn test_clear_discards_backlog() {
        let mut q = SendQueue::new();
        q.push_back(Bytes::from_static(b"a"));
        q.push_back(Bytes::from_static(b"b"));

        q.clear();
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_exchange_on_empty_queue_inserts() {
        let mut q: SendQueue<Bytes> = SendQueue::new();
        assert!(q.exchange(Bytes::from_static(b"only")).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"only"));
    }
}
