//! Fixed-capacity FIFO ring buffer.
//!
//! Slots are allocated once in [`RingBuffer::new`]; pushes and pops only move
//! the head index. Aggregation (`for_each`, `reduce`) walks the live slots in
//! insertion order without building an intermediate collection.

/// Bounded FIFO queue over a preallocated slot array
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index of the oldest element
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.capacity()
    }

    /// Append `value`, handing it back if the buffer is full
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let tail = self.physical(self.len);
        self.slots[tail] = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Append `value`, evicting and returning the oldest element when full
    pub fn push_overwrite(&mut self, value: T) -> Option<T> {
        if !self.is_full() {
            let tail = self.physical(self.len);
            self.slots[tail] = Some(value);
            self.len += 1;
            return None;
        }

        // Full: the oldest slot becomes the newest.
        let evicted = self.slots[self.head].replace(value);
        self.head = (self.head + 1) % self.capacity();
        evicted
    }

    /// Remove and return the oldest element
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        value
    }

    /// Element at logical position `index` (0 = oldest)
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[self.physical(index)].as_ref()
    }

    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn back(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|last| self.get(last))
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            index: 0,
        }
    }

    /// Visit each element from oldest to newest
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&T),
    {
        for index in 0..self.len {
            if let Some(value) = self.slots[self.physical(index)].as_ref() {
                f(value);
            }
        }
    }

    /// Fold the live elements from oldest to newest
    pub fn reduce<A, F>(&self, init: A, mut f: F) -> A
    where
        F: FnMut(A, &T) -> A,
    {
        let mut acc = init;
        for index in 0..self.len {
            if let Some(value) = self.slots[self.physical(index)].as_ref() {
                acc = f(acc, value);
            }
        }
        acc
    }

    /// Drop every element, keeping the allocation
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

/// Borrowing iterator over a [`RingBuffer`], oldest first
pub struct Iter<'a, T> {
    buffer: &'a RingBuffer<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.buffer.get(self.index)?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.buffer.len.saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
