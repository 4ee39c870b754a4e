use std::collections::VecDeque;

/// FIFO with a fixed number of slots.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    storage: VecDeque<T>,
    max_size: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            storage: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Hands the item back when the queue is full.
    pub fn try_enq(&mut self, data: T) -> Result<(), T> {
        if self.is_full() {
            return Err(data);
        }
        self.storage.push_back(data);
        Ok(())
    }

    /// Remove and return every entry matching `pred`, keeping order.
    pub fn drain_where<F: FnMut(&T) -> bool>(&mut self, mut pred: F) -> Vec<T> {
        let mut kept = VecDeque::with_capacity(self.max_size);
        let mut taken = Vec::new();
        for item in self.storage.drain(..) {
            if pred(&item) {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.storage = kept;
        taken
    }

    pub fn is_full(&self) -> bool {
        self.storage.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedQueue;

    #[test]
    fn full_queue_returns_item() {
        let mut q = BoundedQueue::new(2);
        q.try_enq(1).expect("slot");
        q.try_enq(2).expect("slot");
        assert_eq!(Err(3), q.try_enq(3));
        assert_eq!(vec![1], q.drain_where(|v| *v == 1));
        q.try_enq(3).expect("freed slot");
        assert_eq!(vec![3], q.drain_where(|v| *v == 3));
        assert_eq!(1, q.len());
    }
}
