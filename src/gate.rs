use std::sync::{Condvar, Mutex};

/// Counting permit bounding how many units of one kind of work may be in
/// flight at once.
///
/// Unlike a lock this is not reentrant and is routinely released from a
/// different thread than it was acquired on: the submission thread acquires,
/// the completion callback releases.
pub struct Gate {
    capacity: usize,
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Gate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Mutex::new(capacity),
            cond: Condvar::new(),
        }
    }

    /// Block the calling thread until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self
            .permits
            .lock()
            .expect("a thread holding the gate lock panicked");
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .expect("a thread holding the gate lock panicked");
        }
        *permits -= 1;
    }

    /// Return a permit and wake one waiter.
    ///
    /// Releasing more permits than were acquired would let work overrun the
    /// buffers the gate protects, so it is treated as a programming error.
    pub fn release(&self) {
        let mut permits = self
            .permits
            .lock()
            .expect("a thread holding the gate lock panicked");
        assert!(
            *permits < self.capacity,
            "gate released more times than acquired (capacity {})",
            self.capacity
        );
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently available. Only a snapshot; other threads may
    /// acquire or release immediately after.
    pub fn available(&self) -> usize {
        *self
            .permits
            .lock()
            .expect("a thread holding the gate lock panicked")
    }
}
