//! Bounded hand-off from the accept loop to the service loop
//!
//! A ring of `N` slots of which `N - 1` are usable: `head == tail` is empty
//! and `head + 1 == tail` (mod N) is full. The consumer takes the value out
//! of its slot, so every accepted connection is handed over exactly once.

use parking_lot::Mutex;

/// Default ring size
pub const HOST_QUEUE_SLOTS: usize = 3;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

pub struct HostQueue<T> {
    ring: Mutex<Ring<T>>,
}

impl<T> Default for HostQueue<T> {
    fn default() -> Self {
        Self::new(HOST_QUEUE_SLOTS)
    }
}

impl<T> HostQueue<T> {
    /// # Arguments
    /// * `slots` - Ring size; one slot always stays empty (minimum 2)
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(2);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..slots).map(|_| None).collect(),
                head: 0,
                tail: 0,
            }),
        }
    }

    /// Usable capacity
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        let ring = self.ring.lock();
        ring.head == ring.tail
    }

    pub fn is_full(&self) -> bool {
        let ring = self.ring.lock();
        (ring.head + 1) % ring.slots.len() == ring.tail
    }

    /// Append at the head; a full queue hands the value back
    pub fn add(&self, value: T) -> Result<(), T> {
        let mut ring = self.ring.lock();
        let n = ring.slots.len();
        let next = (ring.head + 1) % n;
        if next == ring.tail {
            return Err(value);
        }

        let head = ring.head;
        ring.slots[head] = Some(value);
        ring.head = next;
        Ok(())
    }

    /// Remove the oldest value
    pub fn take(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.head == ring.tail {
            return None;
        }

        let tail = ring.tail;
        let value = ring.slots[tail].take();
        ring.tail = (tail + 1) % ring.slots.len();
        value
    }

    /// Remove everything, oldest first
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.take()).collect()
    }
}
