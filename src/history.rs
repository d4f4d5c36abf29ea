//! Fixed-capacity ring of qwindows.

use crate::qwindow::QWindowSample;

/// Circular history of qwindows, newest at `head`.
///
/// Storage is allocated once at construction; appending past capacity
/// overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct FlowHistory {
    slots: Box<[QWindowSample]>,
    head: usize,
    count: usize,
    opened: u64,
}

impl FlowHistory {
    /// # Panics
    /// If `capacity` is zero. `Config::validate` rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            slots: vec![QWindowSample::default(); capacity].into_boxed_slice(),
            head: 0,
            count: 0,
            opened: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Windows opened over the flow's lifetime, including evicted ones.
    pub fn total_opened(&self) -> u64 {
        self.opened
    }

    /// Open a fresh window starting at `now`, evicting the oldest when full.
    pub fn append_new_window(&mut self, now: u64) {
        self.head = if self.count == 0 {
            0
        } else {
            (self.head + 1) % self.capacity()
        };
        self.slots[self.head] = QWindowSample::open(now);
        if self.count < self.capacity() {
            self.count += 1;
        }
        self.opened += 1;
    }

    /// The window currently accumulating events.
    pub fn current(&mut self) -> Option<&mut QWindowSample> {
        if self.count == 0 {
            return None;
        }
        Some(&mut self.slots[self.head])
    }

    /// Window `age` rotations before the current one (0 is current).
    pub fn at_age(&self, age: usize) -> Option<&QWindowSample> {
        if age >= self.count {
            return None;
        }
        let cap = self.capacity();
        Some(&self.slots[(self.head + cap - age) % cap])
    }

    /// Retained windows from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &QWindowSample> + '_ {
        (0..self.count).filter_map(move |age| self.at_age(age))
    }
}
