use rust_decimal::Decimal;

/// Fixed-capacity rolling window with a running sum
///
/// Backed by a ring buffer: once full, each push overwrites the oldest
/// sample in place, so the mean costs O(1) per candle.
#[derive(Debug, Clone)]
pub struct RollingSma {
    buffer: Vec<Decimal>,
    capacity: usize,
    head: usize,
    sum: Decimal,
}

impl RollingSma {
    /// Create an empty window
    ///
    /// # Arguments
    /// * `capacity` - Number of samples averaged (must be >= 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            sum: Decimal::ZERO,
        }
    }

    /// Add a sample, evicting the oldest one when full
    pub fn push(&mut self, value: Decimal) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(value);
        } else {
            self.sum -= self.buffer[self.head];
            self.buffer[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
        }
        self.sum += value;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Arithmetic mean of the current contents
    pub fn mean(&self) -> Option<Decimal> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.sum / Decimal::from(self.buffer.len()))
    }
}
