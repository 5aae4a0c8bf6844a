//! Fixed-capacity circular cache of recent tensors for one activation key.
//!
//! Used by [`StreamingTrace`](crate::trace::StreamingTrace) to answer
//! "last N chunks" queries without touching disk. Once full, the oldest
//! entry is silently overwritten.

use anyhow::Result;
use candle_core::Tensor;

use crate::key::ActivationKey;

/// Circular buffer holding at most `capacity` tensors.
#[derive(Debug)]
pub struct RingBuffer {
    key: ActivationKey,
    slots: Vec<Option<Tensor>>,
    write_pos: usize,
    count: usize,
}

impl RingBuffer {
    /// Create an empty buffer; `capacity` must be non-zero.
    pub fn new(capacity: usize, key: ActivationKey) -> Result<Self> {
        anyhow::ensure!(capacity > 0, "Ring buffer capacity must be > 0");
        Ok(Self {
            key,
            slots: vec![None; capacity],
            write_pos: 0,
            count: 0,
        })
    }

    /// Key this buffer mirrors.
    pub fn key(&self) -> ActivationKey {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of retained items (saturates at capacity).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Copy `tensor` into the next slot, overwriting the oldest when full.
    pub fn push(&mut self, tensor: &Tensor) -> Result<()> {
        let capacity = self.slots.len();
        self.slots[self.write_pos] = Some(tensor.copy()?);
        self.write_pos = (self.write_pos + 1) % capacity;
        self.count = (self.count + 1).min(capacity);
        Ok(())
    }

    /// Up to `min(n, len)` items, most recent first.
    pub fn recent(&self, n: usize) -> Vec<Tensor> {
        let capacity = self.slots.len();
        let take = n.min(self.count);
        (1..=take)
            .filter_map(|back| {
                let idx = (self.write_pos + capacity - back) % capacity;
                self.slots[idx].clone()
            })
            .collect()
    }

    /// Every retained item, oldest first.
    pub fn all(&self) -> Vec<Tensor> {
        let capacity = self.slots.len();
        let start = (self.write_pos + capacity - self.count) % capacity;
        (0..self.count)
            .filter_map(|i| self.slots[(start + i) % capacity].clone())
            .collect()
    }

    /// Drop every item; capacity is kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.write_pos = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Component;
    use candle_core::Device;

    fn scalar(v: f32) -> Tensor {
        Tensor::new(&[v], &Device::Cpu).unwrap()
    }

    fn values(tensors: &[Tensor]) -> Vec<f32> {
        tensors
            .iter()
            .map(|t| t.to_vec1::<f32>().unwrap()[0])
            .collect()
    }

    fn buffer(capacity: usize) -> RingBuffer {
        RingBuffer::new(capacity, ActivationKey::new(0, Component::Residual)).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(RingBuffer::new(0, ActivationKey::new(0, Component::Residual)).is_err());
    }

    #[test]
    fn test_partial_fill() {
        let mut rb = buffer(4);
        assert!(rb.is_empty());
        rb.push(&scalar(1.0)).unwrap();
        rb.push(&scalar(2.0)).unwrap();
        assert_eq!(rb.len(), 2);
        assert_eq!(values(&rb.recent(10)), vec![2.0, 1.0]);
        assert_eq!(values(&rb.all()), vec![1.0, 2.0]);
    }

    #[test]
    fn test_overwrite_keeps_last_capacity_items() {
        for capacity in 1..5 {
            for extra in 0..6 {
                let n = capacity + extra;
                let mut rb = buffer(capacity);
                for i in 0..n {
                    rb.push(&scalar(i as f32)).unwrap();
                }
                assert_eq!(rb.len(), capacity);
                let expected_all: Vec<f32> = ((n - capacity)..n).map(|i| i as f32).collect();
                let mut expected_recent = expected_all.clone();
                expected_recent.reverse();
                assert_eq!(values(&rb.all()), expected_all);
                assert_eq!(values(&rb.recent(capacity)), expected_recent);
            }
        }
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut rb = buffer(3);
        rb.push(&scalar(1.0)).unwrap();
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 3);
        assert!(rb.all().is_empty());
        rb.push(&scalar(5.0)).unwrap();
        assert_eq!(values(&rb.recent(1)), vec![5.0]);
    }
}
