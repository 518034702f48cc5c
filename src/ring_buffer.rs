use std::collections::VecDeque;

/// Bounded byte FIFO for outbound realtime-socket writes.
///
/// Single-producer (engine loop enqueues outgoing JSON frames),
/// single-consumer (the writable-notification loop drains frames). Overflow
/// never silently drops data — `push` rejects with `BufferFull` so the
/// caller can escalate to a network error.
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    high_water_mark: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer full: {len} + {incoming} > {capacity}")]
pub struct BufferFull {
    pub len: usize,
    pub incoming: usize,
    pub capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            high_water_mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Enqueue `bytes` atomically: either the whole chunk fits, or none of
    /// it is admitted (no partial enqueue, no silent drop).
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(BufferFull {
                len: self.data.len(),
                incoming: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.data.extend(bytes.iter().copied());
        self.high_water_mark = self.high_water_mark.max(self.data.len());
        Ok(())
    }

    /// Drain up to `max_len` bytes in FIFO order, for one frame's worth of
    /// socket write. Returns an empty vec if the buffer is empty.
    pub fn drain(&mut self, max_len: usize) -> Vec<u8> {
        let n = self.data.len().min(max_len);
        self.data.drain(..n).collect()
    }

    /// Read the first `n` bytes without consuming them. `None` if fewer
    /// than `n` bytes are currently buffered.
    pub fn peek(&self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.iter().take(n).copied().collect())
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
