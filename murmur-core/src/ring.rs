//! Fixed-capacity byte ring shared by the network producer and the playback consumer.
//! Overflow evicts the oldest bytes: live audio prefers glitches over growing latency.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Byte ring with overwrite-oldest semantics. All operations take one short lock and never block
/// on anything else, so it is safe to call from an audio thread.
pub struct RingBuffer {
    inner: Mutex<Ring>,
    capacity: usize,
}

struct Ring {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    len: usize,
    evicted: u64,
}

impl Ring {
    fn push(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        // Only the newest `cap` bytes of an oversized write can survive.
        let data = if data.len() > cap {
            let skipped = data.len() - cap;
            self.evicted += (self.len + skipped) as u64;
            self.read = self.write;
            self.len = 0;
            &data[skipped..]
        } else {
            data
        };

        let overflow = (self.len + data.len()).saturating_sub(cap);
        if overflow > 0 {
            self.read = (self.read + overflow) % cap;
            self.len -= overflow;
            self.evicted += overflow as u64;
        }

        let first = data.len().min(cap - self.write);
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.write = (self.write + data.len()) % cap;
        self.len += data.len();
    }

    fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = out.len().min(self.len);
        let first = n.min(cap - self.read);
        out[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        if n > first {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.read = (self.read + n) % cap;
        self.len -= n;
        n
    }
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes. Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                len: 0,
                evicted: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes, evicting the oldest data if capacity is exceeded. Never fails.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().push(data);
    }

    /// Remove and return up to `max_len` bytes (empty if nothing is buffered).
    pub fn read(&self, max_len: usize) -> Vec<u8> {
        let mut ring = self.lock();
        let mut out = vec![0u8; max_len.min(ring.len)];
        ring.pop_into(&mut out);
        out
    }

    /// Fill `out` from the front of the ring without allocating. Returns bytes copied.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        self.lock().pop_into(out)
    }

    pub fn available_at_least(&self, n: usize) -> bool {
        self.lock().len >= n
    }

    pub fn available(&self) -> usize {
        self.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes dropped to overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Discard everything buffered (eviction count is kept).
    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.read = ring.write;
        ring.len = 0;
    }
}
