//! Stream storage for the audio engine.
//!
//! Every mono audio-rate signal in the graph lives in the [`StreamPool`] as a
//! fixed-length buffer, one per node voice output. Buffers are allocated on
//! the control thread and handed to the pool fully sized; the audio thread
//! only swaps them in and out.
//!
//! # Checkout discipline
//!
//! While a node is being processed, its output buffers are *checked out* of
//! the pool ([`take`](StreamPool::take)), giving the unit `&mut` access while
//! every other stream stays readable through `&StreamPool`. Dependency
//! ordering guarantees a node never reads its own current-cycle output, so a
//! checked-out slot is never read; if it ever were (or a slot was freed), the
//! reader sees a silent buffer instead of a crash.

use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier of one mono stream buffer in a [`StreamPool`].
///
/// Stream ids are assigned sequentially by the server and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u32);

impl StreamId {
    /// Returns the raw index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owns every stream buffer in the engine.
pub struct StreamPool {
    slots: Vec<Option<Vec<f32>>>,
    /// Shared zero buffer returned for checked-out or missing slots.
    silence: Vec<f32>,
}

impl StreamPool {
    /// Creates a pool with slot capacity reserved and a silence buffer of
    /// `max_frames` samples.
    pub fn with_capacity(slot_capacity: usize, max_frames: usize) -> Self {
        Self {
            slots: Vec::with_capacity(slot_capacity),
            silence: vec![0.0; max_frames],
        }
    }

    /// Installs a pre-allocated buffer at `id`.
    ///
    /// The slot vector grows as needed; buffers longer than the current
    /// silence buffer grow it too, so readers of a missing slot always have
    /// enough zeros to index into.
    pub fn insert(&mut self, id: StreamId, buffer: Vec<f32>) {
        let idx = id.index();
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        if buffer.len() > self.silence.len() {
            self.silence.resize(buffer.len(), 0.0);
        }
        self.slots[idx] = Some(buffer);
    }

    /// Appends a buffer in the next slot and returns its id. For standalone
    /// use (unit tests, offline tools); the server assigns ids itself.
    pub fn push(&mut self, buffer: Vec<f32>) -> StreamId {
        let id = StreamId(self.slots.len() as u32);
        self.insert(id, buffer);
        id
    }

    /// Reads a stream buffer, or silence if the slot is checked out or free.
    #[inline]
    pub fn read(&self, id: StreamId) -> &[f32] {
        match self.slots.get(id.index()) {
            Some(Some(buf)) => buf,
            _ => &self.silence,
        }
    }

    /// Checks a buffer out of the pool for exclusive writing.
    ///
    /// Returns an empty vec if the slot does not exist (the caller restores
    /// it unchanged and the node output stays silent).
    #[inline]
    pub fn take(&mut self, id: StreamId) -> Vec<f32> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::take)
            .unwrap_or_default()
    }

    /// Returns a checked-out buffer to its slot.
    #[inline]
    pub fn restore(&mut self, id: StreamId, buffer: Vec<f32>) {
        if buffer.is_empty() {
            return;
        }
        let idx = id.index();
        if idx < self.slots.len() {
            self.slots[idx] = Some(buffer);
        }
    }

    /// Zeroes a stream buffer in place.
    pub fn clear(&mut self, id: StreamId) {
        if let Some(Some(buf)) = self.slots.get_mut(id.index()) {
            buf.fill(0.0);
        }
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Lock-free snapshot of the first sample of every stream.
///
/// Refreshed by the audio thread once per cycle and read by the control
/// thread to serve value peeks while the device owns the engine. Values are
/// stored as f32 bit patterns in `AtomicU32`s.
pub(crate) struct PeekBuffer {
    slots: Vec<AtomicU32>,
}

impl PeekBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicU32::new(0));
        Self { slots }
    }

    #[inline]
    pub(crate) fn publish(&self, id: StreamId, value: f32) {
        if let Some(slot) = self.slots.get(id.index()) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn read(&self, id: StreamId) -> f32 {
        self.slots
            .get(id.index())
            .map_or(0.0, |slot| f32::from_bits(slot.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read() {
        let mut pool = StreamPool::with_capacity(8, 4);
        pool.insert(StreamId(0), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pool.read(StreamId(0)), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn missing_slot_reads_silence() {
        let pool = StreamPool::with_capacity(8, 4);
        assert_eq!(pool.read(StreamId(3)), &[0.0; 4]);
    }

    #[test]
    fn checkout_roundtrip() {
        let mut pool = StreamPool::with_capacity(8, 4);
        pool.insert(StreamId(2), vec![0.5; 4]);

        let mut buf = pool.take(StreamId(2));
        // While checked out, readers see silence.
        assert_eq!(pool.read(StreamId(2)), &[0.0; 4]);

        buf[0] = 9.0;
        pool.restore(StreamId(2), buf);
        assert_eq!(pool.read(StreamId(2))[0], 9.0);
    }

    #[test]
    fn silence_grows_with_largest_buffer() {
        let mut pool = StreamPool::with_capacity(8, 4);
        pool.insert(StreamId(0), vec![0.0; 16]);
        // A missing slot must still be indexable to the largest length.
        assert_eq!(pool.read(StreamId(1)).len(), 16);
    }

    #[test]
    fn peek_buffer_roundtrip() {
        let peeks = PeekBuffer::new(4);
        peeks.publish(StreamId(1), -0.25);
        assert_eq!(peeks.read(StreamId(1)), -0.25);
        // Out-of-capacity ids read as zero.
        assert_eq!(peeks.read(StreamId(99)), 0.0);
    }
}
