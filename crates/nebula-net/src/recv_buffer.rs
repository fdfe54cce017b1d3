//! Growable receive buffer with independent read and write cursors.
//!
//! ```text
//! 0           read_pos          write_pos              capacity
//! +-----------+-----------------+----------------------+
//! | consumed  | unconsumed data |      free space      |
//! +-----------+-----------------+----------------------+
//! ```
//!
//! The network layer writes into [`RecvBuffer::write_segment`] and commits
//! with [`RecvBuffer::commit_write`]; the parser reads from
//! [`RecvBuffer::read_segment`] and commits with [`RecvBuffer::commit_read`].
//! [`RecvBuffer::reclaim`] recovers contiguous free space before the next read
//! by resetting, sliding, or growing the storage.

/// Default initial capacity in bytes.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Default low-water mark: below this much free space the buffer compacts.
pub const DEFAULT_LOW_WATER: usize = 1024;

/// Default growth ceiling. Large enough for any framed message.
pub const DEFAULT_MAX_RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Lowest growth ceiling a session runs with: one maximum-length packet.
pub const MIN_RECV_CEILING: usize = u16::MAX as usize;

/// Byte arena with sliding-window compaction.
#[derive(Debug)]
pub struct RecvBuffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    low_water: usize,
    max_capacity: usize,
}

impl RecvBuffer {
    /// Create a buffer with the given capacity and default thresholds.
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_LOW_WATER, DEFAULT_MAX_RECV_BUFFER_SIZE)
    }

    /// Create a buffer with an explicit low-water mark and growth ceiling.
    ///
    /// `low_water` is clamped to `1..=capacity` and `max_capacity` is raised
    /// to at least the initial capacity.
    pub fn with_limits(capacity: usize, low_water: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            low_water: low_water.clamp(1, capacity),
            max_capacity: max_capacity.max(capacity),
        }
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of unconsumed bytes.
    pub fn data_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Room left at the tail for the next network write.
    pub fn free_size(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Current read cursor.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Current write cursor.
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// True when no more bytes can be written even after compaction.
    pub fn is_full(&self) -> bool {
        self.data_size() == self.storage.len() && self.storage.len() >= self.max_capacity
    }

    /// Unconsumed bytes `[read_pos, write_pos)`.
    pub fn read_segment(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Writable tail `[write_pos, capacity)`.
    pub fn write_segment(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_pos..]
    }

    /// Mark `n` freshly written bytes as valid data.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`free_size`](Self::free_size).
    pub fn commit_write(&mut self, n: usize) {
        assert!(
            n <= self.free_size(),
            "recv buffer overflow: commit_write({n}) with {} bytes free",
            self.free_size()
        );
        self.write_pos += n;
    }

    /// Mark `n` bytes at the front of the data region as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`data_size`](Self::data_size).
    pub fn commit_read(&mut self, n: usize) {
        assert!(
            n <= self.data_size(),
            "recv buffer underflow: commit_read({n}) with {} bytes buffered",
            self.data_size()
        );
        self.read_pos += n;
    }

    /// Recover contiguous free space. Idempotent.
    ///
    /// An empty buffer rewinds both cursors. Otherwise, once free space drops
    /// below the low-water mark the unconsumed bytes slide to offset 0, and if
    /// that still leaves too little room the storage doubles (up to the
    /// configured ceiling).
    pub fn reclaim(&mut self) {
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
            return;
        }

        if self.free_size() >= self.low_water {
            return;
        }

        if self.read_pos > 0 {
            let len = self.data_size();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = len;
        }

        while self.free_size() < self.low_water && self.storage.len() < self.max_capacity {
            let new_capacity = (self.storage.len() * 2).min(self.max_capacity);
            tracing::debug!(
                "Growing recv buffer {} -> {} bytes",
                self.storage.len(),
                new_capacity
            );
            self.storage.resize(new_capacity, 0);
        }
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RECV_BUFFER_SIZE)
    }
}
