// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

/// One outstanding append: the index of the last entry it carried and the
/// payload bytes it accounts for.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct Inflight {
    last: u64,
    bytes: u64,
}

/// A sliding window over the appends a leader has sent to one follower but
/// not yet seen acknowledged.
///
/// The window is a fixed-capacity ring. Records are pushed in send order, so
/// their `last` indexes are strictly increasing around the ring, and an
/// acknowledgment for index `i` frees every record at or below `i` from the
/// front. While `full()` the leader must not send further appends to this
/// peer.
#[derive(Debug, PartialEq, Clone)]
pub struct Inflights {
    // index of the oldest record in `buffer`
    start: usize,
    // number of live records
    count: usize,
    // payload bytes across all live records
    bytes: u64,

    buffer: Vec<Inflight>,

    // maximum number of live records
    cap: usize,
    // maximum payload bytes across live records; 0 disables the bound
    max_bytes: u64,
}

impl Inflights {
    /// Creates a window admitting `cap` outstanding appends and, when
    /// `max_bytes` is non-zero, at most that many payload bytes.
    pub fn new(cap: usize, max_bytes: u64) -> Inflights {
        Inflights {
            buffer: Vec::with_capacity(cap),
            start: 0,
            count: 0,
            bytes: 0,
            cap,
            max_bytes,
        }
    }

    /// Whether the window cannot admit another append.
    ///
    /// The byte bound trips once the live total *reaches* it, so a single
    /// oversized append is always admissible into an empty window.
    #[inline]
    pub fn full(&self) -> bool {
        self.count == self.cap || (self.max_bytes != 0 && self.bytes >= self.max_bytes)
    }

    /// Records an append whose last entry is `last` carrying `bytes` of
    /// payload.
    ///
    /// # Panics
    ///
    /// Panics if the window is full, or if `last` does not exceed the most
    /// recently added record (the ring relies on strictly increasing order).
    pub fn add(&mut self, last: u64, bytes: u64) {
        if self.full() {
            panic!("cannot add into a full inflights")
        }
        if self.count > 0 {
            let newest = (self.start + self.count - 1) % self.cap;
            assert!(
                self.buffer[newest].last < last,
                "inflight indexes must increase: {} then {}",
                self.buffer[newest].last,
                last,
            );
        }

        let next = (self.start + self.count) % self.cap;
        assert!(next <= self.buffer.len());
        let record = Inflight { last, bytes };
        if next == self.buffer.len() {
            self.buffer.push(record);
        } else {
            self.buffer[next] = record;
        }
        self.count += 1;
        self.bytes += bytes;
    }

    /// Frees every record whose last index is at or below `to`.
    pub fn free_to(&mut self, to: u64) {
        if self.count == 0 || to < self.buffer[self.start].last {
            // The acknowledgment predates the whole window.
            return;
        }

        let mut i = 0;
        let mut idx = self.start;
        while i < self.count {
            if to < self.buffer[idx].last {
                break;
            }
            self.bytes -= self.buffer[idx].bytes;
            idx = (idx + 1) % self.cap;
            i += 1;
        }

        self.count -= i;
        self.start = idx;
        if self.count == 0 {
            self.start = 0;
        }
    }

    /// Frees the oldest record. Used when a heartbeat response arrives while
    /// the window is full, to let at least one more append through.
    #[inline]
    pub fn free_first_one(&mut self) {
        if self.count > 0 {
            let oldest = self.buffer[self.start].last;
            self.free_to(oldest);
        }
    }

    /// Discards all records.
    #[inline]
    pub fn reset(&mut self) {
        self.count = 0;
        self.start = 0;
        self.bytes = 0;
        self.buffer.clear();
    }

    /// Number of outstanding appends.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Payload bytes across outstanding appends.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The configured record capacity.
    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }
}
