//! A reusable per-connection receive buffer for the stream decoder.
//!
//! The buffer carries three cursors with the invariant
//!  `checkpoint <= consumed <= filled <= capacity`:
//!
//! * `checkpoint` - the last confirmed-clean message boundary. Everything before it has been
//!   handed to the application and can be reclaimed.
//! * `consumed` - bytes handed to the parser for the message currently being decoded. Rolling
//!   back to the checkpoint discards a partially parsed message without losing any received
//!   bytes.
//! * `filled` - bytes received from the socket.
//!
//! When the buffer runs full and reclaimed bytes exist, the unparsed tail is shifted to offset
//!  0 and all cursors rebased instead of growing the buffer. Only when a single in-progress
//!  message occupies the entire buffer does it double, so an oversized inbound message cannot
//!  wedge the decoder.

/// The reusable receive buffer, one per stream connection.
pub struct StreamReadCache {
    buf: Vec<u8>,
    checkpoint: usize,
    consumed: usize,
    filled: usize,
}

impl StreamReadCache {
    pub fn new(capacity: usize) -> StreamReadCache {
        assert!(capacity > 0);
        StreamReadCache {
            buf: vec![0; capacity],
            checkpoint: 0,
            consumed: 0,
            filled: 0,
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.checkpoint <= self.consumed);
        debug_assert!(self.consumed <= self.filled);
        debug_assert!(self.filled <= self.buf.len());
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// the received bytes not yet handed to the parser
    pub fn unparsed(&self) -> &[u8] {
        &self.buf[self.consumed..self.filled]
    }

    pub fn available(&self) -> usize {
        self.filled - self.consumed
    }

    /// hand `n` unparsed bytes to the parser
    pub fn advance(&mut self, n: usize) {
        assert!(self.consumed + n <= self.filled, "advancing past the filled cursor");
        self.consumed += n;
        self.check_invariants();
    }

    /// confirm the consumed bytes as a clean message boundary
    pub fn commit(&mut self) {
        self.checkpoint = self.consumed;
        self.check_invariants();
    }

    /// discard the partially parsed message, resetting the parse cursor to the last
    ///  confirmed-clean boundary. Received bytes are kept for the next parse attempt.
    pub fn rollback(&mut self) {
        self.consumed = self.checkpoint;
        self.check_invariants();
    }

    /// Make room for the next socket read: shift confirmed-consumed bytes out if there are
    ///  any, double the buffer if a single in-progress message fills it entirely.
    pub fn ensure_space(&mut self) {
        if self.filled < self.buf.len() {
            return;
        }

        if self.checkpoint > 0 {
            self.buf.copy_within(self.checkpoint..self.filled, 0);
            self.consumed -= self.checkpoint;
            self.filled -= self.checkpoint;
            self.checkpoint = 0;
        }
        else {
            self.buf.resize(self.buf.len() * 2, 0);
        }
        self.check_invariants();
    }

    /// the writable tail for the next socket read. NB: call [Self::ensure_space] first or this
    ///  may be empty.
    pub fn spare_capacity(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// record `n` bytes received from the socket into [Self::spare_capacity]
    pub fn mark_filled(&mut self, n: usize) {
        assert!(self.filled + n <= self.buf.len(), "filling past the buffer's capacity");
        self.filled += n;
        self.check_invariants();
    }
}
