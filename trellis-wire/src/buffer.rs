//! Growable byte buffers with explicit consume/examine cursors.
//!
//! Both directions of a backend conversation go through a [`WireBuffer`].
//! Inbound, bytes are appended at the tail as the socket delivers them and
//! whole frames are taken off the head; outbound, encoded messages are
//! appended and the flush loop drains the head. The cursor invariant
//! `start <= cursor <= end <= capacity` holds at every public-method
//! boundary.

use bytes::Bytes;

const INITIAL_CAPACITY: usize = 16 * 1024;

/// One framed v3 protocol message: a tag byte and its payload (the length
/// word is consumed during framing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct WireBuffer {
    buf: Vec<u8>,
    /// First byte not yet consumed.
    start: usize,
    /// First byte not yet examined by the framer. Everything in
    /// `[start, cursor)` has been peeked at but found incomplete.
    cursor: usize,
    /// End of valid data.
    end: usize,
}

impl Default for WireBuffer {
    fn default() -> Self {
        WireBuffer::with_capacity(INITIAL_CAPACITY)
    }
}

impl WireBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        WireBuffer {
            buf: vec![0; cap.max(64)],
            start: 0,
            cursor: 0,
            end: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of valid, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn check_invariant(&self) -> bool {
        self.start <= self.cursor && self.cursor <= self.end && self.end <= self.buf.len()
    }

    /// Unconsumed data, for draining to a socket.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Mark `n` bytes at the head as consumed (written out or framed).
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.cursor < self.start {
            self.cursor = self.start;
        }
        if self.start == self.end {
            // cheap reset instead of compaction once fully drained
            self.start = 0;
            self.cursor = 0;
            self.end = 0;
        }
    }

    /// Append raw bytes at the tail.
    pub fn extend(&mut self, data: &[u8]) {
        self.reserve_tail(data.len());
        self.buf[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        debug_assert!(self.check_invariant());
    }

    /// Spare tail space for a socket read; call [`advance_end`] afterwards
    /// with the number of bytes actually read.
    ///
    /// [`advance_end`]: WireBuffer::advance_end
    pub fn spare_tail(&mut self, min: usize) -> &mut [u8] {
        self.reserve_tail(min);
        &mut self.buf[self.end..]
    }

    pub fn advance_end(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Take one complete framed message off the head, if present.
    ///
    /// v3 framing: a tag byte followed by an i32 length that counts itself
    /// and the payload, but not the tag.
    pub fn try_frame(&mut self) -> Option<Frame> {
        let avail = &self.buf[self.start..self.end];
        if avail.len() < 5 {
            self.cursor = self.end;
            return None;
        }
        let tag = avail[0];
        let len = u32::from_be_bytes([avail[1], avail[2], avail[3], avail[4]]) as usize;
        // len counts the length word itself; total frame is 1 (tag) + len
        let total = 1 + len;
        if len < 4 || avail.len() < total {
            self.cursor = self.end;
            return None;
        }
        let payload = Bytes::copy_from_slice(&avail[5..total]);
        self.consume(total);
        debug_assert!(self.check_invariant());
        Some(Frame { tag, payload })
    }

    /// Move live data to the front so the tail has room for at least
    /// `min` more bytes, growing the allocation when compaction alone is
    /// not enough.
    fn reserve_tail(&mut self, min: usize) {
        if self.buf.len() - self.end >= min {
            return;
        }
        let live = self.end - self.start;
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.cursor -= self.start;
            self.start = 0;
            self.end = live;
        }
        if self.buf.len() - self.end < min {
            let need = self.end + min;
            let new_len = need.next_power_of_two().max(self.buf.len() * 2);
            self.buf.resize(new_len, 0);
        }
        debug_assert!(self.check_invariant());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn framed(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn frames_one_message() {
        let mut buf = WireBuffer::default();
        buf.extend(&framed(b'C', b"SELECT 1\0"));
        let frame = buf.try_frame().unwrap();
        assert_eq!(frame.tag, b'C');
        assert_eq!(&frame.payload[..], b"SELECT 1\0");
        assert!(buf.try_frame().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut buf = WireBuffer::default();
        let msg = framed(b'D', &[0, 1, 0, 0, 0, 2, b'h', b'i']);
        let (head, tail) = msg.split_at(7);
        buf.extend(head);
        assert!(buf.try_frame().is_none());
        assert!(buf.check_invariant());
        buf.extend(tail);
        let frame = buf.try_frame().unwrap();
        assert_eq!(frame.tag, b'D');
    }

    #[test]
    fn frames_back_to_back_messages() {
        let mut buf = WireBuffer::default();
        buf.extend(&framed(b'1', b""));
        buf.extend(&framed(b'2', b""));
        buf.extend(&framed(b'Z', b"I"));
        assert_eq!(buf.try_frame().unwrap().tag, b'1');
        assert_eq!(buf.try_frame().unwrap().tag, b'2');
        let frame = buf.try_frame().unwrap();
        assert_eq!(frame.tag, b'Z');
        assert_eq!(&frame.payload[..], b"I");
    }

    #[test]
    fn grows_and_compacts_under_load() {
        let mut buf = WireBuffer::with_capacity(64);
        let big = vec![0xABu8; 1000];
        for _ in 0..10 {
            buf.extend(&framed(b'd', &big));
            assert!(buf.check_invariant());
        }
        let mut seen = 0;
        while let Some(frame) = buf.try_frame() {
            assert_eq!(frame.payload.len(), 1000);
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn consume_drains_writable_side() {
        let mut buf = WireBuffer::default();
        buf.extend(b"hello world");
        assert_eq!(buf.readable(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.readable(), b"world");
        buf.consume(5);
        assert!(buf.is_empty());
        assert!(buf.check_invariant());
    }
}
