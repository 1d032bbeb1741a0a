/*
 * buffer.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an event-driven HTTP/1.1 and HTTP/2 engine.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Send and receive staging buffers.
//!
//! `WriteBuf` is the two-stage send path: small spans are copied into a
//! bounded merge area so many tiny frames become one write; the first span
//! that would overflow it is kept as a zero-copy tail. `RecvBuf` is the
//! HTTP/1.1 accumulator: grows on demand, tracks a monotonic consumed offset,
//! and releases its allocation once fully drained after having grown.

use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};

/// Merge area bound. Sized to trade syscall count against MTU/TLS-record
/// size.
pub(crate) const MERGE_LIMIT: usize = 16 * 1024;

/// Default receive accumulator capacity.
pub(crate) const RECV_DEFAULT: usize = 16 * 1024;

/// Per-call socket read size.
pub(crate) const RECV_CHUNK: usize = 16 * 1024;

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushStep {
    /// Bytes accepted by the writer during this attempt.
    pub sent: usize,
    /// Unsent bytes remain staged; writable interest must stay registered.
    pub pending: bool,
}

/// Two-stage send staging: an inline merge buffer plus a zero-copy tail span.
///
/// Invariant: once a tail is staged no further spans are accepted until it
/// drains, and a partially written region is re-presented with the identical
/// address and length on the next attempt (required for TLS wants-write
/// retries).
#[derive(Debug, Default)]
pub(crate) struct WriteBuf {
    merge: BytesMut,
    tail: Option<Bytes>,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.merge.is_empty() && self.tail.is_none()
    }

    pub fn has_tail(&self) -> bool {
        self.tail.is_some()
    }

    /// Remaining unsent tail span, if any.
    #[cfg(test)]
    pub fn tail(&self) -> Option<&Bytes> {
        self.tail.as_ref()
    }

    /// Stage one outgoing span. Small spans are copied into the merge area;
    /// a span that no longer fits becomes the tail. Returns false when the
    /// buffer cannot take more (a tail is already staged).
    pub fn stage(&mut self, span: Bytes) -> bool {
        if self.tail.is_some() {
            return false;
        }
        if span.is_empty() {
            return true;
        }
        if self.merge.len() + span.len() <= MERGE_LIMIT {
            self.merge.extend_from_slice(&span);
        } else {
            self.tail = Some(span);
        }
        true
    }

    /// One write attempt against the merge area, then (only if the merge
    /// area fully drained) one against the tail. WouldBlock and Interrupted
    /// are reported as a pending step, not an error; partial writes leave the
    /// remainder staged unchanged.
    pub fn flush_once<W: Write>(&mut self, w: &mut W) -> io::Result<FlushStep> {
        let mut sent = 0;

        if !self.merge.is_empty() {
            match w.write(&self.merge) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.merge.advance(n);
                    sent += n;
                    if !self.merge.is_empty() {
                        return Ok(FlushStep { sent, pending: true });
                    }
                }
                Err(e) if is_transient(&e) => return Ok(FlushStep { sent, pending: true }),
                Err(e) => return Err(e),
            }
        }

        if let Some(tail) = self.tail.as_mut() {
            match w.write(tail) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    tail.advance(n);
                    sent += n;
                    if tail.is_empty() {
                        self.tail = None;
                    } else {
                        return Ok(FlushStep { sent, pending: true });
                    }
                }
                Err(e) if is_transient(&e) => return Ok(FlushStep { sent, pending: true }),
                Err(e) => return Err(e),
            }
        }

        Ok(FlushStep {
            sent,
            pending: !self.is_empty(),
        })
    }
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Growable accumulator for the HTTP/1.1 parser. Compaction of the consumed
/// prefix is delegated to `BytesMut::reserve`; `alloced` tracks the requested
/// allocation so a grown buffer can be released after drain, and `offset`
/// counts every consumed byte for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct RecvBuf {
    buf: BytesMut,
    alloced: usize,
    offset: u64,
}

impl RecvBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        let need = self.buf.len() + chunk.len();
        if self.alloced == 0 {
            self.alloced = RECV_DEFAULT.max(need);
            self.buf.reserve(self.alloced);
        } else {
            if need > self.alloced {
                self.alloced = need;
            }
            self.buf.reserve(chunk.len());
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes consumed over the lifetime of the session.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn alloced(&self) -> usize {
        self.alloced
    }

    /// Discard `n` unconsumed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
        self.offset += n as u64;
    }

    /// Detach `n` bytes from the front as an owned slice.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.offset += n as u64;
        self.buf.split_to(n).freeze()
    }

    /// Release the allocation once fully drained after growing past the
    /// default capacity. The next append reallocates at the default.
    pub fn reclaim(&mut self) {
        if self.buf.is_empty() && self.alloced > RECV_DEFAULT {
            self.buf = BytesMut::new();
            self.alloced = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `limit` bytes per call and records every
    /// (address, length) pair presented to it.
    struct ShortWriter {
        limit: usize,
        out: Vec<u8>,
        calls: usize,
        presented: Vec<(usize, usize)>,
    }

    impl ShortWriter {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                out: Vec::new(),
                calls: 0,
                presented: Vec::new(),
            }
        }
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            self.presented.push((buf.as_ptr() as usize, buf.len()));
            let n = self.limit.min(buf.len());
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that accepts `before` bytes, then returns WouldBlock once, then
    /// accepts everything.
    struct BlockingWriter {
        before: usize,
        blocked: bool,
        out: Vec<u8>,
        presented: Vec<(usize, usize)>,
    }

    impl Write for BlockingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.presented.push((buf.as_ptr() as usize, buf.len()));
            if !self.blocked && self.out.len() >= self.before {
                self.blocked = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = if self.blocked {
                buf.len()
            } else {
                buf.len().min(self.before - self.out.len())
            };
            if n == 0 {
                self.blocked = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain<W: Write>(wb: &mut WriteBuf, w: &mut W) -> usize {
        let mut total = 0;
        loop {
            let step = wb.flush_once(w).unwrap();
            total += step.sent;
            // send-buffer invariant: after each step the buffer is either
            // idle or flagged pending
            assert_eq!(step.pending, !wb.is_empty());
            if step.sent == 0 {
                break;
            }
        }
        total
    }

    #[test]
    fn small_spans_merge_into_one_write() {
        let mut wb = WriteBuf::new();
        for _ in 0..8 {
            assert!(wb.stage(Bytes::from_static(b"frame")));
        }
        let mut w = ShortWriter::new(usize::MAX);
        let sent = drain(&mut wb, &mut w);
        assert_eq!(sent, 40);
        assert_eq!(w.calls, 1);
        assert_eq!(w.out, b"frame".repeat(8));
    }

    #[test]
    fn oversize_span_becomes_tail_not_copied() {
        let mut wb = WriteBuf::new();
        assert!(wb.stage(Bytes::from_static(b"head")));
        let big = Bytes::from(vec![0x42u8; MERGE_LIMIT]);
        let big_ptr = big.as_ptr() as usize;
        assert!(wb.stage(big));
        assert!(wb.has_tail());
        // tail rejects further staging until drained
        assert!(!wb.stage(Bytes::from_static(b"more")));
        assert_eq!(wb.tail().unwrap().as_ptr() as usize, big_ptr);
    }

    #[test]
    fn partial_writes_need_one_attempt_per_byte() {
        // a 4000-byte response through a one-byte-per-write socket
        let mut wb = WriteBuf::new();
        wb.stage(Bytes::from(vec![7u8; 4000]));
        let mut w = ShortWriter::new(1);
        let sent = drain(&mut wb, &mut w);
        assert_eq!(sent, 4000);
        assert_eq!(w.calls, 4000);
        assert!(wb.is_empty());
    }

    #[test]
    fn blocked_tail_is_represented_with_identical_span() {
        let payload = vec![9u8; MERGE_LIMIT + 1024];
        let mut wb = WriteBuf::new();
        wb.stage(Bytes::from(payload.clone()));
        assert!(wb.has_tail());

        let mut w = BlockingWriter {
            before: 100,
            blocked: false,
            out: Vec::new(),
            presented: Vec::new(),
        };

        let step = wb.flush_once(&mut w).unwrap();
        assert_eq!(step.sent, 100);
        assert!(step.pending);
        let step = wb.flush_once(&mut w).unwrap();
        assert_eq!(step.sent, 0);
        assert!(step.pending);

        // the blocked attempt presents the remainder right after the
        // accepted bytes
        let n = w.presented.len();
        assert_eq!(
            w.presented[n - 1],
            (w.presented[n - 2].0 + 100, payload.len() - 100)
        );
        let retry = w.presented[n - 1];

        let step = wb.flush_once(&mut w).unwrap();
        assert_eq!(step.sent, payload.len() - 100);
        assert!(!step.pending);
        assert_eq!(*w.presented.last().unwrap(), retry);
        // no duplicate bytes across the retry
        assert_eq!(w.out, payload);
    }

    #[test]
    fn merge_partial_is_compacted_and_resumed() {
        let mut wb = WriteBuf::new();
        wb.stage(Bytes::from_static(b"abcdefgh"));
        let mut w = ShortWriter::new(3);
        let step = wb.flush_once(&mut w).unwrap();
        assert_eq!(step.sent, 3);
        assert!(step.pending);
        let sent = drain(&mut wb, &mut w);
        assert_eq!(sent, 5);
        assert_eq!(w.out, b"abcdefgh");
    }

    #[test]
    fn recv_buf_tracks_offset_and_reclaims() {
        let mut rb = RecvBuf::new();
        rb.append(&vec![1u8; 4 * RECV_DEFAULT]);
        assert!(rb.alloced() >= 4 * RECV_DEFAULT);
        assert_eq!(rb.len(), 4 * RECV_DEFAULT);

        rb.consume(RECV_DEFAULT);
        assert_eq!(rb.offset(), RECV_DEFAULT as u64);
        rb.reclaim();
        // not yet drained: allocation stays
        assert!(rb.alloced() > 0);

        let rest = rb.take(3 * RECV_DEFAULT);
        assert_eq!(rest.len(), 3 * RECV_DEFAULT);
        assert_eq!(rb.offset(), 4 * (RECV_DEFAULT as u64));
        rb.reclaim();
        // fully drained after growing past the default: allocation released
        assert_eq!(rb.alloced(), 0);

        rb.append(b"next");
        assert!(rb.alloced() >= RECV_DEFAULT);
        assert_eq!(rb.data(), b"next");
    }

    #[test]
    fn recv_buf_default_capacity_is_kept() {
        let mut rb = RecvBuf::new();
        rb.append(b"hello");
        assert_eq!(rb.alloced(), RECV_DEFAULT);
        rb.consume(5);
        rb.reclaim();
        // never grew past the default: nothing to release
        assert_eq!(rb.alloced(), RECV_DEFAULT);
    }
}
