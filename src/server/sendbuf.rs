//! Vectored output queue with zero-copy chained segments.
//!
//! Small writes are coalesced into a tail buffer; large engine-owned
//! values are chained as separately-owned [`Bytes`] segments with a
//! release callback that runs once the bytes have been handed to the
//! kernel (or the connection is torn down). Ownership of a chained
//! segment transfers to the queue only when the attach succeeds.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Callback invoked after a chained segment has been fully transmitted
/// or the queue is dropped.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

struct Segment {
    data: Bytes,
    release: Option<ReleaseFn>,
}

impl Segment {
    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.release();
    }
}

/// A rejected chain attach, handing the segment back to the caller.
pub struct ChainRejected {
    /// The data that was not attached
    pub data: Bytes,
    /// The release callback that was not attached
    pub release: Option<ReleaseFn>,
}

impl std::fmt::Debug for ChainRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRejected")
            .field("len", &self.data.len())
            .finish()
    }
}

/// The per-connection send queue.
pub struct OutputQueue {
    tail: BytesMut,
    segments: VecDeque<Segment>,
    queued: usize,
    max_size: usize,
}

impl OutputQueue {
    /// Create a queue bounded at `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            tail: BytesMut::with_capacity(8 * 1024),
            segments: VecDeque::new(),
            queued: 0,
            max_size,
        }
    }

    /// Bytes queued and not yet written.
    #[inline]
    pub fn len(&self) -> usize {
        self.queued
    }

    /// True when nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Copy `bytes` into the queue. Fails when the queue is full.
    pub fn copy(&mut self, bytes: &[u8]) -> Result<(), usize> {
        if self.queued + bytes.len() > self.max_size {
            return Err(self.queued + bytes.len());
        }
        self.tail.extend_from_slice(bytes);
        self.queued += bytes.len();
        Ok(())
    }

    /// Attach an owned segment without copying. On failure the segment is
    /// handed back and the queue is unchanged.
    pub fn chain(
        &mut self,
        data: Bytes,
        release: Option<ReleaseFn>,
    ) -> Result<(), ChainRejected> {
        if self.queued + data.len() > self.max_size {
            return Err(ChainRejected { data, release });
        }
        self.seal_tail();
        self.queued += data.len();
        self.segments.push_back(Segment { data, release });
        Ok(())
    }

    fn seal_tail(&mut self) {
        if !self.tail.is_empty() {
            let data = self.tail.split().freeze();
            self.segments.push_back(Segment {
                data,
                release: None,
            });
        }
    }

    /// Write one segment's worth of bytes to `io`. Returns the number of
    /// bytes accepted by the kernel (0 when the queue is empty).
    pub async fn write_some<W>(&mut self, io: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        self.seal_tail();
        let Some(front) = self.segments.front_mut() else {
            return Ok(0);
        };

        let written = io.write(&front.data).await?;
        front.data.advance(written);
        self.queued -= written;
        if front.data.is_empty() {
            // Dropping the segment runs its release callback.
            self.segments.pop_front();
        }
        Ok(written)
    }

    /// Drop everything queued, running release callbacks.
    pub fn clear(&mut self) {
        self.tail.clear();
        self.segments.clear();
        self.queued = 0;
    }
}

impl std::fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputQueue")
            .field("queued", &self.queued)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn copy_then_write() {
        let mut queue = OutputQueue::new(1024);
        queue.copy(b"hello ").unwrap();
        queue.copy(b"world").unwrap();
        assert_eq!(queue.len(), 11);

        let mut sink = Vec::new();
        while !queue.is_empty() {
            queue.write_some(&mut sink).await.unwrap();
        }
        assert_eq!(&sink, b"hello world");
    }

    #[tokio::test]
    async fn chained_segment_preserves_order_and_releases() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let mut queue = OutputQueue::new(1024);
        queue.copy(b"head:").unwrap();
        queue
            .chain(
                Bytes::from_static(b"payload"),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        queue.copy(b":tail").unwrap();

        let mut sink = Vec::new();
        while !queue.is_empty() {
            queue.write_some(&mut sink).await.unwrap();
        }
        assert_eq!(&sink, b"head:payload:tail");
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn full_queue_rejects_copy() {
        let mut queue = OutputQueue::new(8);
        queue.copy(b"12345678").unwrap();
        assert!(queue.copy(b"9").is_err());
    }

    #[test]
    fn rejected_chain_returns_ownership() {
        let mut queue = OutputQueue::new(4);
        let rejected = queue
            .chain(Bytes::from_static(b"too large"), None)
            .unwrap_err();
        assert_eq!(&rejected.data[..], b"too large");
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_runs_release_callbacks() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let mut queue = OutputQueue::new(1024);
        queue
            .chain(
                Bytes::from_static(b"data"),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        queue.clear();
        assert!(released.load(Ordering::SeqCst));
        assert!(queue.is_empty());
    }
}
