use std::fmt;
use std::mem;

use rustix::io::Errno;

use crate::segment::Segment;

/// Maximum number of segments held by a [`BatchScope`] before it is flushed early.
pub const MAX_BATCH: usize = 32;

/// Opaque handle of a submitted segment, used to poll for its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u64);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A device accepting [`Segment`]s.
///
/// Every submitted segment must eventually be finished with [`Segment::complete`], from any
/// thread, possibly before `submit` returns.
pub trait DeviceQueue: Send + Sync {
    /// In bytes. A power of two of at least 512.
    fn logical_block_size(&self) -> u32;

    /// Device size in bytes.
    fn capacity(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Submit one segment. Returns a cookie if the completion can be polled with
    /// [`DeviceQueue::poll`].
    fn submit(&self, seg: Segment) -> Option<Cookie>;

    /// Submit all segments in `segs` at once, leaving it empty.
    fn submit_batch(&self, segs: &mut Vec<Segment>) {
        for seg in segs.drain(..) {
            self.submit(seg);
        }
    }

    /// Reap completions of `cookie`, and others on the same hardware queue. Returns whether any
    /// completion was reaped.
    ///
    /// If `spin` is true, keep trying until something is found.
    fn poll(&self, _cookie: Cookie, _spin: bool) -> bool {
        false
    }

    /// Make all completed writes durable.
    fn flush(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn discard(&self, _off: u64, _len: u64) -> Result<(), Errno> {
        Err(Errno::OPNOTSUPP)
    }

    fn write_zeroes(&self, _off: u64, _len: u64, _unmap: bool) -> Result<(), Errno> {
        Err(Errno::OPNOTSUPP)
    }
}

/// Collects segments submitted by one thread and dispatches them together when closed.
///
/// The scope is flushed when it is dropped, including on early returns and unwinding, so no
/// collected segment is ever lost.
pub struct BatchScope<'q, Q: DeviceQueue + ?Sized> {
    queue: &'q Q,
    pending: Vec<Segment>,
}

impl<Q: DeviceQueue + ?Sized> fmt::Debug for BatchScope<'_, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScope")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<'q, Q: DeviceQueue + ?Sized> BatchScope<'q, Q> {
    pub fn new(queue: &'q Q) -> Self {
        Self {
            queue,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn add(&mut self, seg: Segment) {
        self.pending.push(seg);
        if self.pending.len() >= MAX_BATCH {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::trace!(len = self.pending.len(), "flushing batch");
        let mut segs = mem::take(&mut self.pending);
        self.queue.submit_batch(&mut segs);
        debug_assert!(segs.is_empty());
        // Keep the allocation.
        self.pending = segs;
    }
}

impl<Q: DeviceQueue + ?Sized> Drop for BatchScope<'_, Q> {
    fn drop(&mut self) {
        self.flush();
    }
}
