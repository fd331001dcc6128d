//! Per-request completion state shared by all segments of one request.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::segment::BlkStatus;

/// The asynchronous completion target of a request.
pub type AioDone = Box<dyn FnOnce(AioCompletion) + Send + 'static>;

/// Result delivered to an [`AioDone`] callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioCompletion {
    /// The request position advanced by the bytes transferred, or unchanged on failure.
    pub pos: u64,
    pub res: Result<usize, Errno>,
}

/// The blocked submitter of a synchronous request.
///
/// The completion side clears `pending` with a release store before unparking, and the waiter
/// checks it with an acquire load, so the final wake can never be missed.
#[derive(Debug)]
pub(crate) struct Waiter {
    thread: Thread,
    pending: AtomicBool,
}

impl Waiter {
    pub(crate) fn current() -> Self {
        Self {
            thread: thread::current(),
            pending: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Sleep until woken, or spuriously. Must be called on the thread that created it.
    pub(crate) fn park(&self) {
        debug_assert_eq!(thread::current().id(), self.thread.id());
        thread::park();
    }

    fn wake(&self) {
        // NB. Clone first. The waiter may free `self` right after the store.
        let thread = self.thread.clone();
        self.pending.store(false, Ordering::Release);
        thread.unpark();
    }
}

/// Status that only ever transitions once from ok to the first error recorded.
#[derive(Debug, Default)]
struct StickyStatus(AtomicU8);

impl StickyStatus {
    fn record(&self, status: BlkStatus) -> bool {
        !status.is_ok()
            && self
                .0
                .compare_exchange(
                    BlkStatus::Ok as u8,
                    status as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    fn get(&self) -> BlkStatus {
        BlkStatus::from_raw(self.0.load(Ordering::Acquire))
    }
}

/// Completion state of the single-segment synchronous path.
#[derive(Debug)]
pub(crate) struct SyncDone {
    waiter: Waiter,
    status: StickyStatus,
    should_dirty: bool,
}

impl SyncDone {
    pub(crate) fn new(should_dirty: bool) -> Self {
        Self {
            waiter: Waiter::current(),
            status: StickyStatus::default(),
            should_dirty,
        }
    }

    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub(crate) fn should_dirty(&self) -> bool {
        self.should_dirty
    }

    pub(crate) fn status(&self) -> BlkStatus {
        self.status.get()
    }

    pub(crate) fn complete(&self, status: BlkStatus) {
        self.status.record(status);
        self.waiter.wake();
    }
}

pub(crate) enum Delivery {
    Blocking(Waiter),
    Async {
        pos: u64,
        done: Mutex<Option<AioDone>>,
    },
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(waiter) => f.debug_tuple("Blocking").field(waiter).finish(),
            Self::Async { pos, .. } => f
                .debug_struct("Async")
                .field("pos", pos)
                .finish_non_exhaustive(),
        }
    }
}

/// The request aggregate.
///
/// `refs` counts the segments not completed yet, but only once `multi` is set: a single-segment
/// request is finalized by its only completion without touching it. On the transition to
/// multiple segments it is set to 2, covering the segment being submitted and the one about to
/// be built, and each further segment adds one.
#[derive(Debug)]
pub(crate) struct Dio {
    delivery: Delivery,
    size: AtomicUsize,
    refs: AtomicU32,
    multi: AtomicBool,
    status: StickyStatus,
    should_dirty: bool,
    /// Keeps an asynchronous multi-segment request alive until its last completion. Set once on
    /// the `multi` transition, taken once on finalization.
    keep_alive: Mutex<Option<Arc<Dio>>>,
}

impl Dio {
    pub(crate) fn new(delivery: Delivery, should_dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            delivery,
            size: AtomicUsize::new(0),
            refs: AtomicU32::new(0),
            multi: AtomicBool::new(false),
            status: StickyStatus::default(),
            should_dirty,
            keep_alive: Mutex::new(None),
        })
    }

    pub(crate) fn should_dirty(&self) -> bool {
        self.should_dirty
    }

    pub(crate) fn is_sync(&self) -> bool {
        matches!(self.delivery, Delivery::Blocking(_))
    }

    pub(crate) fn waiter(&self) -> Option<&Waiter> {
        match &self.delivery {
            Delivery::Blocking(waiter) => Some(waiter),
            Delivery::Async { .. } => None,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn add_size(&self, len: usize) {
        self.size.fetch_add(len, Ordering::Release);
    }

    pub(crate) fn status(&self) -> BlkStatus {
        self.status.get()
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn is_multi(&self) -> bool {
        self.multi.load(Ordering::Acquire)
    }

    /// Account one more segment. Must be called before submitting any segment but the last one.
    pub(crate) fn get_segment(self: &Arc<Self>) {
        if self.is_multi() {
            self.refs.fetch_add(1, Ordering::AcqRel);
            return;
        }
        if !self.is_sync() {
            let prev = self.keep_alive.lock().replace(Arc::clone(self));
            assert!(prev.is_none());
        }
        self.refs.store(2, Ordering::Release);
        self.multi.store(true, Ordering::Release);
    }

    /// The completion hook of each segment.
    pub(crate) fn end_segment(&self, status: BlkStatus) {
        if self.status.record(status) {
            tracing::debug!(%status, "request failed");
        }
        if !self.is_multi() || self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        match &self.delivery {
            Delivery::Async { pos, done } => {
                let res = self.status().into_result().map(|()| self.size());
                let pos = match res {
                    Ok(len) => pos + len as u64,
                    Err(_) => *pos,
                };
                let done = done.lock().take().expect("request finalized twice");
                done(AioCompletion { pos, res });
                if self.is_multi() {
                    // This is never the last reference, the completing segment still holds one.
                    drop(self.keep_alive.lock().take());
                }
            }
            Delivery::Blocking(waiter) => waiter.wake(),
        }
    }
}
