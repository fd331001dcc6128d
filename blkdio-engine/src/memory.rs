//! A RAM-backed device queue.
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::{fmt, io};

use parking_lot::{Condvar, Mutex, RwLock};
use rustix::io::Errno;

use crate::queue::{Cookie, DeviceQueue};
use crate::segment::{BlkStatus, Op, Segment};

/// Number of empty rounds a spinning [`MemoryQueue::poll`] tries before giving up.
const POLL_SPIN_ROUNDS: usize = 64;

/// Where segments submitted to a [`MemoryQueue`] are completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// On the submitting thread, before `submit` returns.
    Inline,
    /// On a pool of worker threads, or on a thread calling [`DeviceQueue::poll`].
    Threaded(NonZeroUsize),
}

/// A snapshot of [`MemoryQueue`] counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryQueueStats {
    pub segments: u64,
    pub batches: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    segments: AtomicU64,
    batches: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

struct Shared {
    logical_block_size: u32,
    data: RwLock<Box<[u8]>>,
    read_only: AtomicBool,
    errors: Mutex<Vec<(Range<u64>, BlkStatus)>>,
    pending: Mutex<VecDeque<Segment>>,
    pending_cond: Condvar,
    stopping: AtomicBool,
    next_cookie: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn capacity(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn process(&self, seg: Segment) {
        let status = self.transfer(&seg);
        seg.complete(status);
    }

    fn transfer(&self, seg: &Segment) -> BlkStatus {
        let off = seg.offset();
        let Some(end) = off.checked_add(seg.len() as u64) else {
            return BlkStatus::IoErr;
        };
        if let Some(status) = self
            .errors
            .lock()
            .iter()
            .find(|(range, _)| range.start < end && off < range.end)
            .map(|&(_, status)| status)
        {
            tracing::debug!(off, len = seg.len(), %status, "injected error");
            return status;
        }

        let range = off as usize..end as usize;
        match seg.op() {
            Op::Read => {
                let data = self.data.read();
                let Some(src) = data.get(range) else {
                    tracing::warn!(off, len = seg.len(), "read beyond the end of device");
                    return BlkStatus::IoErr;
                };
                seg.fill_from_slice(src);
                self.counters
                    .bytes_read
                    .fetch_add(seg.len() as u64, Ordering::Relaxed);
            }
            Op::Write => {
                if self.read_only.load(Ordering::Relaxed) {
                    tracing::warn!(off, len = seg.len(), "write to read-only device");
                    return BlkStatus::IoErr;
                }
                let mut data = self.data.write();
                let Some(dest) = data.get_mut(range) else {
                    tracing::warn!(off, len = seg.len(), "write beyond the end of device");
                    return BlkStatus::IoErr;
                };
                seg.copy_to_slice(dest);
                self.counters
                    .bytes_written
                    .fetch_add(seg.len() as u64, Ordering::Relaxed);
            }
        }
        BlkStatus::Ok
    }

    /// Complete all queued segments on the current thread.
    fn reap(&self) -> bool {
        let segs = std::mem::take(&mut *self.pending.lock());
        let found = !segs.is_empty();
        for seg in segs {
            self.process(seg);
        }
        found
    }

    fn worker(&self) {
        loop {
            let seg = {
                let mut pending = self.pending.lock();
                loop {
                    if let Some(seg) = pending.pop_front() {
                        break seg;
                    }
                    // Drain everything before exiting.
                    if self.stopping.load(Ordering::Acquire) {
                        return;
                    }
                    self.pending_cond.wait(&mut pending);
                }
            };
            self.process(seg);
        }
    }
}

/// A device backed by memory, for testing and benchmarking the engine.
///
/// Errors can be injected per byte range with [`MemoryQueue::inject_error`]: any segment
/// overlapping the range completes with the given status without transferring data.
pub struct MemoryQueue {
    shared: Arc<Shared>,
    mode: CompletionMode,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("capacity", &self.capacity())
            .field("logical_block_size", &self.shared.logical_block_size)
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryQueue {
    /// Create a zero-filled device of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panic if `logical_block_size` is not a power of two of at least 512, or `capacity` is not
    /// a multiple of it.
    pub fn new(capacity: u64, logical_block_size: u32, mode: CompletionMode) -> io::Result<Self> {
        assert!(logical_block_size.is_power_of_two() && logical_block_size >= 512);
        assert_eq!(capacity % u64::from(logical_block_size), 0);
        let len =
            usize::try_from(capacity).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let shared = Arc::new(Shared {
            logical_block_size,
            data: RwLock::new(vec![0u8; len].into_boxed_slice()),
            read_only: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            next_cookie: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let nr_workers = match mode {
            CompletionMode::Inline => 0,
            CompletionMode::Threaded(n) => n.get(),
        };
        let mut this = Self {
            shared,
            mode,
            workers: Vec::with_capacity(nr_workers),
        };
        for i in 0..nr_workers {
            let shared = Arc::clone(&this.shared);
            let handle = thread::Builder::new()
                .name(format!("memq-worker-{i}"))
                .spawn(move || shared.worker())?;
            this.workers.push(handle);
        }
        tracing::debug!(capacity, logical_block_size, ?mode, "memory queue created");
        Ok(this)
    }

    #[must_use]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Fail every following segment touching `range` with `status`.
    pub fn inject_error(&self, range: Range<u64>, status: BlkStatus) {
        assert!(!status.is_ok(), "injecting a success");
        self.shared.errors.lock().push((range, status));
    }

    pub fn clear_errors(&self) {
        self.shared.errors.lock().clear();
    }

    /// Copy device content at `off` into `out`, bypassing the queue.
    ///
    /// # Panics
    ///
    /// Panic if the range is out of bounds.
    pub fn read_at(&self, off: u64, out: &mut [u8]) {
        let off = off as usize;
        out.copy_from_slice(&self.shared.data.read()[off..off + out.len()]);
    }

    /// Copy `data` into the device at `off`, bypassing the queue.
    ///
    /// # Panics
    ///
    /// Panic if the range is out of bounds.
    pub fn write_at(&self, off: u64, data: &[u8]) {
        let off = off as usize;
        self.shared.data.write()[off..off + data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn stats(&self) -> MemoryQueueStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let c = &self.shared.counters;
        MemoryQueueStats {
            segments: get(&c.segments),
            batches: get(&c.batches),
            bytes_read: get(&c.bytes_read),
            bytes_written: get(&c.bytes_written),
        }
    }

    fn fill_zeroes(&self, off: u64, len: u64) -> Result<(), Errno> {
        let lbs = u64::from(self.shared.logical_block_size);
        let end = off.checked_add(len).ok_or(Errno::INVAL)?;
        if (off | len) % lbs != 0 || end > self.capacity() {
            return Err(Errno::INVAL);
        }
        if self.is_read_only() {
            return Err(Errno::PERM);
        }
        self.shared.data.write()[off as usize..end as usize].fill(0);
        Ok(())
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        {
            // Synchronize with workers checking the flag under the lock.
            let _pending = self.shared.pending.lock();
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.shared.pending_cond.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("memory queue worker panicked");
            }
        }
        // Nothing is left for inline mode, or after all workers drained the queue.
        self.shared.reap();
    }
}

impl DeviceQueue for MemoryQueue {
    fn logical_block_size(&self) -> u32 {
        self.shared.logical_block_size
    }

    fn capacity(&self) -> u64 {
        self.shared.capacity()
    }

    fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Relaxed)
    }

    fn submit(&self, seg: Segment) -> Option<Cookie> {
        self.shared.counters.segments.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            CompletionMode::Inline => {
                self.shared.process(seg);
                None
            }
            CompletionMode::Threaded(_) => {
                let cookie = Cookie(self.shared.next_cookie.fetch_add(1, Ordering::Relaxed));
                self.shared.pending.lock().push_back(seg);
                self.shared.pending_cond.notify_one();
                Some(cookie)
            }
        }
    }

    fn submit_batch(&self, segs: &mut Vec<Segment>) {
        self.shared.counters.batches.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            CompletionMode::Inline => {
                for seg in segs.drain(..) {
                    self.submit(seg);
                }
            }
            CompletionMode::Threaded(_) => {
                self.shared
                    .counters
                    .segments
                    .fetch_add(segs.len() as u64, Ordering::Relaxed);
                self.shared.pending.lock().extend(segs.drain(..));
                self.shared.pending_cond.notify_all();
            }
        }
    }

    fn poll(&self, _cookie: Cookie, spin: bool) -> bool {
        let rounds = if spin { POLL_SPIN_ROUNDS } else { 1 };
        for _ in 0..rounds {
            if self.shared.reap() {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn discard(&self, off: u64, len: u64) -> Result<(), Errno> {
        self.fill_zeroes(off, len)
    }

    fn write_zeroes(&self, off: u64, len: u64, _unmap: bool) -> Result<(), Errno> {
        self.fill_zeroes(off, len)
    }
}
