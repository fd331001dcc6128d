//! The submission side: splitting one request into segments and waiting for the result.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::dio::{AioDone, Delivery, Dio, SyncDone, Waiter};
use crate::iter::IoIter;
use crate::pool::{SegVecs, SegmentPool};
use crate::queue::{BatchScope, Cookie, DeviceQueue};
use crate::segment::{BlkStatus, EndIo, Op, ReqFlags, Segment};
use crate::Sector;

/// Default maximum number of page vectors in one segment.
pub const MAX_SEGMENT_VECS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of page vectors in one segment. Requests spanning more pages are split.
    pub max_segment_vecs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_segment_vecs: MAX_SEGMENT_VECS,
        }
    }
}

bitflags::bitflags! {
    /// Behavioral flags of a request.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        /// Bypass caches. The engine only serves direct requests; file layers check this.
        const Direct = 1 << 0;
        /// Fail with `EAGAIN` instead of blocking.
        const Nowait = 1 << 1;
        /// Writes are durable on completion.
        const Dsync = 1 << 2;
        /// Poll for completion instead of sleeping.
        const Hipri = 1 << 3;
    }
}

/// Position and attributes of a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Iocb {
    /// Starting byte offset on the device.
    pub pos: u64,
    pub flags: IoFlags,
    pub ioprio: u16,
}

impl Iocb {
    #[must_use]
    pub fn new(pos: u64, flags: IoFlags) -> Self {
        Self {
            pos,
            flags,
            ioprio: 0,
        }
    }
}

/// How the result of a request is delivered.
pub enum Completion {
    /// Block the submitting thread until the request completes.
    Wait,
    /// Return immediately and invoke the callback exactly once on completion, from whichever
    /// thread completes the last segment.
    Notify(AioDone),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => f.write_str("Wait"),
            Self::Notify(_) => f.write_str("Notify(..)"),
        }
    }
}

/// The immediate outcome of [`DirectIo::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Completed synchronously with the number of bytes transferred.
    Done(usize),
    /// Queued. The callback will be invoked. For polled requests, `cookie` refers to the last
    /// segment and can be passed to [`DirectIo::iopoll`].
    Queued { cookie: Option<Cookie> },
}

#[derive(Debug, Default)]
struct IoAccounting {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    segments: AtomicU64,
    simple_requests: AtomicU64,
    general_requests: AtomicU64,
    nowait_rejects: AtomicU64,
    alignment_rejects: AtomicU64,
}

/// A snapshot of engine counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    /// Bytes submitted for reading.
    pub bytes_read: u64,
    /// Bytes submitted for writing.
    pub bytes_written: u64,
    pub segments: u64,
    pub simple_requests: u64,
    pub general_requests: u64,
    pub nowait_rejects: u64,
    pub alignment_rejects: u64,
}

/// The direct I/O engine of one device queue.
pub struct DirectIo<Q: DeviceQueue + ?Sized> {
    queue: Arc<Q>,
    pool: Arc<SegmentPool>,
    config: EngineConfig,
    accounting: IoAccounting,
}

impl<Q: DeviceQueue + ?Sized> fmt::Debug for DirectIo<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectIo")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .field("accounting", &self.accounting)
            .finish_non_exhaustive()
    }
}

impl<Q: DeviceQueue + ?Sized> DirectIo<Q> {
    /// # Panics
    ///
    /// Panic if `config.max_segment_vecs` is zero, or the logical block size of `queue` is not a
    /// power of two of at least one sector.
    pub fn new(queue: Arc<Q>, pool: Arc<SegmentPool>, config: EngineConfig) -> Self {
        assert_ne!(config.max_segment_vecs, 0);
        let lbs = queue.logical_block_size();
        assert!(lbs.is_power_of_two() && lbs >= Sector::SIZE);
        Self {
            queue,
            pool,
            config,
            accounting: IoAccounting::default(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let a = &self.accounting;
        IoStats {
            bytes_read: get(&a.bytes_read),
            bytes_written: get(&a.bytes_written),
            segments: get(&a.segments),
            simple_requests: get(&a.simple_requests),
            general_requests: get(&a.general_requests),
            nowait_rejects: get(&a.nowait_rejects),
            alignment_rejects: get(&a.alignment_rejects),
        }
    }

    /// Poll the device queue for the completion of a polled request.
    pub fn iopoll(&self, cookie: Cookie, spin: bool) -> bool {
        self.queue.poll(cookie, spin)
    }

    /// Submit the request of `iter.count()` bytes starting at `iocb.pos`.
    ///
    /// `iter` is advanced past everything handed to the device. If the request is rejected with
    /// `EAGAIN` because of [`IoFlags::Nowait`], it is left untouched and nothing is submitted.
    pub fn submit(
        &self,
        iocb: &Iocb,
        iter: &mut IoIter,
        completion: Completion,
    ) -> Result<Submitted, Errno> {
        if iter.count() == 0 {
            return Ok(Submitted::Done(0));
        }
        let max = self.config.max_segment_vecs;
        let nr_pages = iter.npages(max.saturating_add(1));
        match completion {
            Completion::Wait if nr_pages <= max => {
                self.submit_simple(iocb, iter, nr_pages).map(Submitted::Done)
            }
            completion => self.submit_general(iocb, iter, nr_pages.min(max), completion),
        }
    }

    fn check_alignment(&self, pos: u64, iter: &IoIter) -> Result<(), Errno> {
        let lbs = self.queue.logical_block_size() as usize;
        if (pos | iter.alignment() as u64) & (lbs as u64 - 1) != 0 || iter.min_page_size() < lbs {
            self.accounting
                .alignment_rejects
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(pos, len = iter.count(), lbs, "misaligned direct I/O");
            return Err(Errno::INVAL);
        }
        Ok(())
    }

    fn account_segment(&self, seg: &Segment) {
        let a = &self.accounting;
        a.segments.fetch_add(1, Ordering::Relaxed);
        let bytes = match seg.op() {
            Op::Read => &a.bytes_read,
            Op::Write => &a.bytes_written,
        };
        bytes.fetch_add(seg.len() as u64, Ordering::Relaxed);
    }

    /// Block until `waiter` is released, polling `cookie` first if any.
    fn wait(&self, waiter: &Waiter, cookie: Option<Cookie>) {
        while waiter.is_pending() {
            let reaped = cookie.is_some_and(|cookie| self.queue.poll(cookie, true));
            if !reaped {
                waiter.park();
            }
        }
    }

    fn submit_simple(&self, iocb: &Iocb, iter: &mut IoIter, nr_pages: usize) -> Result<usize, Errno> {
        self.check_alignment(iocb.pos, iter)?;
        self.accounting
            .simple_requests
            .fetch_add(1, Ordering::Relaxed);

        let (op, flags) = op_flags(iter, iocb);
        let done = Arc::new(SyncDone::new(should_dirty(iter)));
        let mut seg = Segment::new(SegVecs::unpooled(nr_pages), EndIo::Simple(Arc::clone(&done)));
        seg.set_target(Sector::containing(iocb.pos), iocb.ioprio);
        if let Err(err) = iter.get_pages(&mut seg) {
            seg.abandon();
            return Err(err);
        }
        let len = seg.len();
        seg.set_op(op, flags);
        if iocb.flags.contains(IoFlags::Nowait) {
            seg.add_flags(ReqFlags::Nowait);
        }
        let polled = iocb.flags.contains(IoFlags::Hipri);
        if polled {
            seg.add_flags(ReqFlags::Polled);
        }
        self.account_segment(&seg);
        tracing::trace!(pos = iocb.pos, len, ?op, "submitting single segment");
        let cookie = self.queue.submit(seg).filter(|_| polled);

        self.wait(done.waiter(), cookie);
        done.status().into_result()?;
        Ok(len)
    }

    fn submit_general(
        &self,
        iocb: &Iocb,
        iter: &mut IoIter,
        nr_pages: usize,
        completion: Completion,
    ) -> Result<Submitted, Errno> {
        self.check_alignment(iocb.pos, iter)?;
        let mut vecs = self.pool.alloc(nr_pages)?;
        self.accounting
            .general_requests
            .fetch_add(1, Ordering::Relaxed);

        let (op, flags) = op_flags(iter, iocb);
        let delivery = match completion {
            Completion::Wait => Delivery::Blocking(Waiter::current()),
            Completion::Notify(done) => Delivery::Async {
                pos: iocb.pos,
                done: Mutex::new(Some(done)),
            },
        };
        let dio = Dio::new(delivery, should_dirty(iter));
        let nowait = iocb.flags.contains(IoFlags::Nowait);
        let polled = iocb.flags.contains(IoFlags::Hipri);
        // Only the first segment can be rejected, and nothing is consumed until then.
        let unconsumed = nowait.then(|| iter.clone());

        let mut pos = iocb.pos;
        let mut cookie = None;
        let mut fault = None;
        let mut plug = (!polled).then(|| BatchScope::new(&*self.queue));
        loop {
            let mut seg = Segment::new(vecs, EndIo::Dio(Arc::clone(&dio)));
            seg.set_target(Sector::containing(pos), iocb.ioprio);
            if let Err(err) = iter.get_pages(&mut seg) {
                // The segment is empty but accounted, so completing it fails the request.
                fault = Some(err);
                seg.complete(BlkStatus::IoErr);
                break;
            }
            seg.set_op(op, flags);
            let len = seg.len();
            dio.add_size(len);
            pos += len as u64;
            let last = iter.count() == 0;

            if nowait {
                if !last {
                    // Coalesced errors of multiple segments cannot be reported without
                    // blocking, so the caller must retry from a blocking context.
                    seg.abandon();
                    drop(plug);
                    if let Some(unconsumed) = unconsumed {
                        *iter = unconsumed;
                    }
                    self.accounting
                        .nowait_rejects
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pos = iocb.pos, len = iter.count(), "nowait request rejected");
                    return Err(Errno::AGAIN);
                }
                seg.add_flags(ReqFlags::Nowait);
            }

            self.account_segment(&seg);
            tracing::trace!(sector = %seg.sector(), len, last, "submitting segment");
            if last {
                if polled {
                    seg.add_flags(ReqFlags::Polled);
                    cookie = self.queue.submit(seg);
                } else if let Some(plug) = &mut plug {
                    plug.add(seg);
                }
                break;
            }

            dio.get_segment();
            match &mut plug {
                Some(plug) => plug.add(seg),
                None => {
                    self.queue.submit(seg);
                }
            }
            vecs = self
                .pool
                .alloc_continuation(iter.npages(self.config.max_segment_vecs));
        }
        drop(plug);

        let Some(waiter) = dio.waiter() else {
            return Ok(Submitted::Queued { cookie });
        };
        self.wait(waiter, cookie);
        if let Some(err) = fault {
            return Err(err);
        }
        dio.status().into_result()?;
        Ok(Submitted::Done(dio.size()))
    }
}

fn op_flags(iter: &IoIter, iocb: &Iocb) -> (Op, ReqFlags) {
    match iter.op() {
        Op::Read => (Op::Read, ReqFlags::empty()),
        Op::Write => {
            let mut flags = ReqFlags::Sync | ReqFlags::Idle;
            if iocb.flags.contains(IoFlags::Dsync) {
                flags |= ReqFlags::Fua;
            }
            (Op::Write, flags)
        }
    }
}

fn should_dirty(iter: &IoIter) -> bool {
    iter.op() == Op::Read && iter.is_user_backed()
}
