//! A device queue backed by a file or a block device, driven by io_uring.
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use rustix::fs::{FallocateFlags, OFlags};
use rustix::io::Errno;

use crate::queue::{Cookie, DeviceQueue};
use crate::segment::{BlkStatus, Op, ReqFlags, Segment};

const STOP_USER_DATA: u64 = !0;
const POLL_SPIN_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UringConfig {
    /// Submission queue size.
    pub entries: u32,
    /// Open with `O_DIRECT`.
    pub direct: bool,
    pub logical_block_size: u32,
    pub read_only: bool,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            entries: 128,
            direct: false,
            logical_block_size: 512,
            read_only: false,
        }
    }
}

/// Layout of `struct iovec`.
#[repr(C)]
struct Iovec {
    base: *mut u8,
    len: usize,
}

/// A submitted segment with the vector array the kernel reads from.
struct Inflight {
    seg: Segment,
    _iovecs: Box<[Iovec]>,
}

// SAFETY: The raw pointers refer to pages pinned by `seg`, which is `Send`.
unsafe impl Send for Inflight {}

struct Shared {
    file: File,
    ring: IoUring,
    /// Held when pushing to the submission queue.
    sq_lock: Mutex<()>,
    /// Held when consuming the completion queue.
    cq_lock: Mutex<()>,
    inflight: Mutex<HashMap<u64, Inflight>>,
    next_id: AtomicU64,
    reaper_gone: AtomicBool,
}

// SAFETY: The submission queue is only written under `sq_lock`, and the completion queue is only
// consumed under `cq_lock`. Entering the ring is thread-safe.
unsafe impl Send for Shared {}
// SAFETY: See above.
unsafe impl Sync for Shared {}

impl Shared {
    fn enter(&self, want: usize) -> Result<usize, Errno> {
        rustix::io::retry_on_intr(|| {
            self.ring
                .submit_and_wait(want)
                .map_err(|err| Errno::from_io_error(&err).unwrap_or(Errno::IO))
        })
    }

    fn push(&self, sqe: &squeue::Entry) -> Result<(), Errno> {
        loop {
            {
                let _sq = self.sq_lock.lock();
                // SAFETY: The submission queue is only written under `sq_lock`. All memory
                // referenced by SQEs is kept alive in `inflight` until its completion.
                if unsafe { self.ring.submission_shared().push(sqe) }.is_ok() {
                    return Ok(());
                }
            }
            // Full. Let the kernel consume some.
            self.enter(0)?;
        }
    }

    /// Consume all available completions. Returns the number of segments completed and whether
    /// the stop marker was seen.
    fn reap(&self, block: bool) -> (usize, bool) {
        let cqes = {
            let _cq = if block {
                self.cq_lock.lock()
            } else {
                match self.cq_lock.try_lock() {
                    Some(guard) => guard,
                    None => return (0, false),
                }
            };
            // SAFETY: The completion queue is only consumed under `cq_lock`.
            unsafe { self.ring.completion_shared() }
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect::<Vec<_>>()
        };

        let mut completed = 0;
        let mut stop = false;
        for (id, res) in cqes {
            if id == STOP_USER_DATA {
                stop = true;
                continue;
            }
            let Some(Inflight { seg, .. }) = self.inflight.lock().remove(&id) else {
                tracing::error!(id, res, "completion of unknown request");
                continue;
            };
            let status = self.finish(&seg, res);
            seg.complete(status);
            completed += 1;
        }
        (completed, stop)
    }

    fn finish(&self, seg: &Segment, res: i32) -> BlkStatus {
        if res < 0 {
            let err = Errno::from_raw_os_error(-res);
            tracing::warn!(off = seg.offset(), len = seg.len(), %err, "segment failed");
            return BlkStatus::from_errno(err);
        }
        if res as usize != seg.len() {
            tracing::warn!(off = seg.offset(), len = seg.len(), res, "short transfer");
            return BlkStatus::IoErr;
        }
        if seg.op() == Op::Write && seg.flags().contains(ReqFlags::Fua) {
            if let Err(err) = rustix::fs::fdatasync(&self.file) {
                tracing::warn!(%err, "failed to sync written data");
                return BlkStatus::from_errno(err);
            }
        }
        BlkStatus::Ok
    }

    fn reaper(&self) {
        let _gone = scopeguard::guard(&self.reaper_gone, |gone| {
            gone.store(true, Ordering::Release);
        });
        tracing::debug!("uring reaper started");
        let mut stopping = false;
        loop {
            if let Err(err) = self.enter(1) {
                tracing::error!(%err, "failed to wait for completions");
                return;
            }
            stopping |= self.reap(true).1;
            if stopping && self.inflight.lock().is_empty() {
                break;
            }
        }
        tracing::debug!("uring reaper exited");
    }
}

/// A device queue issuing `readv`/`writev` on a file through io_uring.
///
/// Completions are reaped by a dedicated thread, or by pollers calling [`DeviceQueue::poll`].
/// FUA writes are followed by a data sync before they complete.
pub struct UringQueue {
    shared: Arc<Shared>,
    config: UringConfig,
    capacity: u64,
    reaper: Option<JoinHandle<()>>,
}

impl fmt::Debug for UringQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UringQueue")
            .field("file", &self.shared.file)
            .field("config", &self.config)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl UringQueue {
    pub fn open(path: impl AsRef<Path>, config: &UringConfig) -> io::Result<Self> {
        let mut opts = File::options();
        opts.read(true).write(!config.read_only);
        if config.direct {
            opts.custom_flags(OFlags::DIRECT.bits() as i32);
        }
        let file = opts.open(path)?;
        Self::from_file(file, config)
    }

    /// Take over an opened file. Its size at this point is the device capacity, rounded down to
    /// the logical block size.
    pub fn from_file(file: File, config: &UringConfig) -> io::Result<Self> {
        let lbs = config.logical_block_size;
        if !lbs.is_power_of_two() || lbs < 512 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid logical block size: {lbs}"),
            ));
        }
        let capacity = (&file).seek(SeekFrom::End(0))? & !(u64::from(lbs) - 1);
        let ring = IoUring::builder().dontfork().build(config.entries)?;
        let shared = Arc::new(Shared {
            file,
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            reaper_gone: AtomicBool::new(false),
        });
        let reaper = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("uring-reaper".into())
                .spawn(move || shared.reaper())?
        };
        tracing::debug!(capacity, ?config, "uring queue opened");
        Ok(Self {
            shared,
            config: *config,
            capacity,
            reaper: Some(reaper),
        })
    }

    #[must_use]
    pub fn config(&self) -> &UringConfig {
        &self.config
    }

    /// Number of segments submitted and not yet completed.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.shared.inflight.lock().len()
    }

    /// Register `seg` as in flight and push its SQE, or complete it on failure.
    fn queue(&self, seg: Segment) -> Option<Cookie> {
        if self.shared.reaper_gone.load(Ordering::Acquire) {
            seg.complete(BlkStatus::IoErr);
            return None;
        }
        if seg.op() == Op::Write && self.config.read_only {
            tracing::warn!(off = seg.offset(), len = seg.len(), "write to read-only device");
            seg.complete(BlkStatus::IoErr);
            return None;
        }

        let iovecs = seg
            .vecs()
            .map(|vec| Iovec {
                base: vec.as_mut_ptr(),
                len: vec.len(),
            })
            .collect::<Box<[_]>>();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let fd = types::Fd(self.shared.file.as_raw_fd());
        let (ptr, len) = (iovecs.as_ptr().cast(), iovecs.len() as u32);
        let sqe = match seg.op() {
            Op::Read => opcode::Readv::new(fd, ptr, len).offset(seg.offset()).build(),
            Op::Write => opcode::Writev::new(fd, ptr, len).offset(seg.offset()).build(),
        }
        .user_data(id);
        self.shared.inflight.lock().insert(
            id,
            Inflight {
                seg,
                _iovecs: iovecs,
            },
        );

        if let Err(err) = self.shared.push(&sqe) {
            tracing::error!(%err, "failed to queue segment");
            if let Some(Inflight { seg, .. }) = self.shared.inflight.lock().remove(&id) {
                seg.complete(BlkStatus::from_errno(err));
            }
            return None;
        }
        Some(Cookie(id))
    }

    fn kick(&self) {
        if let Err(err) = self.shared.enter(0) {
            tracing::error!(%err, "failed to submit to io_uring");
        }
    }
}

impl Drop for UringQueue {
    fn drop(&mut self) {
        let Some(reaper) = self.reaper.take() else {
            return;
        };
        if !self.shared.reaper_gone.load(Ordering::Acquire) {
            let sqe = opcode::Nop::new().build().user_data(STOP_USER_DATA);
            if let Err(err) = self.shared.push(&sqe).and_then(|()| self.shared.enter(0)) {
                tracing::error!(%err, "failed to stop uring reaper");
                return;
            }
        }
        if reaper.join().is_err() {
            tracing::error!("uring reaper panicked");
        }
    }
}

impl DeviceQueue for UringQueue {
    fn logical_block_size(&self) -> u32 {
        self.config.logical_block_size
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn submit(&self, seg: Segment) -> Option<Cookie> {
        let cookie = self.queue(seg);
        self.kick();
        cookie
    }

    fn submit_batch(&self, segs: &mut Vec<Segment>) {
        for seg in segs.drain(..) {
            self.queue(seg);
        }
        self.kick();
    }

    fn poll(&self, _cookie: Cookie, spin: bool) -> bool {
        let rounds = if spin { POLL_SPIN_ROUNDS } else { 1 };
        for _ in 0..rounds {
            if self.shared.reap(false).0 != 0 {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn flush(&self) -> Result<(), Errno> {
        rustix::fs::fdatasync(&self.shared.file)
    }

    fn discard(&self, off: u64, len: u64) -> Result<(), Errno> {
        rustix::fs::fallocate(
            &self.shared.file,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            off,
            len,
        )
    }

    fn write_zeroes(&self, off: u64, len: u64, unmap: bool) -> Result<(), Errno> {
        let mode = if unmap {
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE
        } else {
            FallocateFlags::ZERO_RANGE | FallocateFlags::KEEP_SIZE
        };
        rustix::fs::fallocate(&self.shared.file, mode, off, len)
    }
}
