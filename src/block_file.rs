//! File operations of an opened block device.
//!
//! [`BlockFile`] sits between callers and the [`DirectIo`] engine, clamping requests at the end
//! of device, rejecting writes the open mode or the device forbids, and forwarding flush and
//! deallocation requests to the device queue.
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

use blkdio_engine::{
    Completion, Cookie, DeviceQueue, DirectIo, IoFlags, IoIter, Iocb, Op, Submitted,
};
use rustix::fs::FallocateFlags;
use rustix::io::Errno;

/// An opened block device.
pub struct BlockFile<Q: DeviceQueue + ?Sized> {
    engine: Arc<DirectIo<Q>>,
    writable: bool,
    /// Position of [`BlockFile::read`] and [`BlockFile::write`].
    pos: u64,
}

impl<Q: DeviceQueue + ?Sized> fmt::Debug for BlockFile<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFile")
            .field("engine", &self.engine)
            .field("writable", &self.writable)
            .field("pos", &self.pos)
            .finish()
    }
}

impl<Q: DeviceQueue + ?Sized> BlockFile<Q> {
    #[must_use]
    pub fn new(engine: Arc<DirectIo<Q>>, writable: bool) -> Self {
        Self {
            engine,
            writable,
            pos: 0,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<DirectIo<Q>> {
        &self.engine
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Device size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.engine.queue().capacity()
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn logical_block_size(&self) -> u64 {
        self.engine.queue().logical_block_size().into()
    }

    /// Read at `iocb.pos` into `iter`.
    ///
    /// Reads at or beyond the end of device return 0, and reads crossing it are shortened.
    /// On synchronous completion, `iocb.pos` is advanced by the bytes read.
    pub fn read_iter(
        &self,
        iocb: &mut Iocb,
        iter: &mut IoIter,
        completion: Completion,
    ) -> Result<Submitted, Errno> {
        assert_eq!(iter.op(), Op::Read, "iterator direction mismatch");
        let size = self.size();
        if iocb.pos >= size {
            return Ok(Submitted::Done(0));
        }
        if !iocb.flags.contains(IoFlags::Direct) {
            return Err(Errno::INVAL);
        }
        self.submit_clamped(size - iocb.pos, iocb, iter, completion)
    }

    /// Write at `iocb.pos` from `iter`.
    ///
    /// Writes starting at or beyond the end of device fail with `ENOSPC`, and writes crossing it
    /// are shortened. On synchronous completion, `iocb.pos` is advanced by the bytes written, and
    /// the device is flushed if [`IoFlags::Dsync`] is set.
    pub fn write_iter(
        &self,
        iocb: &mut Iocb,
        iter: &mut IoIter,
        completion: Completion,
    ) -> Result<Submitted, Errno> {
        assert_eq!(iter.op(), Op::Write, "iterator direction mismatch");
        if !self.writable {
            return Err(Errno::BADF);
        }
        if self.engine.queue().is_read_only() {
            return Err(Errno::PERM);
        }
        if iter.count() == 0 {
            return Ok(Submitted::Done(0));
        }
        let size = self.size();
        if iocb.pos >= size {
            return Err(Errno::NOSPC);
        }
        if !iocb.flags.contains(IoFlags::Direct) {
            return Err(if iocb.flags.contains(IoFlags::Nowait) {
                Errno::OPNOTSUPP
            } else {
                Errno::INVAL
            });
        }

        let ret = self.submit_clamped(size - iocb.pos, iocb, iter, completion)?;
        match ret {
            Submitted::Done(n) if n != 0 && iocb.flags.contains(IoFlags::Dsync) => self.fsync()?,
            _ => {}
        }
        Ok(ret)
    }

    /// Submit at most `avail` bytes of `iter`. The rest stays in `iter` afterwards.
    fn submit_clamped(
        &self,
        avail: u64,
        iocb: &mut Iocb,
        iter: &mut IoIter,
        completion: Completion,
    ) -> Result<Submitted, Errno> {
        let count = iter.count();
        let shorted = usize::try_from((count as u64).saturating_sub(avail)).unwrap_or(count);
        iter.truncate(count - shorted);
        let mut iter = scopeguard::guard(iter, |iter| {
            let left = iter.count();
            iter.reexpand(left + shorted);
        });

        let ret = self.engine.submit(iocb, &mut iter, completion)?;
        if let Submitted::Done(n) = ret {
            iocb.pos += n as u64;
        }
        Ok(ret)
    }

    /// Synchronously read at the file position, advancing it.
    pub fn read(&mut self, iter: &mut IoIter, flags: IoFlags) -> Result<usize, Errno> {
        let mut iocb = Iocb::new(self.pos, flags);
        let n = expect_done(self.read_iter(&mut iocb, iter, Completion::Wait)?);
        self.pos = iocb.pos;
        Ok(n)
    }

    /// Synchronously write at the file position, advancing it.
    pub fn write(&mut self, iter: &mut IoIter, flags: IoFlags) -> Result<usize, Errno> {
        let mut iocb = Iocb::new(self.pos, flags);
        let n = expect_done(self.write_iter(&mut iocb, iter, Completion::Wait)?);
        self.pos = iocb.pos;
        Ok(n)
    }

    /// Reposition the file position. The result must be within `[0, size]`.
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64, Errno> {
        let size = self.size();
        let pos = match to {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        };
        match pos {
            Some(pos) if pos <= size => {
                self.pos = pos;
                Ok(pos)
            }
            _ => Err(Errno::INVAL),
        }
    }

    /// Flush the volatile cache of the device. Devices without one always succeed.
    pub fn fsync(&self) -> Result<(), Errno> {
        match self.engine.queue().flush() {
            Err(Errno::OPNOTSUPP) => Ok(()),
            ret => ret,
        }
    }

    /// Poll for the completion of a polled request.
    pub fn iopoll(&self, cookie: Cookie, spin: bool) -> bool {
        self.engine.iopoll(cookie, spin)
    }

    /// Zero out or deallocate a range of the device.
    ///
    /// Supported modes:
    /// - `ZERO_RANGE`, optionally with `KEEP_SIZE`: zero without deallocating.
    /// - `PUNCH_HOLE | KEEP_SIZE`: zero, possibly deallocating.
    /// - `PUNCH_HOLE | KEEP_SIZE | NO_HIDE_STALE`: discard, leaving undefined content.
    ///
    /// A range crossing the end of device is shortened if `KEEP_SIZE` is set. The start and the
    /// length must be multiples of the logical block size.
    pub fn fallocate(&self, mode: FallocateFlags, start: u64, len: u64) -> Result<(), Errno> {
        let supported = FallocateFlags::KEEP_SIZE
            | FallocateFlags::PUNCH_HOLE
            | FallocateFlags::ZERO_RANGE
            | FallocateFlags::NO_HIDE_STALE;
        if !supported.contains(mode) {
            return Err(Errno::OPNOTSUPP);
        }
        if !self.writable {
            return Err(Errno::BADF);
        }
        if len == 0 {
            return Err(Errno::INVAL);
        }

        let size = self.size();
        if start >= size {
            return Err(Errno::INVAL);
        }
        let end = start.checked_add(len - 1).ok_or(Errno::INVAL)?;
        let mut len = len;
        if end >= size {
            if !mode.contains(FallocateFlags::KEEP_SIZE) {
                return Err(Errno::INVAL);
            }
            len = size - start;
        }
        if (start | len) & (self.logical_block_size() - 1) != 0 {
            return Err(Errno::INVAL);
        }

        let queue = self.engine.queue();
        let punch = FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE;
        let ret = if mode == FallocateFlags::ZERO_RANGE
            || mode == FallocateFlags::ZERO_RANGE | FallocateFlags::KEEP_SIZE
        {
            queue.write_zeroes(start, len, false)
        } else if mode == punch {
            queue.write_zeroes(start, len, true)
        } else if mode == punch | FallocateFlags::NO_HIDE_STALE {
            queue.discard(start, len)
        } else {
            return Err(Errno::OPNOTSUPP);
        };
        if let Err(err) = ret {
            tracing::debug!(?mode, start, len, %err, "fallocate failed");
        }
        ret
    }
}

fn expect_done(ret: Submitted) -> usize {
    match ret {
        Submitted::Done(n) => n,
        Submitted::Queued { .. } => unreachable!("synchronous request is queued"),
    }
}
