use std::fmt;
use std::sync::Arc;

use rustix::io::Errno;

use crate::dio::{Dio, SyncDone};
use crate::iter::PageVec;
use crate::pool::SegVecs;
use crate::Sector;

/// Number of page vectors a [`Segment`] stores inline before falling back to heap storage.
pub const INLINE_VECS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
}

bitflags::bitflags! {
    /// Per-segment request flags seen by the device queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReqFlags: u32 {
        const Sync = 1 << 0;
        const Idle = 1 << 1;
        /// Force unit access: the data must be durable before completion.
        const Fua = 1 << 2;
        const Nowait = 1 << 3;
        /// The submitter will poll for this completion instead of sleeping.
        const Polled = 1 << 4;
    }
}

/// Completion status of a [`Segment`], as reported by the device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlkStatus {
    Ok = 0,
    NotSupp,
    Timeout,
    NoSpc,
    Transport,
    Target,
    Medium,
    Protection,
    Resource,
    DevResource,
    Again,
    IoErr,
}

impl BlkStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Translate into the errno reported to the caller. [`BlkStatus::Ok`] has none.
    #[must_use]
    pub fn to_errno(self) -> Option<Errno> {
        Some(match self {
            Self::Ok => return None,
            Self::NotSupp => Errno::OPNOTSUPP,
            Self::Timeout => Errno::TIMEDOUT,
            Self::NoSpc => Errno::NOSPC,
            Self::Transport => Errno::NOLINK,
            Self::Target => Errno::REMOTEIO,
            Self::Medium => Errno::NODATA,
            Self::Protection => Errno::ILSEQ,
            Self::Resource => Errno::NOMEM,
            Self::DevResource => Errno::BUSY,
            Self::Again => Errno::AGAIN,
            Self::IoErr => Errno::IO,
        })
    }

    pub fn into_result(self) -> Result<(), Errno> {
        match self.to_errno() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// The inverse of [`BlkStatus::to_errno`]. Unknown errors map to [`BlkStatus::IoErr`].
    #[must_use]
    pub fn from_errno(err: Errno) -> Self {
        match err {
            Errno::OPNOTSUPP => Self::NotSupp,
            Errno::TIMEDOUT => Self::Timeout,
            Errno::NOSPC => Self::NoSpc,
            Errno::NOLINK => Self::Transport,
            Errno::REMOTEIO => Self::Target,
            Errno::NODATA => Self::Medium,
            Errno::ILSEQ => Self::Protection,
            Errno::NOMEM => Self::Resource,
            Errno::BUSY => Self::DevResource,
            Errno::AGAIN => Self::Again,
            _ => Self::IoErr,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        const ALL: [BlkStatus; 12] = [
            BlkStatus::Ok,
            BlkStatus::NotSupp,
            BlkStatus::Timeout,
            BlkStatus::NoSpc,
            BlkStatus::Transport,
            BlkStatus::Target,
            BlkStatus::Medium,
            BlkStatus::Protection,
            BlkStatus::Resource,
            BlkStatus::DevResource,
            BlkStatus::Again,
            BlkStatus::IoErr,
        ];
        ALL.get(raw as usize).copied().unwrap_or(Self::IoErr)
    }
}

impl fmt::Display for BlkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_errno() {
            None => f.write_str("ok"),
            Some(err) => err.fmt(f),
        }
    }
}

pub(crate) enum EndIo {
    /// The single-segment synchronous path.
    Simple(Arc<SyncDone>),
    /// One of the segments of a request aggregate.
    Dio(Arc<Dio>),
}

/// One bounded unit of transfer handed to a [`DeviceQueue`](crate::DeviceQueue).
///
/// The device queue takes ownership on submission and must finish it with
/// [`Segment::complete`]. A segment dropped without completion is completed with
/// [`BlkStatus::IoErr`], so a request can never be left waiting on a lost segment.
pub struct Segment {
    op: Op,
    flags: ReqFlags,
    sector: Sector,
    ioprio: u16,
    size: usize,
    vecs: SegVecs,
    end_io: Option<EndIo>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("sector", &self.sector)
            .field("size", &self.size)
            .field("nr_vecs", &self.vecs.len())
            .finish_non_exhaustive()
    }
}

impl Segment {
    pub(crate) fn new(vecs: SegVecs, end_io: EndIo) -> Self {
        Self {
            op: Op::Read,
            flags: ReqFlags::empty(),
            sector: Sector(0),
            ioprio: 0,
            size: 0,
            vecs,
            end_io: Some(end_io),
        }
    }

    #[must_use]
    pub fn op(&self) -> Op {
        self.op
    }

    #[must_use]
    pub fn flags(&self) -> ReqFlags {
        self.flags
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Starting byte offset on the device.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.sector.bytes()
    }

    #[must_use]
    pub fn ioprio(&self) -> u16 {
        self.ioprio
    }

    /// Total bytes covered by all page vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn vecs(&self) -> impl Iterator<Item = &PageVec> + '_ {
        self.vecs.iter()
    }

    /// Scatter `data` into the pages of this segment, for completing a read.
    ///
    /// # Panics
    ///
    /// Panic if `data.len()` differs from [`Self::len()`].
    pub fn fill_from_slice(&self, mut data: &[u8]) {
        assert_eq!(data.len(), self.size);
        for vec in self.vecs() {
            let (head, rest) = data.split_at(vec.len());
            vec.copy_from_slice(head);
            data = rest;
        }
    }

    /// Gather the pages of this segment into `out`, for completing a write.
    ///
    /// # Panics
    ///
    /// Panic if `out.len()` differs from [`Self::len()`].
    pub fn copy_to_slice(&self, mut out: &mut [u8]) {
        assert_eq!(out.len(), self.size);
        for vec in self.vecs() {
            let (head, rest) = out.split_at_mut(vec.len());
            vec.copy_to_slice(head);
            out = rest;
        }
    }

    /// Finish this segment with `status`, running its completion hook.
    pub fn complete(mut self, status: BlkStatus) {
        self.end_io(status);
    }

    pub(crate) fn set_target(&mut self, sector: Sector, ioprio: u16) {
        self.sector = sector;
        self.ioprio = ioprio;
    }

    pub(crate) fn set_op(&mut self, op: Op, flags: ReqFlags) {
        self.op = op;
        self.flags = flags;
    }

    pub(crate) fn add_flags(&mut self, flags: ReqFlags) {
        self.flags |= flags;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.vecs.is_full()
    }

    pub(crate) fn nr_vecs(&self) -> usize {
        self.vecs.len()
    }

    pub(crate) fn push_vec(&mut self, vec: PageVec) {
        self.size += vec.len();
        self.vecs.push(vec);
    }

    #[cfg(test)]
    pub(crate) fn dio(&self) -> Option<&Arc<Dio>> {
        match &self.end_io {
            Some(EndIo::Dio(dio)) => Some(dio),
            _ => None,
        }
    }

    /// Drop a never-submitted segment: release its pages untouched and skip the completion hook.
    pub(crate) fn abandon(mut self) {
        self.end_io = None;
        self.vecs.release_pages(false);
    }

    fn end_io(&mut self, status: BlkStatus) {
        let Some(end_io) = self.end_io.take() else {
            return;
        };
        tracing::trace!(sector = %self.sector, len = self.size, %status, "segment completed");
        // Pages are handed back before the request can be finalized, so the caller never
        // observes its buffer still pinned after getting the result.
        match end_io {
            EndIo::Simple(done) => {
                self.vecs.release_pages(done.should_dirty());
                done.complete(status);
            }
            EndIo::Dio(dio) => {
                self.vecs.release_pages(dio.should_dirty());
                dio.end_segment(status);
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.end_io.is_some() {
            tracing::warn!(sector = %self.sector, len = self.size, "segment dropped without completion");
            self.end_io(BlkStatus::IoErr);
        }
    }
}
