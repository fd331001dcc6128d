//! Direct-I/O submission and completion engine for raw block devices.
//!
//! A single read or write request, described by an [`IoIter`] over pinnable memory, a byte
//! offset and [`IoFlags`], is split into one or more bounded [`Segment`]s which are dispatched to
//! a [`DeviceQueue`]. Their completions, arriving in any order and from any thread, are folded
//! back into exactly one result which is either returned to a blocked caller or handed to an
//! asynchronous completion callback.
//!
//! ```text
//! DirectIo::submit --> SegmentPool / IoIter / BatchScope --> DeviceQueue
//!                                                                |
//!        caller <-- (wake | callback) <-- request aggregate <-- Segment::complete
//! ```
mod dio;
mod engine;
mod iter;
mod memory;
mod pool;
mod queue;
mod segment;
mod uring;


use std::fmt;

pub use dio::{AioCompletion, AioDone};
pub use engine::{
    Completion, DirectIo, EngineConfig, IoFlags, IoStats, Iocb, Submitted, MAX_SEGMENT_VECS,
};
pub use iter::{Backing, IoBuf, IoIter, IoVec, PageVec, PAGE_SIZE};
pub use memory::{CompletionMode, MemoryQueue, MemoryQueueStats};
pub use pool::{PoolConfig, SegmentPool};
pub use queue::{BatchScope, Cookie, DeviceQueue, MAX_BATCH};
pub use segment::{BlkStatus, Op, ReqFlags, Segment, INLINE_VECS};
pub use uring::{UringConfig, UringQueue};

/// Size or offset in unit of sectors (512bytes).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)?;
        "s".fmt(f)
    }
}

impl Sector {
    pub const SHIFT: u32 = 9;
    pub const SIZE: u32 = 1 << Self::SHIFT;

    /// The sector containing byte offset `bytes`, rounding down.
    #[must_use]
    pub const fn containing(bytes: u64) -> Self {
        Self(bytes >> Self::SHIFT)
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self.0.checked_mul(Self::SIZE as u64) {
            Some(bytes) => bytes,
            None => panic!("overflow"),
        }
    }
}
