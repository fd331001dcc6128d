use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::iter::PageVec;
use crate::segment::INLINE_VECS;

/// Construction parameters of a [`SegmentPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of page vector arrays preallocated on construction.
    pub initial: usize,
    /// Capacity of each preallocated array.
    pub initial_vecs: usize,
    /// Maximum number of freed arrays kept for reuse.
    pub cache_size: usize,
    /// Maximum number of segments allocated from the pool and not yet freed. New requests are
    /// refused with `ENOMEM` beyond it.
    pub limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial: 4,
            initial_vecs: crate::MAX_SEGMENT_VECS,
            cache_size: 64,
            limit: 4096,
        }
    }
}

/// Storage of page vectors for segments.
///
/// Small segments keep their vectors inline; larger ones take an array from the cache or the
/// heap, which is given back to the cache when the segment is freed. The pool is shared by all
/// requests on a queue and may be used from any thread.
pub struct SegmentPool {
    config: PoolConfig,
    cache: Mutex<Vec<Vec<PageVec>>>,
    in_use: AtomicUsize,
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("config", &self.config)
            .field("cached", &self.cached())
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl SegmentPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let cache = std::iter::repeat_with(|| Vec::with_capacity(config.initial_vecs))
            .take(config.initial.min(config.cache_size))
            .collect();
        Arc::new(Self {
            config,
            cache: Mutex::new(cache),
            in_use: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of segments allocated from this pool and not freed yet.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Number of arrays kept for reuse.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Allocate storage for the first segment of a request.
    pub(crate) fn alloc(self: &Arc<Self>, nr_vecs: usize) -> Result<SegVecs, Errno> {
        let admitted = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.limit).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            tracing::debug!(limit = self.config.limit, "segment pool exhausted");
            return Err(Errno::NOMEM);
        }
        Ok(self.take(nr_vecs))
    }

    /// Allocate storage for a following segment of an already admitted request.
    ///
    /// It never fails, since the request is already partially submitted.
    pub(crate) fn alloc_continuation(self: &Arc<Self>, nr_vecs: usize) -> SegVecs {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        self.take(nr_vecs)
    }

    fn take(self: &Arc<Self>, nr_vecs: usize) -> SegVecs {
        let storage = if nr_vecs <= INLINE_VECS {
            Storage::inline()
        } else {
            let mut vecs = self.cache.lock().pop().unwrap_or_default();
            vecs.reserve_exact(nr_vecs);
            Storage::Heap(vecs)
        };
        SegVecs {
            storage,
            cap: nr_vecs,
            pool: Some(Arc::clone(self)),
        }
    }

    fn free(&self, storage: Storage) {
        if let Storage::Heap(vecs) = storage {
            debug_assert!(vecs.is_empty());
            let mut cache = self.cache.lock();
            if cache.len() < self.config.cache_size {
                cache.push(vecs);
            }
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Storage {
    Inline {
        vecs: [Option<PageVec>; INLINE_VECS],
        len: usize,
    },
    Heap(Vec<PageVec>),
}

impl Storage {
    fn inline() -> Self {
        Storage::Inline {
            vecs: std::array::from_fn(|_| None),
            len: 0,
        }
    }
}

/// Page vector storage owned by one [`Segment`](crate::Segment), bounded by `cap` entries.
pub(crate) struct SegVecs {
    storage: Storage,
    cap: usize,
    pool: Option<Arc<SegmentPool>>,
}

impl SegVecs {
    /// Storage not accounted in any pool, for the single-segment path.
    pub(crate) fn unpooled(nr_vecs: usize) -> Self {
        let storage = if nr_vecs <= INLINE_VECS {
            Storage::inline()
        } else {
            Storage::Heap(Vec::with_capacity(nr_vecs))
        };
        Self {
            storage,
            cap: nr_vecs,
            pool: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline { len, .. } => *len,
            Storage::Heap(vecs) => vecs.len(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.cap
    }

    pub(crate) fn push(&mut self, vec: PageVec) {
        assert!(!self.is_full());
        match &mut self.storage {
            Storage::Inline { vecs, len } => {
                vecs[*len] = Some(vec);
                *len += 1;
            }
            Storage::Heap(vecs) => vecs.push(vec),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PageVec> + '_ {
        let (inline, heap): (&[Option<PageVec>], &[PageVec]) = match &self.storage {
            Storage::Inline { vecs, len } => (&vecs[..*len], &[]),
            Storage::Heap(vecs) => (&[], vecs),
        };
        inline.iter().flatten().chain(heap)
    }

    /// Unpin all pages, marking them dirty if requested. Idempotent.
    pub(crate) fn release_pages(&mut self, dirty: bool) {
        match &mut self.storage {
            Storage::Inline { vecs, len } => {
                for vec in vecs[..*len].iter_mut().filter_map(Option::take) {
                    vec.release(dirty);
                }
                *len = 0;
            }
            Storage::Heap(vecs) => {
                for vec in vecs.drain(..) {
                    vec.release(dirty);
                }
            }
        }
    }
}

impl Drop for SegVecs {
    fn drop(&mut self) {
        self.release_pages(false);
        if let Some(pool) = self.pool.take() {
            let storage = std::mem::replace(&mut self.storage, Storage::Heap(Vec::new()));
            pool.free(storage);
        }
    }
}
