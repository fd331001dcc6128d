//! Pinnable I/O memory and the cursor the engine consumes it through.
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::{fmt, ptr};

use rustix::io::Errno;

use crate::segment::{Op, Segment};
use crate::Sector;

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Default)]
struct PageState {
    pins: AtomicU32,
    dirty: AtomicBool,
    unmapped: AtomicBool,
}

struct BufInner {
    ptr: NonNull<u8>,
    len: usize,
    page_size: usize,
    pages: Box<[PageState]>,
}

// SAFETY: The memory is only accessed through raw pointer copies, like device DMA. Ranges pinned
// by one in-flight segment are disjoint from any other in-flight segment of the same request.
unsafe impl Send for BufInner {}
// SAFETY: See above.
unsafe impl Sync for BufInner {}

impl Drop for BufInner {
    fn drop(&mut self) {
        // SAFETY: Allocated by us in `IoBuf::with_page_size` with the same layout.
        unsafe {
            let size = self.pages.len() * self.page_size;
            let layout = Layout::from_size_align_unchecked(size, self.page_size);
            System.dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

/// Page-aligned memory that can be pinned into [`Segment`]s.
///
/// This stands for user memory in a direct I/O request. Each page tracks how many in-flight
/// segments pin it and whether a read dirtied it. Pages can be unmapped to make pinning fail
/// like a faulting user address.
#[derive(Clone)]
pub struct IoBuf(Arc<BufInner>);

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("ptr", &self.0.ptr)
            .field("len", &self.0.len)
            .field("page_size", &self.0.page_size)
            .field("pinned_pages", &self.pinned_pages())
            .finish()
    }
}

impl IoBuf {
    /// Allocate a zeroed buffer of `len` bytes with the default page size.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::with_page_size(len, PAGE_SIZE)
    }

    /// Allocate a zeroed buffer of `len` bytes, aligned to and paged by `page_size`.
    ///
    /// # Panics
    ///
    /// Panic if `len` is zero, or `page_size` is not a power of two of at least one sector.
    #[must_use]
    pub fn with_page_size(len: usize, page_size: usize) -> Self {
        assert_ne!(len, 0);
        assert!(page_size.is_power_of_two() && page_size >= Sector::SIZE as usize);
        let nr_pages = len.div_ceil(page_size);
        let layout = Layout::from_size_align(nr_pages * page_size, page_size).unwrap();
        // SAFETY: `layout` has non-zero size.
        let ptr = match NonNull::new(unsafe { System.alloc_zeroed(layout) }) {
            None => std::alloc::handle_alloc_error(layout),
            Some(ptr) => ptr,
        };
        let pages = std::iter::repeat_with(PageState::default)
            .take(nr_pages)
            .collect();
        Self(Arc::new(BufInner {
            ptr,
            len,
            page_size,
            pages,
        }))
    }

    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let this = Self::new(data.len());
        this.write_at(0, data);
        this
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.0.page_size
    }

    #[must_use]
    pub fn nr_pages(&self) -> usize {
        self.0.pages.len()
    }

    /// Copy `data` into the buffer at `off`.
    ///
    /// # Panics
    ///
    /// Panic if the range is out of bounds.
    pub fn write_at(&self, off: usize, data: &[u8]) {
        assert!(off.checked_add(data.len()).is_some_and(|end| end <= self.len()));
        // SAFETY: Checked in bound above.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(off), data.len()) };
    }

    /// Copy the buffer content at `off` into `out`.
    ///
    /// # Panics
    ///
    /// Panic if the range is out of bounds.
    pub fn read_at(&self, off: usize, out: &mut [u8]) {
        assert!(off.checked_add(out.len()).is_some_and(|end| end <= self.len()));
        // SAFETY: Checked in bound above.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().add(off), out.as_mut_ptr(), out.len()) };
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.read_at(0, &mut out);
        out
    }

    /// Number of pages currently pinned by in-flight segments.
    #[must_use]
    pub fn pinned_pages(&self) -> usize {
        self.0
            .pages
            .iter()
            .filter(|p| p.pins.load(Ordering::Acquire) != 0)
            .count()
    }

    #[must_use]
    pub fn is_dirty(&self, page: usize) -> bool {
        self.0.pages[page].dirty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        (0..self.nr_pages()).filter(|&i| self.is_dirty(i)).count()
    }

    pub fn clear_dirty(&self) {
        for page in self.0.pages.iter() {
            page.dirty.store(false, Ordering::Release);
        }
    }

    /// Make pinning `page` fail with `EFAULT` until [`Self::map_page`] is called.
    pub fn unmap_page(&self, page: usize) {
        self.0.pages[page].unmapped.store(true, Ordering::Release);
    }

    pub fn map_page(&self, page: usize) {
        self.0.pages[page].unmapped.store(false, Ordering::Release);
    }

    fn as_ptr(&self) -> *mut u8 {
        self.0.ptr.as_ptr()
    }

    fn pin(&self, page: usize) -> Result<(), Errno> {
        let state = &self.0.pages[page];
        if state.unmapped.load(Ordering::Acquire) {
            return Err(Errno::FAULT);
        }
        state.pins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unpin(&self, page: usize, dirty: bool) {
        let state = &self.0.pages[page];
        if dirty {
            state.dirty.store(true, Ordering::Release);
        }
        let prev = state.pins.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "page unpinned more than pinned");
    }
}

/// A pinned part of one page, the unit a [`Segment`] transfers.
///
/// The pin is held until the owning segment is completed or abandoned.
pub struct PageVec {
    buf: IoBuf,
    off: usize,
    len: usize,
}

impl fmt::Debug for PageVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageVec")
            .field("page", &self.page())
            .field("off", &self.off)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl PageVec {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte, for handing the memory to a kernel interface.
    ///
    /// It stays valid until the owning segment is completed.
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: `off` is in bound of the allocation.
        unsafe { self.buf.as_ptr().add(self.off) }
    }

    /// # Panics
    ///
    /// Panic if `src.len()` differs from [`Self::len()`].
    pub fn copy_from_slice(&self, src: &[u8]) {
        assert_eq!(src.len(), self.len);
        self.buf.write_at(self.off, src);
    }

    /// # Panics
    ///
    /// Panic if `out.len()` differs from [`Self::len()`].
    pub fn copy_to_slice(&self, out: &mut [u8]) {
        assert_eq!(out.len(), self.len);
        self.buf.read_at(self.off, out);
    }

    fn page(&self) -> usize {
        self.off / self.buf.page_size()
    }

    pub(crate) fn release(self, dirty: bool) {
        self.buf.unpin(self.page(), dirty);
    }
}

/// A byte range of an [`IoBuf`], one element of a scatter/gather list.
#[derive(Debug, Clone)]
pub struct IoVec {
    buf: IoBuf,
    off: usize,
    len: usize,
}

impl IoVec {
    /// # Panics
    ///
    /// Panic if the range is out of bounds of `buf`.
    #[must_use]
    pub fn new(buf: IoBuf, off: usize, len: usize) -> Self {
        assert!(off.checked_add(len).is_some_and(|end| end <= buf.len()));
        Self { buf, off, len }
    }

    #[must_use]
    pub fn buf(&self) -> &IoBuf {
        &self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl From<IoBuf> for IoVec {
    fn from(buf: IoBuf) -> Self {
        let len = buf.len();
        Self { buf, off: 0, len }
    }
}

/// What kind of memory the iterator describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// General purpose user memory. Pages read into it are marked dirty on completion.
    User,
    /// Memory owned by a lower layer which does its own dirty tracking.
    Kernel,
}

/// Cursor over a scatter/gather list of [`IoVec`]s.
///
/// `count` is the number of bytes left to transfer. It can be lowered with
/// [`IoIter::truncate`] and restored with [`IoIter::reexpand`] without touching the position.
#[derive(Debug, Clone)]
pub struct IoIter {
    op: Op,
    backing: Backing,
    vecs: Vec<IoVec>,
    /// Index of the current element.
    idx: usize,
    /// Bytes consumed in the current element.
    skip: usize,
    count: usize,
}

impl IoIter {
    pub fn new(op: Op, vecs: impl IntoIterator<Item = IoVec>) -> Self {
        Self::with_backing(op, Backing::User, vecs)
    }

    pub fn with_backing(op: Op, backing: Backing, vecs: impl IntoIterator<Item = IoVec>) -> Self {
        let vecs = vecs
            .into_iter()
            .filter(|vec| !vec.is_empty())
            .collect::<Vec<_>>();
        let count = vecs.iter().map(IoVec::len).sum();
        Self {
            op,
            backing,
            vecs,
            idx: 0,
            skip: 0,
            count,
        }
    }

    #[must_use]
    pub fn op(&self) -> Op {
        self.op
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    #[must_use]
    pub fn is_user_backed(&self) -> bool {
        self.backing == Backing::User
    }

    /// Bytes left to transfer.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Bitwise OR of the addresses and lengths of all remaining ranges.
    ///
    /// The request is aligned to `n` (a power of two) iff `alignment() & (n - 1) == 0`.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.ranges()
            .fold(0, |acc, (vec, off, len)| acc | (vec.buf.as_ptr() as usize + off) | len)
    }

    /// The smallest page size of the remaining buffers.
    #[must_use]
    pub fn min_page_size(&self) -> usize {
        self.ranges()
            .map(|(vec, ..)| vec.buf.page_size())
            .min()
            .unwrap_or(PAGE_SIZE)
    }

    /// Number of pages spanned by the remaining bytes, saturating at `max`.
    #[must_use]
    pub fn npages(&self, max: usize) -> usize {
        let mut npages = 0;
        for (vec, off, len) in self.ranges() {
            let page_size = vec.buf.page_size();
            npages += (off + len).div_ceil(page_size) - off / page_size;
            if npages >= max {
                return max;
            }
        }
        npages
    }

    /// Limit the remaining bytes to at most `len`.
    pub fn truncate(&mut self, len: usize) {
        self.count = self.count.min(len);
    }

    /// Restore the remaining bytes to `len` after a [`IoIter::truncate`].
    ///
    /// # Panics
    ///
    /// Panic if `len` exceeds the bytes actually left in the underlying vectors.
    pub fn reexpand(&mut self, len: usize) {
        let avail = self.ranges_untruncated().map(|(_, _, len)| len).sum::<usize>();
        assert!(len <= avail, "re-expand beyond the underlying vectors");
        self.count = len;
    }

    /// Pin pages at the cursor into `seg` until it is full or the iterator is exhausted.
    ///
    /// Pinning stops early at a faulting page. Only if not a single page could be pinned, the
    /// fault is returned.
    pub(crate) fn get_pages(&mut self, seg: &mut Segment) -> Result<(), Errno> {
        let first = seg.nr_vecs();
        while self.count != 0 && !seg.is_full() {
            let vec = &self.vecs[self.idx];
            let page_size = vec.buf.page_size();
            let off = vec.off + self.skip;
            let page = off / page_size;
            let len = (page_size - off % page_size)
                .min(vec.len - self.skip)
                .min(self.count);
            if let Err(err) = vec.buf.pin(page) {
                if seg.nr_vecs() == first {
                    tracing::debug!(page, off, "failed to pin page");
                    return Err(err);
                }
                break;
            }
            seg.push_vec(PageVec {
                buf: vec.buf.clone(),
                off,
                len,
            });
            self.advance(len);
        }
        Ok(())
    }

    fn advance(&mut self, mut n: usize) {
        assert!(n <= self.count);
        self.count -= n;
        while n != 0 {
            let left = self.vecs[self.idx].len - self.skip;
            if n < left {
                self.skip += n;
                return;
            }
            n -= left;
            self.idx += 1;
            self.skip = 0;
        }
        // Skip exhausted and empty elements.
        while self.idx < self.vecs.len() && self.vecs[self.idx].len == self.skip {
            self.idx += 1;
            self.skip = 0;
        }
    }

    /// Remaining `(vec, offset in buffer, length)` ranges, limited by `count`.
    fn ranges(&self) -> impl Iterator<Item = (&IoVec, usize, usize)> + '_ {
        let mut left = self.count;
        self.ranges_untruncated().map_while(move |(vec, off, len)| {
            let len = len.min(left);
            left -= len;
            (len != 0).then_some((vec, off, len))
        })
    }

    fn ranges_untruncated(&self) -> impl Iterator<Item = (&IoVec, usize, usize)> + '_ {
        self.vecs
            .iter()
            .enumerate()
            .skip(self.idx)
            .map(|(i, vec)| {
                let skip = if i == self.idx { self.skip } else { 0 };
                (vec, vec.off + skip, vec.len - skip)
            })
            .filter(|&(_, _, len)| len != 0)
    }
}
