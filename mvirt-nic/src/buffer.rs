//! Receive buffer pool and DMA mapping
//!
//! Receive pages come from one pre-allocated region (hugepages when
//! available) with a lock-free free list. A page is mapped for device
//! access when it is allocated and unmapped either when it is handed
//! upward or when it returns to the pool.
//!
//! Transmit data is mapped per submission into a fixed-size `SegmentList`
//! so the hot path does not allocate.

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::error::{AllocError, DmaError};

/// Hard upper bound on descriptors per transmitted packet.
pub const MAX_SGL: usize = 32;

/// Bus address as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    #[inline]
    pub fn offset(self, bytes: usize) -> DmaAddr {
        DmaAddr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Maps host memory for device access.
pub trait DmaMapper: Send + Sync {
    fn map(&self, ptr: *const u8, len: usize, dir: DmaDirection) -> Result<DmaAddr, DmaError>;

    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
}

/// Mapper for devices that see host physical memory 1:1.
///
/// Keeps a count of live mappings so leaks show up in counters and tests.
#[derive(Debug, Default)]
pub struct IdentityMapper {
    live: AtomicUsize,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl DmaMapper for IdentityMapper {
    fn map(&self, ptr: *const u8, len: usize, _dir: DmaDirection) -> Result<DmaAddr, DmaError> {
        if ptr.is_null() {
            return Err(DmaError::MappingFailed { len });
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(DmaAddr(ptr as u64))
    }

    fn unmap(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One mapped transmit segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappedSegment {
    pub addr: DmaAddr,
    pub len: u32,
}

/// Fixed-capacity list of mapped segments for one packet.
#[derive(Clone, Copy)]
pub struct SegmentList {
    segs: [MappedSegment; MAX_SGL],
    len: usize,
}

impl Default for SegmentList {
    fn default() -> Self {
        Self {
            segs: [MappedSegment::default(); MAX_SGL],
            len: 0,
        }
    }
}

impl fmt::Debug for SegmentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl SegmentList {
    #[inline]
    pub fn as_slice(&self) -> &[MappedSegment] {
        &self.segs[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_len(&self) -> u64 {
        self.as_slice().iter().map(|s| s.len as u64).sum()
    }

    /// Map each non-empty slice for device reads.
    ///
    /// On failure every segment mapped so far is unmapped again.
    pub fn map<'a>(
        mapper: &dyn DmaMapper,
        slices: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self, DmaError> {
        let mut list = Self::default();
        for slice in slices {
            if slice.is_empty() {
                continue;
            }
            if list.len == MAX_SGL {
                list.unmap(mapper);
                return Err(DmaError::MappingFailed { len: slice.len() });
            }
            match mapper.map(slice.as_ptr(), slice.len(), DmaDirection::ToDevice) {
                Ok(addr) => {
                    list.segs[list.len] = MappedSegment {
                        addr,
                        len: slice.len() as u32,
                    };
                    list.len += 1;
                }
                Err(e) => {
                    list.unmap(mapper);
                    return Err(e);
                }
            }
        }
        Ok(list)
    }

    pub fn unmap(&mut self, mapper: &dyn DmaMapper) {
        for seg in self.as_slice() {
            mapper.unmap(seg.addr, seg.len as usize, DmaDirection::ToDevice);
        }
        self.len = 0;
    }
}

struct PoolInner {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Total size of mapped region
    size: usize,
    page_size: usize,
    free: ArrayQueue<u32>,
    mapper: Arc<dyn DmaMapper>,
    allocations: AtomicU64,
}

// SAFETY: the region is process-global mmap'd memory, each page index is
// owned by at most one RxPage at a time, and ArrayQueue is thread-safe.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping created in PagePool::new
        // and no RxPage outlives the Arc holding this pool.
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
    }
}

/// Pool of fixed-size receive pages.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    /// Create a pool of `pages` pages of `page_size` bytes.
    ///
    /// Attempts to use 2MB hugepages for better TLB performance.
    /// Falls back to regular pages if hugepages are not available.
    pub fn new(pages: usize, page_size: usize, mapper: Arc<dyn DmaMapper>) -> io::Result<Self> {
        if pages == 0 || page_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page pool needs at least one page",
            ));
        }
        let size = pages
            .checked_mul(page_size)
            .ok_or_else(|| io::Error::other("size overflow"))?;

        let (base, using_hugepages) = Self::mmap_region(size, true)
            .or_else(|_| Self::mmap_region(size, false))?;

        let free = ArrayQueue::new(pages);
        for i in 0..pages {
            let _ = free.push(i as u32);
        }

        tracing::info!(
            pool_size_kb = size / 1024,
            page_count = pages,
            page_size,
            hugepages = using_hugepages,
            "Receive page pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                base,
                size,
                page_size,
                free,
                mapper,
                allocations: AtomicU64::new(0),
            }),
        })
    }

    fn mmap_region(size: usize, huge: bool) -> io::Result<(NonNull<u8>, bool)> {
        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        if huge {
            flags |= MapFlags::MAP_HUGETLB;
        }

        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.cast(), huge))
    }

    /// Take a page and map it for device access.
    ///
    /// The device writes at `headroom` bytes into the page.
    pub fn allocate(&self, headroom: usize) -> Result<RxPage, AllocError> {
        let index = self.inner.free.pop().ok_or(AllocError::Exhausted)?;
        let mut page = RxPage {
            pool: self.inner.clone(),
            index,
            headroom: headroom.min(self.inner.page_size),
            dma: None,
        };
        let addr = self.inner.mapper.map(
            page.as_slice().as_ptr(),
            self.inner.page_size,
            DmaDirection::Bidirectional,
        )?;
        page.dma = Some(addr);
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Successful allocations since the pool was created.
    pub fn allocations(&self) -> u64 {
        self.inner.allocations.load(Ordering::Relaxed)
    }
}

/// A receive page owned by the engine or by the host.
///
/// Unmaps itself (if still mapped) and returns to the pool when dropped.
pub struct RxPage {
    pool: Arc<PoolInner>,
    index: u32,
    headroom: usize,
    dma: Option<DmaAddr>,
}

impl RxPage {
    /// Device address of the first byte after the headroom.
    #[inline]
    pub fn dma_addr(&self) -> Option<DmaAddr> {
        self.dma.map(|a| a.offset(self.headroom))
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Bytes the device may write.
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.pool.page_size - self.headroom
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.pool.page_size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.dma.is_some()
    }

    /// Release the device mapping before the page leaves the engine.
    pub fn unmap(&mut self) {
        if let Some(addr) = self.dma.take() {
            self.pool
                .mapper
                .unmap(addr, self.pool.page_size, DmaDirection::Bidirectional);
        }
    }

    /// Whole page including headroom.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: index < page count and this RxPage exclusively owns it
        unsafe {
            let ptr = self
                .pool
                .base
                .as_ptr()
                .add(self.index as usize * self.pool.page_size);
            std::slice::from_raw_parts(ptr, self.pool.page_size)
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, &mut self guarantees unique access
        unsafe {
            let ptr = self
                .pool
                .base
                .as_ptr()
                .add(self.index as usize * self.pool.page_size);
            std::slice::from_raw_parts_mut(ptr, self.pool.page_size)
        }
    }
}

impl fmt::Debug for RxPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPage")
            .field("index", &self.index)
            .field("headroom", &self.headroom)
            .field("dma", &self.dma)
            .finish()
    }
}

impl Drop for RxPage {
    fn drop(&mut self) {
        self.unmap();
        let _ = self.pool.free.push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize) -> (PagePool, Arc<IdentityMapper>) {
        let mapper = Arc::new(IdentityMapper::new());
        let pool = PagePool::new(pages, 4096, mapper.clone()).expect("Failed to create pool");
        (pool, mapper)
    }

    #[test]
    fn test_allocate_maps_and_drop_returns() {
        let (pool, mapper) = pool(4);
        let page = pool.allocate(128).unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(mapper.live_mappings(), 1);
        assert_eq!(page.buffer_len(), 4096 - 128);
        let base = page.as_slice().as_ptr() as u64;
        assert_eq!(page.dma_addr(), Some(DmaAddr(base + 128)));

        drop(page);
        assert_eq!(pool.available(), 4);
        assert_eq!(mapper.live_mappings(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let (pool, _mapper) = pool(2);
        let _a = pool.allocate(0).unwrap();
        let _b = pool.allocate(0).unwrap();
        assert_eq!(pool.allocate(0).unwrap_err(), AllocError::Exhausted);
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn test_unmap_before_handoff() {
        let (pool, mapper) = pool(2);
        let mut page = pool.allocate(64).unwrap();
        page.as_mut_slice()[64] = 0xab;
        page.unmap();
        assert!(!page.is_mapped());
        assert_eq!(mapper.live_mappings(), 0);
        assert_eq!(page.as_slice()[64], 0xab);
        drop(page);
        assert_eq!(mapper.live_mappings(), 0);
    }

    #[test]
    fn test_segment_list_skips_empty_and_unmaps() {
        let mapper = IdentityMapper::new();
        let a = [1u8; 10];
        let b: [u8; 0] = [];
        let c = [2u8; 30];
        let mut list = SegmentList::map(&mapper, [&a[..], &b[..], &c[..]]).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_len(), 40);
        assert_eq!(mapper.live_mappings(), 2);
        list.unmap(&mapper);
        assert!(list.is_empty());
        assert_eq!(mapper.live_mappings(), 0);
    }

    #[test]
    fn test_segment_list_overflow_unmaps() {
        let mapper = IdentityMapper::new();
        let data = [0u8; 4];
        let slices = std::iter::repeat_n(&data[..], MAX_SGL + 1);
        assert!(SegmentList::map(&mapper, slices).is_err());
        assert_eq!(mapper.live_mappings(), 0);
    }
}
