use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use libc::{
    c_void, madvise, mmap, munmap, MADV_DONTFORK, MADV_HUGEPAGE, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use parking_lot::Mutex;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use crossbeam_epoch::{pin, Guard};

/// All pages handed out by the page manager have this size and
/// alignment. The alignment guarantee lets any pointer into a page
/// recover the page base address with a mask.
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Pointer to a page owned by the page manager.
///
/// The pointee is valid as long as the holder is inside an epoch that
/// was entered before the page could have been freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePtr(NonNull<u8>);

unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

impl PagePtr {
    /// Rebuild a page pointer from a raw address.
    ///
    /// # Safety
    ///
    /// The address must be the base address of a live page of the
    /// owning page manager.
    #[inline]
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % PAGE_SIZE == 0);
        unsafe { PagePtr(NonNull::new_unchecked(addr as *mut u8)) }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Base address of the page containing an arbitrary interior
    /// pointer.
    #[inline]
    pub fn base_of(addr: usize) -> usize {
        addr & !(PAGE_SIZE - 1)
    }
}

/// The reserved virtual region backing one page pool.
///
/// The reservation carries one page of slack so the first page can be
/// aligned up to PAGE_SIZE; that alignment is what lets any interior
/// pointer recover its page base with a mask. Unmapped when the
/// region is dropped.
struct PageRegion {
    ptr: *mut u8,
    bytes: usize,
    base: usize,
}

impl PageRegion {
    fn reserve(total_pages: usize) -> Result<Self> {
        let bytes = (total_pages + 1) * PAGE_SIZE;
        unsafe {
            let ptr = mmap(
                std::ptr::null_mut(),
                bytes,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == MAP_FAILED {
                return Err(Error::InsufficientMemory(bytes));
            }
            // pages match the transparent-huge-page size and
            // alignment; a forked child must never share pages whose
            // ownership protocol assumes a single process.
            madvise(ptr, bytes, MADV_HUGEPAGE);
            madvise(ptr, bytes, MADV_DONTFORK);
            let base = (ptr as usize).next_multiple_of(PAGE_SIZE);
            Ok(PageRegion {
                ptr: ptr as *mut u8,
                bytes,
                base,
            })
        }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr as *mut c_void, self.bytes);
        }
    }
}

/// A thread-safe allocator of identically sized pages carved from one
/// contiguous pre-reserved region.
///
/// Freed pages do not return to the free list immediately. `free`
/// defers the push through an epoch guard, so a page freed in epoch e
/// only becomes reusable once every thread pinned before e has
/// unpinned. Readers therefore never observe a page being reused
/// under them.
pub struct PageManager {
    region: PageRegion,
    total_pages: usize,
    free_list: Mutex<Vec<usize>>,
    allocated: AtomicUsize,
}

impl PageManager {
    /// Create a page manager over `pool_size` bytes of page memory.
    #[inline]
    pub fn with_capacity(pool_size: usize) -> Result<Self> {
        let total_pages = pool_size / PAGE_SIZE;
        if total_pages == 0 {
            return Err(Error::InsufficientMemory(pool_size));
        }
        let region = PageRegion::reserve(total_pages)?;
        let free_list = (0..total_pages)
            .rev()
            .map(|i| region.base + i * PAGE_SIZE)
            .collect();
        Ok(PageManager {
            region,
            total_pages,
            free_list: Mutex::new(free_list),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Create a page manager, leak it to heap and return the static
    /// reference.
    #[inline]
    pub fn with_capacity_static(pool_size: usize) -> Result<&'static Self> {
        let pool = Self::with_capacity(pool_size)?;
        Ok(StaticLifetime::new_static(pool))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.total_pages
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocate a zeroed page.
    #[inline]
    pub fn alloc(&self) -> Result<PagePtr> {
        let addr = {
            let mut g = self.free_list.lock();
            match g.pop() {
                Some(addr) => addr,
                None => return Err(Error::InsufficientMemory(PAGE_SIZE)),
            }
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        unsafe {
            (addr as *mut u8).write_bytes(0, PAGE_SIZE);
            Ok(PagePtr::from_addr(addr))
        }
    }

    /// Free a page that may still be referenced by concurrent
    /// readers. The page returns to the free list only after all
    /// current epoch pins have been released.
    #[inline]
    pub fn free(&'static self, page: PagePtr) {
        let addr = page.addr();
        debug_assert!(self.owns(addr));
        let guard = pin();
        unsafe {
            guard.defer_unchecked(move || {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                self.free_list.lock().push(addr);
            });
        }
    }

    /// Free a page that never escaped the calling thread, e.g. a
    /// scratch page or the loser of an allocation race.
    #[inline]
    pub fn free_local(&self, page: PagePtr) {
        let addr = page.addr();
        debug_assert!(self.owns(addr));
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.free_list.lock().push(addr);
    }

    #[inline]
    fn owns(&self, addr: usize) -> bool {
        addr >= self.region.base
            && addr < self.region.base + self.total_pages * PAGE_SIZE
            && addr % PAGE_SIZE == 0
    }
}

unsafe impl Send for PageManager {}

unsafe impl Sync for PageManager {}

unsafe impl StaticLifetime for PageManager {}

impl UnwindSafe for PageManager {}

impl RefUnwindSafe for PageManager {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_manager_alloc_free() {
        let pool = PageManager::with_capacity_static(16 * 1024 * 1024).unwrap();
        assert_eq!(pool.capacity(), 8);
        let p1 = pool.alloc().unwrap();
        assert_eq!(p1.addr() % PAGE_SIZE, 0);
        assert_eq!(pool.allocated(), 1);
        unsafe {
            // freshly allocated pages are zeroed.
            assert_eq!(*p1.as_ptr(), 0);
            assert_eq!(*p1.as_ptr().add(PAGE_SIZE - 1), 0);
        }
        pool.free_local(p1);
        assert_eq!(pool.allocated(), 0);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_page_manager_out_of_memory() {
        let pool = PageManager::with_capacity(2 * PAGE_SIZE).unwrap();
        let _p1 = pool.alloc().unwrap();
        let _p2 = pool.alloc().unwrap();
        assert!(matches!(
            pool.alloc(),
            Err(Error::InsufficientMemory(_))
        ));
    }

    #[test]
    fn test_page_manager_deferred_free() {
        let pool = PageManager::with_capacity_static(8 * 1024 * 1024).unwrap();
        let p1 = pool.alloc().unwrap();
        let _p2 = pool.alloc().unwrap();
        let _p3 = pool.alloc().unwrap();
        let _p4 = pool.alloc().unwrap();
        let addr = p1.addr();
        pool.free(p1);
        // the page is not reusable before the epoch advances.
        let mut got = None;
        for _ in 0..4096 {
            let g = pin();
            g.flush();
            drop(g);
            if let Ok(p) = pool.alloc() {
                got = Some(p);
                break;
            }
        }
        assert_eq!(got.expect("page reclaimed").addr(), addr);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_page_base_of() {
        assert_eq!(PagePtr::base_of(PAGE_SIZE + 17), PAGE_SIZE);
        assert_eq!(PagePtr::base_of(3 * PAGE_SIZE), 3 * PAGE_SIZE);
    }
}
