//! Bump allocator for values that are never freed
//!
//! Memory is mapped from the system a page at a time (anonymous, zeroed
//! mappings) and handed out by bumping a cursor shared between all threads.
//! Nothing is ever freed individually; every mapping is unmapped in one go
//! when the allocator is dropped.
//!
//! Requests of at least a page get their own dedicated region.
//!
//! The cursor is the address of the next free byte in the current page.
//! It is advanced with a CAS. If a request doesn't fit in the rest of the
//! current page, the requesting thread obtains a brand new page and tries to
//! swing the cursor into it. If two threads do this at the same time, the
//! loser gives its page back and retries against the winner's page.
//!
//! ```text
//!    page N-1 (full)           page N (current)
//! +-------------------+   +---------------------------+
//! | a | b | c | ... | |   | d | e |     free ...      |
//! +-------------------+   +---------------------------+
//!                                 ^
//!                                 cursor
//! ```

use std::{
    alloc::Layout,
    cmp,
    fmt::{self, Debug},
    mem::size_of,
    ptr::NonNull,
    sync::atomic::Ordering,
};

use memmap2::MmapMut;
use tracing::Level;

use crate::{
    fatal::fatal_error,
    list::ConcurrentList,
    loom_testing::*,
    util::{align_up_wrapping, roundto, UsizePtr},
};

/// Every allocation is at least this aligned (and a multiple of this size)
pub const MIN_ALIGN: usize = size_of::<usize>();
/// Page size to use when the system can't tell us
pub const FALLBACK_PAGE_SIZE: usize = 4096;
/// Cursor value meaning "no current page"
///
/// Guarantees the very first small request goes and obtains a page.
const CURSOR_NO_PAGE: usize = 0;

#[cfg(unix)]
fn os_page_size() -> usize {
    // safety: sysconf has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 && (sz as usize).is_power_of_two() {
        sz as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}
#[cfg(not(unix))]
fn os_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

/// Anonymous mapping obtained from the system, unmapped on drop
struct Region {
    /// First usable byte (aligned as requested)
    addr: usize,
    /// Usable bytes starting at `addr`
    size: usize,
    map: MmapMut,
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("addr", &UsizePtr(self.addr))
            .field("size", &self.size)
            .field("map_len", &self.map.len())
            .finish()
    }
}

pub struct BumpPageAllocator {
    /// Size (and alignment) of the pages that small requests are carved from
    page_size: usize,
    /// Alignment that every fresh mapping is guaranteed to have
    map_align: usize,
    /// Address of the next free byte in the current page, or [CURSOR_NO_PAGE]
    next: AtomicUsize,
    /// Every mapping that is still in use, unmapped when the list is dropped
    regions: ConcurrentList<Region>,
    /// Number of regions obtained from the system, including dedicated ones
    pages_obtained: AtomicUsize,
    /// Number of pages handed straight back after losing a race
    pages_returned: AtomicUsize,
    /// Sum of the sizes that were asked for
    bytes_requested: AtomicUsize,
}

impl Debug for BumpPageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpPageAllocator")
            .field("@addr", &(self as *const _))
            .field("page_size", &self.page_size)
            .field("next", &UsizePtr(self.next.load(Ordering::Relaxed)))
            .field("pages_obtained", &self.pages_obtained())
            .field("pages_returned", &self.pages_returned())
            .field("bytes_requested", &self.bytes_requested())
            .finish()
    }
}

impl Default for BumpPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BumpPageAllocator {
    /// Allocator that carves small requests out of system-sized pages
    pub fn new() -> Self {
        Self::with_page_size(os_page_size())
    }

    /// Allocator with a custom page size
    ///
    /// Panics if `page_size` isn't a power of 2 or is smaller than [MIN_ALIGN]
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= MIN_ALIGN,
            "Invalid page size {}",
            page_size
        );

        Self {
            page_size,
            map_align: os_page_size(),
            next: AtomicUsize::new(CURSOR_NO_PAGE),
            regions: ConcurrentList::new(),
            pages_obtained: AtomicUsize::new(0),
            pages_returned: AtomicUsize::new(0),
            bytes_requested: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_obtained(&self) -> usize {
        self.pages_obtained.load(Ordering::Relaxed)
    }

    pub fn pages_returned(&self) -> usize {
        self.pages_returned.load(Ordering::Relaxed)
    }

    pub fn bytes_requested(&self) -> usize {
        self.bytes_requested.load(Ordering::Relaxed)
    }

    #[inline]
    fn page_base(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    /// Map a fresh zeroed region of at least `size` bytes aligned to `align`
    ///
    /// Aborts if the system won't give us one.
    fn map_region(&self, size: usize, align: usize) -> Region {
        // mappings only come back aligned to the system page,
        // anything stricter maps extra and skips ahead
        let slack = if align > self.map_align { align } else { 0 };
        let Some(len) = size.checked_add(slack) else {
            fatal_error(format_args!("region of {} bytes is too large", size));
        };
        let mut map = match MmapMut::map_anon(len) {
            Ok(x) => x,
            Err(e) => fatal_error(format_args!("failed to map {} bytes: {}", len, e)),
        };
        let base = map.as_mut_ptr() as usize;
        let addr = align_up_wrapping(base, align);
        debug_assert!(addr + size <= base + len);

        self.pages_obtained.fetch_add(1, Ordering::Relaxed);
        tracing::event!(
            name: "bump::map_region",
            Level::TRACE,
            ptr = ?UsizePtr(addr),
            size,
            map_len = len,
        );
        Region { addr, size, map }
    }

    /// Allocate `size` bytes, aligned to at least [MIN_ALIGN]
    ///
    /// Does *NOT* initialize the memory beyond what the system gave us.
    /// The memory is valid until this allocator is dropped.
    #[inline]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        // only fails for sizes within MIN_ALIGN of isize::MAX
        match Layout::from_size_align(size, MIN_ALIGN) {
            Ok(layout) => self.allocate_layout(layout),
            Err(_) => fatal_error(format_args!(
                "allocation of {} bytes is too large",
                size
            )),
        }
    }

    /// Allocate memory fitting `layout`
    ///
    /// Alignment is raised to at least [MIN_ALIGN] and size is rounded up to
    /// a multiple of that. Alignments larger than a page are supported, but
    /// always end up in a dedicated region.
    pub fn allocate_layout(&self, layout: Layout) -> NonNull<u8> {
        let align = cmp::max(layout.align(), MIN_ALIGN);
        let size = roundto(cmp::max(layout.size(), 1), MIN_ALIGN);
        self.bytes_requested.fetch_add(layout.size(), Ordering::Relaxed);

        if size >= self.page_size || align > self.page_size {
            return self.allocate_dedicated(size, align);
        }

        // order: acquire/release on the cursor so that a page obtained on one thread
        // (and zeroed there) happens-before another thread writing into its half of it
        let mut cur = self.next.load(Ordering::Acquire);
        loop {
            let mut start = align_up_wrapping(cur, align);
            let mut end = start.wrapping_add(size);
            let mut fresh_page = None;

            // end landing exactly on the next page counts as not fitting,
            // otherwise the cursor would point at a page that isn't ours
            if cur == CURSOR_NO_PAGE || end < cur || self.page_base(end) != self.page_base(cur)
            {
                let page = self.map_region(self.page_size, self.page_size);
                start = page.addr;
                end = start + size;
                fresh_page = Some(page);
            }
            let new_page = fresh_page.is_some();

            match self.next.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if let Some(page) = fresh_page {
                        self.regions.push_front(page);
                    }
                    tracing::event!(
                        name: "bump::allocate",
                        Level::TRACE,
                        ptr = ?UsizePtr(start),
                        size,
                        align,
                        new_page,
                    );
                    // safety: start is either inside a page we obtained or is a fresh page
                    return unsafe { NonNull::new_unchecked(start as *mut u8) };
                }
                Err(x) => {
                    if let Some(page) = fresh_page {
                        // somebody else moved the cursor first, unmap our page.
                        // nobody else ever saw it
                        let addr = page.addr;
                        drop(page);
                        self.pages_returned.fetch_add(1, Ordering::Relaxed);
                        tracing::event!(
                            name: "bump::return_page",
                            Level::TRACE,
                            ptr = ?UsizePtr(addr),
                        );
                    }
                    cur = x;
                    spin_hint();
                }
            }
        }
    }

    /// Big (or very aligned) requests get their own region rounded up to whole pages
    #[cold]
    fn allocate_dedicated(&self, size: usize, align: usize) -> NonNull<u8> {
        let Some(size) = size.checked_next_multiple_of(self.page_size) else {
            fatal_error(format_args!("allocation of {} bytes is too large", size));
        };
        let region = self.map_region(size, cmp::max(align, self.page_size));
        let addr = region.addr;
        self.regions.push_front(region);
        // safety: mappings are never null
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Move `value` into permanent storage
    ///
    /// `value` is never dropped.
    pub fn alloc_value<T>(&self, value: T) -> &mut T {
        let p = self.allocate_layout(Layout::new::<T>()).cast::<T>();
        unsafe {
            // safety: freshly allocated, big and aligned enough for a T, and nobody else has it
            p.as_ptr().write(value);
            &mut *p.as_ptr()
        }
    }

    /// Copy `src` into permanent storage
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let p = self.allocate_layout(Layout::for_value(src)).cast::<T>();
        unsafe {
            // safety: freshly allocated, big and aligned enough for src.len() Ts
            std::ptr::copy_nonoverlapping(src.as_ptr(), p.as_ptr(), src.len());
            std::slice::from_raw_parts_mut(p.as_ptr(), src.len())
        }
    }

    /// Whether `ptr` points into memory owned by this allocator
    ///
    /// This walks every region, so it is only meant for debugging.
    pub fn contains<T: ?Sized>(&self, ptr: *const T) -> bool {
        let addr = ptr as *const () as usize;
        self.regions
            .iter()
            .any(|r| addr >= r.addr && addr < r.addr + r.size)
    }
}
