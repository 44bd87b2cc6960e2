// Physical page-frame allocator.
//
// The RAM between the end of the kernel image and PHYSTOP is split into
// two pools: a fixed KERN_PAGES-frame pool for kernel structures (page
// tables, trapframes, kernel stacks) and the remainder for user memory.
// Each pool is a LIFO free list threaded through the free frames
// themselves, guarded by its own spin lock.

use crate::memlayout::PHYSTOP;
use crate::param::KERN_PAGES;
use crate::riscv::{pgroundup, PGSIZE};
use crate::spinlock::Mutex;
use crate::vm::PAddr;
use core::ptr::{self, NonNull};

extern "C" {
    // first address after kernel. defined by kernel.ld.
    fn end();
}

pub static KMEM: PagePool = PagePool::new("kmem");
pub static UMEM: PagePool = PagePool::new("umem");

#[repr(C, align(4096))]
pub struct Page(pub [u8; PGSIZE]);

struct Run {
    next: Option<NonNull<Run>>,
}

struct Pool {
    begin: usize, // page-aligned, inclusive
    end: usize,   // page-aligned, exclusive
    allocable: usize,
    freelist: Option<NonNull<Run>>,
}

unsafe impl Send for Pool {}

pub struct PagePool {
    inner: Mutex<Pool>,
}

impl PagePool {
    const fn new(name: &'static str) -> Self {
        Self {
            inner: Mutex::new(
                Pool {
                    begin: 0,
                    end: 0,
                    allocable: 0,
                    freelist: None,
                },
                name,
            ),
        }
    }

    unsafe fn add_range(&self, begin: usize, end: usize) {
        {
            let mut pool = self.inner.lock();
            pool.begin = begin;
            pool.end = end;
        }
        let mut p = begin;
        while p + PGSIZE <= end {
            self.free(PAddr::from(p));
            p += PGSIZE;
        }
    }

    // Pop one frame off the free list and zero it.
    // Returns None when the pool is exhausted; callers on paths that
    // cannot make progress without memory panic at the call site.
    pub fn alloc(&self) -> Option<NonNull<Page>> {
        let run = {
            let mut pool = self.inner.lock();
            let run = pool.freelist?;
            pool.freelist = unsafe { run.as_ref().next };
            pool.allocable -= 1;
            run
        };
        let page = run.cast::<Page>();
        unsafe { ptr::write_bytes(page.as_ptr() as *mut u8, 0, PGSIZE) };
        Some(page)
    }

    // Return a frame to the free list.
    // Fills the frame with junk so dangling references are caught.
    pub fn free(&self, pa: PAddr) {
        let pa = pa.into_usize();
        let mut pool = self.inner.lock();
        if pa % PGSIZE != 0 || pa < pool.begin || pa >= pool.end {
            panic!("free: invalid page {:#x}", pa);
        }
        unsafe {
            ptr::write_bytes(pa as *mut u8, 1, PGSIZE);
            let mut run = NonNull::new_unchecked(pa as *mut Run);
            run.as_mut().next = pool.freelist;
            pool.freelist = Some(run);
        }
        pool.allocable += 1;
    }

    pub fn allocable(&self) -> usize {
        self.inner.lock().allocable
    }
}

// Partition the physical heap. Called once, on hart 0, before paging.
pub unsafe fn init() {
    let heap = pgroundup(end as usize);
    let kern_end = heap + KERN_PAGES * PGSIZE;
    assert!(kern_end < PHYSTOP, "init: no room for user pool");
    KMEM.add_range(heap, kern_end);
    UMEM.add_range(kern_end, PHYSTOP);
}
