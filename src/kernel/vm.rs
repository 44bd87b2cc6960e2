use crate::kalloc::{KMEM, UMEM};
use crate::memlayout::{
    kstack, CLINT, KERNBASE, MMAP_BEGIN, MMAP_END, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0,
    VIRTIO0,
};
use crate::mmap::{RegionList, POOL};
use crate::param::{NPROC, N_MMAP};
use crate::proc::CPUS;
use crate::riscv::{make_satp, pgroundup, register::satp, sfence_vma, PteFlags, MAXVA, PGSIZE};
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Index, IndexMut, Sub, SubAssign};
use core::ptr;

extern "C" {
    // kernel.ld sets this to the end of kernel code.
    fn etext();
    // trampoline.rs places the user/kernel switch code here.
    fn trampoline();
}

// the kernel page table, built once on hart 0 before the
// other harts leave the boot barrier.
static KVM: KvmCell = KvmCell(core::cell::UnsafeCell::new(None));

struct KvmCell(core::cell::UnsafeCell<Option<Kvm>>);
unsafe impl Sync for KvmCell {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PAddr(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct KVAddr(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UVAddr(usize);

// An address that is either a user virtual address in the current
// process, or a kernel address usable directly. File-system reads and
// writes take this so one code path serves syscalls and kernel callers.
#[derive(Debug, Clone, Copy)]
pub enum VirtAddr {
    User(usize),
    Kernel(usize),
}

impl VirtAddr {
    pub fn offset(self, n: usize) -> Self {
        match self {
            VirtAddr::User(a) => VirtAddr::User(a + n),
            VirtAddr::Kernel(a) => VirtAddr::Kernel(a + n),
        }
    }
}

pub trait Addr:
    Copy
    + From<usize>
    + Add<usize, Output = Self>
    + Sub<usize, Output = Self>
    + AddAssign<usize>
    + SubAssign<usize>
    + PartialOrd
    + Ord
{
    fn into_usize(self) -> usize;

    fn is_aligned(&self) -> bool {
        self.into_usize() % PGSIZE == 0
    }
    fn rounddown(self) -> Self {
        Self::from(self.into_usize() & !(PGSIZE - 1))
    }
    fn roundup(self) -> Self {
        Self::from((self.into_usize() + PGSIZE - 1) & !(PGSIZE - 1))
    }
}

pub trait VAddr: Addr {
    // extract one of the three 9-bit page-table indices.
    fn px(&self, level: usize) -> usize {
        (self.into_usize() >> (12 + 9 * level)) & 0x1FF
    }
}

macro_rules! impl_addr {
    ($typ:ident) => {
        impl From<usize> for $typ {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }
        impl Add<usize> for $typ {
            type Output = Self;
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
        impl AddAssign<usize> for $typ {
            fn add_assign(&mut self, rhs: usize) {
                self.0 += rhs;
            }
        }
        impl Sub<usize> for $typ {
            type Output = Self;
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }
        impl SubAssign<usize> for $typ {
            fn sub_assign(&mut self, rhs: usize) {
                self.0 -= rhs;
            }
        }
        impl Sub for $typ {
            type Output = usize;
            fn sub(self, rhs: Self) -> usize {
                self.0 - rhs.0
            }
        }
        impl Addr for $typ {
            fn into_usize(self) -> usize {
                self.0
            }
        }
    };
}

impl_addr!(PAddr);
impl_addr!(KVAddr);
impl_addr!(UVAddr);
impl VAddr for KVAddr {}
impl VAddr for UVAddr {}

#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(usize);

impl PageTableEntry {
    pub fn is_valid(&self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & PteFlags::U.bits() != 0
    }

    // an interior entry carries V and nothing else.
    pub fn is_leaf(&self) -> bool {
        self.0 & (PteFlags::R | PteFlags::W | PteFlags::X).bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3FF)
    }

    pub fn to_pa(&self) -> PAddr {
        PAddr((self.0 >> 10) << 12)
    }

    pub fn set(&mut self, pa: usize, perm: PteFlags) {
        self.0 = ((pa >> 12) << 10) | perm.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
struct RawPageTable {
    entries: [PageTableEntry; 512],
}

impl Index<usize> for RawPageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for RawPageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

// One root of a three-level Sv39 tree. Interior pages come from the
// kernel pool; leaf frames belong to whoever mapped them.
pub struct PageTable<V: VAddr> {
    ptr: *mut RawPageTable,
    _marker: PhantomData<V>,
}

unsafe impl<V: VAddr> Send for PageTable<V> {}

impl<V: VAddr> PageTable<V> {
    pub fn new() -> Option<Self> {
        let root = KMEM.alloc()?;
        Some(Self {
            ptr: root.as_ptr() as *mut RawPageTable,
            _marker: PhantomData,
        })
    }

    pub fn as_satp(&self) -> usize {
        make_satp(self.ptr as usize)
    }

    // Find the address of the level-0 PTE for va, creating interior
    // page-table pages on the way down when alloc is set. The RISC-V
    // Sv39 scheme has three levels of 512-entry tables; a virtual
    // address selects one entry per level with 9 bits each.
    pub fn walk(&mut self, va: V, alloc: bool) -> Option<&mut PageTableEntry> {
        assert!(va.into_usize() < MAXVA, "walk");
        let mut pt = self.ptr;
        for level in (1..3).rev() {
            let pte = unsafe { &mut (*pt)[va.px(level)] };
            if pte.is_valid() {
                pt = pte.to_pa().into_usize() as *mut RawPageTable;
            } else {
                if !alloc {
                    return None;
                }
                let mem = KMEM.alloc()?;
                pt = mem.as_ptr() as *mut RawPageTable;
                pte.set(pt as usize, PteFlags::V);
            }
        }
        Some(unsafe { &mut (*pt)[va.px(0)] })
    }

    // Create PTEs for [va, va + len) -> [pa, pa + len).
    // va, pa and len must be page-aligned and len non-zero; re-mapping
    // an address to a different frame is a kernel bug. Running out of
    // kernel frames for interior pages is fatal, too: page-table growth
    // has no recovery path.
    pub fn map_pages(&mut self, mut va: V, mut pa: PAddr, len: usize, perm: PteFlags) {
        assert!(va.is_aligned(), "map_pages: va not aligned");
        assert!(pa.is_aligned(), "map_pages: pa not aligned");
        assert!(len > 0 && len % PGSIZE == 0, "map_pages: bad len");

        let last = va + (len - PGSIZE);
        loop {
            let pte = self.walk(va, true).expect("map_pages: out of memory");
            if pte.is_valid() && pte.to_pa() != pa {
                panic!("map_pages: remap");
            }
            pte.set(pa.into_usize(), perm | PteFlags::V);
            if va == last {
                break;
            }
            va += PGSIZE;
            pa += PGSIZE;
        }
    }

    // Remove the mappings of [va, va + len), silently skipping holes.
    // With free set, the referenced frames go back to the user pool.
    pub fn unmap_pages(&mut self, mut va: V, len: usize, free: bool) {
        assert!(va.is_aligned(), "unmap_pages: va not aligned");
        assert!(len > 0 && len % PGSIZE == 0, "unmap_pages: bad len");

        let end = va + len;
        while va < end {
            if let Some(pte) = self.walk(va, false) {
                if pte.is_valid() {
                    if free {
                        UMEM.free(pte.to_pa());
                    }
                    pte.clear();
                }
            }
            va += PGSIZE;
        }
    }
}

// ---------------------------------------------------------------- kernel

pub struct Kvm {
    page_table: PageTable<KVAddr>,
}

impl Kvm {
    // Build the direct-mapped kernel page table: devices, kernel text
    // (RX), kernel data plus both frame pools (RW), the trampoline at
    // the top, and one mapped stack per process slot with guard gaps.
    fn make() -> Self {
        let mut pt = PageTable::<KVAddr>::new().expect("kvm: out of memory");

        let mut map = |va: usize, pa: usize, len: usize, perm: PteFlags| {
            pt.map_pages(KVAddr::from(va), PAddr::from(pa), len, perm);
        };

        map(UART0, UART0, PGSIZE, PteFlags::RW);
        map(VIRTIO0, VIRTIO0, PGSIZE, PteFlags::RW);
        map(CLINT, CLINT, 0x10000, PteFlags::RW);
        map(PLIC, PLIC, 0x40_0000, PteFlags::RW);

        let text_end = etext as usize;
        map(KERNBASE, KERNBASE, text_end - KERNBASE, PteFlags::RX);
        map(text_end, text_end, PHYSTOP - text_end, PteFlags::RW);

        map(TRAMPOLINE, trampoline as usize, PGSIZE, PteFlags::RX);

        for p in 0..NPROC {
            let pa = KMEM.alloc().expect("kvm: kstack");
            map(kstack(p), pa.as_ptr() as usize, PGSIZE, PteFlags::RW);
        }

        Kvm { page_table: pt }
    }
}

// Create the one kernel page table. Hart 0 only, before the barrier.
pub fn kinit() {
    unsafe { *KVM.0.get() = Some(Kvm::make()) };
}

// Switch the hart's satp to the kernel page table and flush the TLB.
pub fn kinithart() {
    let kvm = unsafe { (*KVM.0.get()).as_ref().unwrap() };
    unsafe {
        sfence_vma();
        satp::write(kvm.page_table.as_satp());
        sfence_vma();
    }
}

// ------------------------------------------------------------------ user

// One process's user address space: the Sv39 tree plus the operations
// the process lifecycle needs. The mmap free list lives in proc; the
// routines here take it by reference.
pub struct Uvm {
    page_table: PageTable<UVAddr>,
}

impl Uvm {
    pub fn create() -> Option<Self> {
        Some(Self {
            page_table: PageTable::new()?,
        })
    }

    pub fn as_satp(&self) -> usize {
        self.page_table.as_satp()
    }

    pub fn walk(&mut self, va: UVAddr, alloc: bool) -> Option<&mut PageTableEntry> {
        self.page_table.walk(va, alloc)
    }

    pub fn map_pages(&mut self, va: UVAddr, pa: PAddr, len: usize, perm: PteFlags) {
        self.page_table.map_pages(va, pa, len, perm)
    }

    pub fn unmap_pages(&mut self, va: UVAddr, len: usize, free: bool) {
        self.page_table.unmap_pages(va, len, free)
    }

    // Translate a user virtual address to the physical address of the
    // byte it names. The page must be mapped with PTE_U; anything else
    // on a copy path is a kernel bug, per the copyin/copyout contract.
    fn translate(&mut self, va: UVAddr) -> usize {
        let off = va.into_usize() % PGSIZE;
        match self.walk(va.rounddown(), false) {
            Some(pte) if pte.is_valid() && pte.is_user() => pte.to_pa().into_usize() + off,
            _ => panic!("translate: bad user address {:#x}", va.into_usize()),
        }
    }

    // Copy from kernel memory to user virtual addresses, page by page.
    pub fn copy_out(&mut self, mut dst: UVAddr, src: &[u8]) {
        let mut copied = 0;
        while copied < src.len() {
            let pa = self.translate(dst);
            let n = core::cmp::min(
                src.len() - copied,
                PGSIZE - dst.into_usize() % PGSIZE,
            );
            unsafe {
                ptr::copy_nonoverlapping(src[copied..].as_ptr(), pa as *mut u8, n);
            }
            copied += n;
            dst += n;
        }
    }

    // Copy from user virtual addresses into kernel memory.
    pub fn copy_in(&mut self, dst: &mut [u8], mut src: UVAddr) {
        let mut copied = 0;
        while copied < dst.len() {
            let pa = self.translate(src);
            let n = core::cmp::min(
                dst.len() - copied,
                PGSIZE - src.into_usize() % PGSIZE,
            );
            unsafe {
                ptr::copy_nonoverlapping(pa as *const u8, dst[copied..].as_mut_ptr(), n);
            }
            copied += n;
            src += n;
        }
    }

    // Copy a NUL-terminated string from user space, stopping at the
    // terminator or at the end of dst. Returns the copied str.
    pub fn copy_in_str<'a>(&mut self, dst: &'a mut [u8], mut src: UVAddr) -> Result<&'a str, ()> {
        let mut copied = 0;
        while copied < dst.len() {
            let pa = self.translate(src);
            let n = core::cmp::min(
                dst.len() - copied,
                PGSIZE - src.into_usize() % PGSIZE,
            );
            let page = unsafe { core::slice::from_raw_parts(pa as *const u8, n) };
            match page.iter().position(|&c| c == 0) {
                Some(i) => {
                    dst[copied..copied + i].copy_from_slice(&page[..i]);
                    let s = &dst[..copied + i];
                    return core::str::from_utf8(s).or(Err(()));
                }
                None => {
                    dst[copied..copied + n].copy_from_slice(page);
                    copied += n;
                    src += n;
                }
            }
        }
        Err(()) // no terminator within dst
    }

    // Grow the heap so it covers [heap_top, heap_top + len), allocating
    // zeroed user frames. Pages already covered by heap_top stay as
    // they are. Fails (None) past the stack limit or when the user pool
    // runs dry, unmapping anything it mapped first.
    pub fn heap_grow(&mut self, heap_top: usize, len: usize, perm: PteFlags) -> Option<usize> {
        let new_top = heap_top + len;
        if new_top > TRAPFRAME - PGSIZE {
            return None;
        }

        let start = pgroundup(heap_top);
        let end = pgroundup(new_top);
        let mut va = start;
        while va < end {
            match UMEM.alloc() {
                Some(mem) => {
                    self.map_pages(
                        UVAddr::from(va),
                        PAddr::from(mem.as_ptr() as usize),
                        PGSIZE,
                        perm | PteFlags::U,
                    );
                }
                None => {
                    if va > start {
                        self.unmap_pages(UVAddr::from(start), va - start, true);
                    }
                    return None;
                }
            }
            va += PGSIZE;
        }
        Some(new_top)
    }

    // Shrink the heap by len bytes, freeing whole pages that fall at or
    // above the new top. Returns the new top.
    pub fn heap_ungrow(&mut self, heap_top: usize, len: usize) -> usize {
        let new_top = heap_top - len;
        let start = pgroundup(new_top);
        let end = pgroundup(heap_top);
        if end > start {
            self.unmap_pages(UVAddr::from(start), end - start, true);
        }
        new_top
    }

    // Map [begin, begin + npages * PGSIZE) in the arena with fresh user
    // frames. The caller (sys_mmap) has verified the range is free in
    // the process's region list; reserve() panics if it is not.
    pub fn mmap(
        &mut self,
        list: &mut RegionList,
        begin: usize,
        npages: usize,
        perm: PteFlags,
    ) -> Result<(), ()> {
        if npages == 0 {
            return Ok(());
        }
        POOL.lock().reserve(list, begin, npages)?;
        let mut va = begin;
        while va < begin + npages * PGSIZE {
            let mem = UMEM.alloc().expect("mmap: out of user frames");
            self.map_pages(
                UVAddr::from(va),
                PAddr::from(mem.as_ptr() as usize),
                PGSIZE,
                perm | PteFlags::U,
            );
            va += PGSIZE;
        }
        Ok(())
    }

    // Undo a mapping made by mmap: record the hole in the free list,
    // then unmap and free the frames. The node is taken first so a dry
    // pool fails before any mapping is torn down.
    pub fn munmap(
        &mut self,
        list: &mut RegionList,
        begin: usize,
        npages: usize,
    ) -> Result<(), ()> {
        if npages == 0 {
            return Ok(());
        }
        POOL.lock().insert_free(list, begin, npages)?;
        self.unmap_pages(UVAddr::from(begin), npages * PGSIZE, true);
        Ok(())
    }

    // Deep-copy this address space into new: code + heap, the user
    // stack, and every mapped run of the arena (the complement of the
    // free list). Trampoline and trapframe are not copied; the child
    // maps its own.
    pub fn copy_to(
        &mut self,
        new: &mut Uvm,
        heap_top: usize,
        ustack_pages: usize,
        list: &RegionList,
    ) -> Result<(), ()> {
        use crate::memlayout::USER_BASE;

        self.copy_range(new, USER_BASE, pgroundup(heap_top))?;

        let ustack_bottom = TRAPFRAME - ustack_pages * PGSIZE;
        self.copy_range(new, ustack_bottom, TRAPFRAME)?;

        // snapshot the free runs so the pool lock is not held while
        // whole pages are being copied.
        let mut free_runs = [(0usize, 0usize); N_MMAP];
        let mut n = 0;
        for run in POOL.lock().runs(list) {
            free_runs[n] = run;
            n += 1;
        }

        let mut cur = MMAP_BEGIN;
        for &(begin, npages) in &free_runs[..n] {
            if begin > cur {
                self.copy_range(new, cur, begin)?;
            }
            cur = begin + npages * PGSIZE;
        }
        if cur < MMAP_END {
            self.copy_range(new, cur, MMAP_END)?;
        }
        Ok(())
    }

    // Copy [begin, end) page by page: allocate a fresh user frame,
    // duplicate the contents, map with the same permissions.
    fn copy_range(&mut self, new: &mut Uvm, begin: usize, end: usize) -> Result<(), ()> {
        let mut va = begin;
        while va < end {
            let (pa, flags) = match self.walk(UVAddr::from(va), false) {
                Some(pte) if pte.is_valid() => (pte.to_pa(), pte.flags()),
                _ => panic!("copy_range: page not present"),
            };
            let mem = UMEM.alloc().ok_or(())?;
            unsafe {
                ptr::copy_nonoverlapping(
                    pa.into_usize() as *const u8,
                    mem.as_ptr() as *mut u8,
                    PGSIZE,
                );
            }
            new.map_pages(
                UVAddr::from(va),
                PAddr::from(mem.as_ptr() as usize),
                PGSIZE,
                flags,
            );
            va += PGSIZE;
        }
        Ok(())
    }

    // Tear the whole address space down. The trampoline is shared by
    // every process and the trapframe's frame belongs to the process
    // record, so both are unmapped without freeing before the tree is
    // recursively destroyed.
    pub fn destroy(mut self) {
        self.unmap_pages(UVAddr::from(TRAMPOLINE), PGSIZE, false);
        self.unmap_pages(UVAddr::from(TRAPFRAME), PGSIZE, false);
        unsafe { destroy_level(self.page_table.ptr, 2) };
        KMEM.free(PAddr::from(self.page_table.ptr as usize));
    }
}

// Free every frame reachable from a page-table page: interior pages go
// back to the kernel pool, leaves to the user pool.
unsafe fn destroy_level(pt: *mut RawPageTable, level: usize) {
    for i in 0..512 {
        let pte = &mut (*pt)[i];
        if pte.is_valid() {
            let pa = pte.to_pa();
            if level > 0 {
                destroy_level(pa.into_usize() as *mut RawPageTable, level - 1);
                KMEM.free(pa);
            } else {
                UMEM.free(pa);
            }
            pte.clear();
        }
    }
}

// Copy to a destination that is either a user address in the current
// process or plain kernel memory.
pub fn either_copy_out(dst: VirtAddr, src: &[u8]) {
    match dst {
        VirtAddr::User(addr) => {
            let p = CPUS.my_proc().unwrap();
            p.data_mut().uvm.as_mut().unwrap().copy_out(UVAddr::from(addr), src);
        }
        VirtAddr::Kernel(addr) => unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len());
        },
    }
}

// Copy from a source that is either a user address in the current
// process or plain kernel memory.
pub fn either_copy_in(dst: &mut [u8], src: VirtAddr) {
    match src {
        VirtAddr::User(addr) => {
            let p = CPUS.my_proc().unwrap();
            p.data_mut().uvm.as_mut().unwrap().copy_in(dst, UVAddr::from(addr));
        }
        VirtAddr::Kernel(addr) => unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len());
        },
    }
}
