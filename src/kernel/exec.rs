// exec: replace the current process image with an ELF executable.
//
// The new address space (page table, segments, stack, trapframe) is
// built completely before anything of the old one is touched, so a
// failure at any point leaves the caller exactly as it was.

use crate::elf::{ElfHeader, ProgHeader, ELF_HEADER_SIZE, ELF_PROG_LOAD, PROG_HEADER_SIZE};
use crate::fs::{self, IData};
use crate::kalloc::{KMEM, UMEM};
use crate::memlayout::{TRAPFRAME, USER_BASE};
use crate::mmap::POOL;
use crate::param::MAXARG;
use crate::proc::{user_pagetable, Trapframe, CPUS};
use crate::riscv::{pgroundup, PteFlags, PGSIZE};
use crate::sleeplock::SleepLockGuard;
use crate::vm::{Addr, PAddr, UVAddr, Uvm, VirtAddr};
use core::ptr::NonNull;

struct Image {
    heap_top: usize,
    entry: usize,
    sp: usize,
    argc: usize,
}

pub fn exec(path: &[u8], argv: &[&[u8]]) -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();

    // the replacement trapframe starts as a copy of the old one.
    let tf_page = KMEM.alloc().ok_or(())?;
    let new_tf: NonNull<Trapframe> = tf_page.cast();
    unsafe {
        core::ptr::copy_nonoverlapping(
            data.trapframe() as *const Trapframe,
            new_tf.as_ptr(),
            1,
        );
    }

    let mut uvm = match user_pagetable(tf_page.as_ptr() as usize) {
        Some(uvm) => uvm,
        None => {
            KMEM.free(PAddr::from(tf_page.as_ptr() as usize));
            return Err(());
        }
    };

    match build_image(&mut uvm, path, argv) {
        Ok(img) => {
            // point of no return: swap in the new address space and
            // only then tear the old one down.
            let old_uvm = data.uvm.replace(uvm).unwrap();
            let old_tf = data.trapframe.replace(new_tf).unwrap();
            {
                let mut pool = POOL.lock();
                pool.release(&mut data.mmap);
                data.mmap = pool.full_list();
            }
            data.heap_top = img.heap_top;
            data.ustack_pages = 1;
            if let Some(name) = path.rsplit(|&c| c == b'/').next() {
                data.set_name(name);
            }

            let tf = data.trapframe_mut();
            tf.epc = img.entry;
            tf.sp = img.sp;
            tf.a0 = img.argc; // also the syscall return value
            tf.a1 = img.sp; // argv array sits at the stack top

            old_uvm.destroy();
            KMEM.free(PAddr::from(old_tf.as_ptr() as usize));
            Ok(img.argc)
        }
        Err(()) => {
            uvm.destroy();
            KMEM.free(PAddr::from(tf_page.as_ptr() as usize));
            Err(())
        }
    }
}

// Populate the new page table: program segments, then one stack page
// carrying the argument vectors.
fn build_image(uvm: &mut Uvm, path: &[u8], argv: &[&[u8]]) -> Result<Image, ()> {
    let ip = fs::path_to_inode(path).ok_or(())?;
    let mut guard = ip.lock();

    let mut ehb = [0u8; ELF_HEADER_SIZE];
    if guard.read(VirtAddr::Kernel(ehb.as_mut_ptr() as usize), 0, ELF_HEADER_SIZE)
        != ELF_HEADER_SIZE
    {
        return Err(());
    }
    let eh = ElfHeader::from_bytes(&ehb);
    if !eh.is_valid() {
        return Err(());
    }

    let mut heap_top = USER_BASE;
    for i in 0..eh.phnum as u64 {
        let off = eh.phoff + i * PROG_HEADER_SIZE as u64;
        let mut phb = [0u8; PROG_HEADER_SIZE];
        if guard.read(VirtAddr::Kernel(phb.as_mut_ptr() as usize), off, PROG_HEADER_SIZE)
            != PROG_HEADER_SIZE
        {
            return Err(());
        }
        let ph = ProgHeader::from_bytes(&phb);
        if ph.ptype != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return Err(());
        }
        if ph.vaddr as usize % PGSIZE != 0 || (ph.vaddr as usize) < heap_top {
            return Err(());
        }

        // cover [heap_top, vaddr + memsz) with fresh zeroed frames;
        // the bytes past filesz are the segment's BSS and stay zero.
        let seg_end = (ph.vaddr + ph.memsz) as usize;
        match uvm.heap_grow(heap_top, seg_end - heap_top, ph.perm()) {
            Some(top) if top == seg_end => heap_top = top,
            _ => return Err(()),
        }

        load_segment(uvm, &mut guard, ph.vaddr as usize, ph.off, ph.filesz as usize)?;
    }
    drop(guard);
    drop(ip);

    let heap_top = pgroundup(heap_top);

    // one page of user stack, just below the trapframe.
    let stack = UMEM.alloc().ok_or(())?;
    uvm.map_pages(
        UVAddr::from(TRAPFRAME - PGSIZE),
        PAddr::from(stack.as_ptr() as usize),
        PGSIZE,
        PteFlags::RWU,
    );
    let stack_base = TRAPFRAME - PGSIZE;
    let mut sp = TRAPFRAME;

    // push the argument strings, then the argv pointer array, keeping
    // sp 16-byte aligned as the RISC-V calling convention requires.
    let mut arg_ptrs = [0usize; MAXARG + 1];
    if argv.len() > MAXARG {
        return Err(());
    }
    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1; // include the terminator
        sp -= sp % 16;
        if sp < stack_base {
            return Err(());
        }
        uvm.copy_out(UVAddr::from(sp), arg);
        uvm.copy_out(UVAddr::from(sp + arg.len()), &[0]);
        arg_ptrs[i] = sp;
    }
    let argc = argv.len();
    arg_ptrs[argc] = 0;

    let vec_bytes = (argc + 1) * core::mem::size_of::<usize>();
    sp -= vec_bytes;
    sp -= sp % 16;
    if sp < stack_base {
        return Err(());
    }
    let mut vec = [0u8; (MAXARG + 1) * 8];
    for (i, ptr) in arg_ptrs[..=argc].iter().enumerate() {
        vec[i * 8..i * 8 + 8].copy_from_slice(&(*ptr as u64).to_le_bytes());
    }
    uvm.copy_out(UVAddr::from(sp), &vec[..vec_bytes]);

    Ok(Image {
        heap_top,
        entry: eh.entry as usize,
        sp,
        argc,
    })
}

// Copy a segment's file bytes into the freshly mapped pages. The
// pages are written through their physical addresses, which the
// kernel maps one-to-one.
fn load_segment(
    uvm: &mut Uvm,
    guard: &mut SleepLockGuard<'static, IData>,
    va: usize,
    off: u64,
    size: usize,
) -> Result<(), ()> {
    let mut done = 0;
    while done < size {
        let pte = uvm.walk(UVAddr::from(va + done), false).ok_or(())?;
        let pa = pte.to_pa().into_usize();
        let n = core::cmp::min(size - done, PGSIZE);
        if guard.read(VirtAddr::Kernel(pa), off + done as u64, n) != n {
            return Err(());
        }
        done += n;
    }
    Ok(())
}
