// Process-facing system calls: memory, lifecycle, time.

use crate::exec::exec;
use crate::kalloc::{Page, UMEM};
use crate::memlayout::USER_BASE;
use crate::mmap::POOL;
use crate::param::{MAXARG, MAXPATH, TICKS_PER_SEC};
use crate::proc::CPUS;
use crate::riscv::{PteFlags, PGSIZE};
use crate::trap::TICKS;
use crate::vm::{PAddr, UVAddr};
use core::ptr::NonNull;

pub fn sys_fork() -> Result<usize, ()> {
    CPUS.my_proc().unwrap().fork()
}

pub fn sys_wait() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let addr = p.data().arg_addr(0);
    p.wait(addr).ok_or(())
}

pub fn sys_exit() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let status = p.data().arg(0) as i32;
    p.exit(status)
    // not reached
}

// Pause for a number of seconds, measured in timer ticks.
pub fn sys_sleep() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let sec = p.data().arg(0);
    let target = sec * TICKS_PER_SEC;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < target {
        ticks = p.sleep(&TICKS as *const _ as usize, ticks);
    }
    Ok(0)
}

// Grow or shrink the heap to new_top; 0 queries the current top.
pub fn sys_brk() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();
    let new_top = data.arg(0);
    let old_top = data.heap_top;

    if new_top == 0 {
        return Ok(old_top);
    }
    if new_top < USER_BASE {
        return Err(());
    }

    if new_top > old_top {
        let uvm = data.uvm.as_mut().unwrap();
        uvm.heap_grow(old_top, new_top - old_top, PteFlags::RW)
            .ok_or(())?;
        data.heap_top = new_top;
    } else if new_top < old_top {
        let uvm = data.uvm.as_mut().unwrap();
        data.heap_top = uvm.heap_ungrow(old_top, old_top - new_top);
    }
    Ok(data.heap_top)
}

// Map len bytes of fresh anonymous memory at start, or wherever the
// first large-enough free run is when start is 0.
pub fn sys_mmap() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();
    let mut start = data.arg(0);
    let len = data.arg(1);

    if len == 0 || start % PGSIZE != 0 || len % PGSIZE != 0 {
        return Err(());
    }
    let npages = len / PGSIZE;

    {
        let pool = POOL.lock();
        if start == 0 {
            start = pool.find_fit(&data.mmap, npages).ok_or(())?;
        } else if !pool.encloses(&data.mmap, start, npages) {
            return Err(()); // not (entirely) free
        }
    }

    let uvm = data.uvm.as_mut().unwrap();
    uvm.mmap(&mut data.mmap, start, npages, PteFlags::RW)?;
    Ok(start)
}

pub fn sys_munmap() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();
    let start = data.arg(0);
    let len = data.arg(1);

    if len == 0 || start % PGSIZE != 0 || len % PGSIZE != 0 {
        return Err(());
    }
    let npages = len / PGSIZE;

    // the whole range must be mapped arena space.
    if POOL.lock().overlaps(&data.mmap, start, npages) {
        return Err(());
    }
    use crate::memlayout::{MMAP_BEGIN, MMAP_END};
    if start < MMAP_BEGIN || start + len > MMAP_END {
        return Err(());
    }

    let uvm = data.uvm.as_mut().unwrap();
    uvm.munmap(&mut data.mmap, start, npages)?;
    Ok(0)
}

// argv strings are staged in user-pool pages while the old address
// space is still the live one.
struct ArgPages {
    pages: [Option<NonNull<Page>>; MAXARG],
    lens: [usize; MAXARG],
    n: usize,
}

impl ArgPages {
    fn new() -> Self {
        Self {
            pages: [None; MAXARG],
            lens: [0; MAXARG],
            n: 0,
        }
    }

    fn arg(&self, i: usize) -> &'static [u8] {
        let pg = self.pages[i].unwrap();
        unsafe { core::slice::from_raw_parts(pg.as_ptr() as *const u8, self.lens[i]) }
    }
}

impl Drop for ArgPages {
    fn drop(&mut self) {
        for pg in self.pages.iter_mut() {
            if let Some(pg) = pg.take() {
                UMEM.free(PAddr::from(pg.as_ptr() as usize));
            }
        }
    }
}

pub fn sys_exec() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();

    let mut path_buf = [0u8; MAXPATH];
    let path_len = data.arg_str(0, &mut path_buf)?.len();
    let uargv = data.arg(1);

    let mut args = ArgPages::new();
    for i in 0..MAXARG {
        // fetch the pointer to the i'th argument string
        let mut ptr = [0u8; 8];
        let uvm = data.uvm.as_mut().unwrap();
        uvm.copy_in(&mut ptr, UVAddr::from(uargv + 8 * i));
        let uarg = u64::from_le_bytes(ptr) as usize;
        if uarg == 0 {
            break;
        }

        let pg = UMEM.alloc().ok_or(())?;
        args.pages[i] = Some(pg);
        let buf = unsafe { core::slice::from_raw_parts_mut(pg.as_ptr() as *mut u8, PGSIZE) };
        args.lens[i] = uvm.copy_in_str(buf, UVAddr::from(uarg))?.len();
        args.n = i + 1;
    }

    let mut argv: [&[u8]; MAXARG] = [b""; MAXARG];
    for i in 0..args.n {
        argv[i] = args.arg(i);
    }

    exec(&path_buf[..path_len], &argv[..args.n])
}
