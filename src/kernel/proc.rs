use crate::file::File;
use crate::fs::{self, Inode, ITABLE, ROOTINO};
use crate::kalloc::{KMEM, UMEM};
use crate::memlayout::{kstack, TRAMPOLINE, TRAPFRAME, USER_BASE};
use crate::mmap::{RegionList, POOL};
use crate::param::{NCPU, NOFILE, NPROC};
use crate::riscv::{intr_get, intr_off, intr_on, PteFlags, PGSIZE};
use crate::spinlock::{Mutex, MutexGuard};
use crate::swtch::swtch;
use crate::trap::usertrap_ret;
use crate::vm::{PAddr, UVAddr, Uvm};
use crate::println;
use core::arch::asm;
use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub static CPUS: Cpus = Cpus::new();
pub static PROCS: Procs = Procs::new();

// the first process; exit() reparents orphans to it.
pub const INITPROC: usize = 0;

// Saved registers for kernel context switches.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    fn clear(&mut self) {
        *self = Context::new();
    }
}

// Per-process data for the trap handling code in trampoline.rs.
// Sits in a page of its own mapped at TRAPFRAME in the user page
// table; not specially mapped in the kernel page table. uservec saves
// user registers here and pulls kernel_satp/sp/trap/hartid out of it;
// userret restores user registers from it on the way back down.
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: usize, // kernel page table
    /*   8 */ pub kernel_sp: usize, // top of process's kernel stack
    /*  16 */ pub kernel_trap: usize, // usertrap()
    /*  24 */ pub epc: usize, // saved user program counter
    /*  32 */ pub kernel_hartid: usize, // saved kernel tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

// Per-hart state.
pub struct Cpu {
    pub proc: Option<usize>, // index of the running process, if any
    pub context: Context,    // swtch() here to enter scheduler()
    noff: Cell<isize>,       // depth of interrupt-disable nesting
    intena: Cell<bool>,      // were interrupts on before the first push?
}

pub struct Cpus([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for Cpus {}

// Keeps the hart's interrupt-disable count raised; dropping the last
// one restores the interrupt state saved by the first. The drop pops
// whichever hart the owning thread runs on by then: guards travel
// across swtch(), the counters do not.
pub struct IntrLock {
    _private: (),
}

impl Cpus {
    const fn new() -> Self {
        const C: UnsafeCell<Cpu> = UnsafeCell::new(Cpu::new());
        Self([C; NCPU])
    }

    // The hart id lives in tp, written once at boot.
    // Only meaningful while interrupts are off: a timer interrupt could
    // otherwise migrate the thread to another hart.
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        let id;
        asm!("mv {}, tp", out(reg) id);
        id
    }

    // This hart's Cpu struct. Interrupts must be off.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn my_cpu(&self) -> &mut Cpu {
        &mut *self.0[Self::cpu_id()].get()
    }

    // Disable interrupts on this hart until the returned lock (and any
    // nested ones) drop.
    pub fn intr_lock(&self) -> IntrLock {
        let old = intr_get();
        intr_off();
        unsafe { self.my_cpu().push(old) };
        IntrLock { _private: () }
    }

    // The process running on this hart, if any.
    pub fn my_proc(&self) -> Option<&'static Proc> {
        let _intr_lock = self.intr_lock();
        unsafe { self.my_cpu().proc.map(|i| &PROCS.pool[i]) }
    }

    // Pop one level of interrupt-disable without an IntrLock in hand.
    // Only spinlock::Mutex::force_unlock may call this.
    pub unsafe fn intr_unlock(&self) {
        self.my_cpu().pop();
    }
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }

    // interrupts must be off.
    unsafe fn push(&self, old: bool) {
        if self.noff.get() == 0 {
            self.intena.set(old);
        }
        self.noff.set(self.noff.get() + 1);
    }

    // interrupts must be off.
    fn pop(&self) {
        assert!(!intr_get(), "pop: interruptible");
        let noff = self.noff.get();
        assert!(noff >= 1, "pop");
        self.noff.set(noff - 1);
        if noff - 1 == 0 && self.intena.get() {
            intr_on();
        }
    }

    // Switch to the scheduler context. The caller holds exactly its own
    // proc lock, has already changed its state, and runs with
    // interrupts off. intena is saved and restored here because it is a
    // property of this kernel thread, not of the hart.
    unsafe fn sched<'a>(
        &mut self,
        guard: MutexGuard<'a, ProcInner>,
        ctx: *mut Context,
    ) -> MutexGuard<'a, ProcInner> {
        assert!(guard.holding(), "sched proc lock");
        assert!(self.noff.get() == 1, "sched locks");
        assert!(guard.state != ProcState::Running, "sched running");
        assert!(!intr_get(), "sched interruptible");

        let intena = self.intena.get();
        swtch(ctx, &self.context);
        self.intena.set(intena);
        guard
    }
}

impl Drop for IntrLock {
    fn drop(&mut self) {
        unsafe { CPUS.my_cpu().pop() };
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

pub struct ProcInner {
    pub state: ProcState,
    pub chan: usize, // if Sleeping, the channel slept on
    pub xstate: i32, // exit status, for the parent's wait()
    pub pid: usize,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: 0,
            xstate: 0,
            pid: 0,
        }
    }
}

// Fields private to the process. No lock is needed: only the owning
// process touches them, except for the parent's reap in wait(), which
// runs when the child can no longer execute.
pub struct ProcData {
    pub kstack: usize,                      // bottom VA of the kernel stack
    pub heap_top: usize,                    // first unused heap address
    pub ustack_pages: usize,                // user stack size in pages
    pub uvm: Option<Uvm>,                   // user page table
    pub trapframe: Option<NonNull<Trapframe>>,
    pub context: Context,                   // swtch() here to run the process
    pub mmap: RegionList,                   // free runs of the mmap arena
    pub name: [u8; 16],
    pub ofile: [Option<File>; NOFILE],
    pub cwd: Option<Inode>,
}

unsafe impl Send for ProcData {}

impl ProcData {
    const fn new() -> Self {
        const NOFD: Option<File> = None;
        Self {
            kstack: 0,
            heap_top: 0,
            ustack_pages: 0,
            uvm: None,
            trapframe: None,
            context: Context::new(),
            mmap: RegionList::new(),
            name: [0; 16],
            ofile: [NOFD; NOFILE],
            cwd: None,
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = core::cmp::min(name.len(), self.name.len() - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n..].iter_mut().for_each(|b| *b = 0);
    }

    pub fn name_str(&self) -> &str {
        let n = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..n]).unwrap_or("?")
    }

    pub fn trapframe(&self) -> &Trapframe {
        unsafe { self.trapframe.unwrap().as_ref() }
    }

    pub fn trapframe_mut(&mut self) -> &mut Trapframe {
        unsafe { self.trapframe.unwrap().as_mut() }
    }
}

pub struct Proc {
    // scheduling state, under the per-process lock:
    pub lock: Mutex<ProcInner>,
    // index of the parent; wait_lock must be held when using this:
    parent: UnsafeCell<Option<usize>>,
    // private to the process:
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

pub struct Procs {
    pub pool: [Proc; NPROC],
    pub wait_lock: Mutex<()>,
}

unsafe impl Sync for Procs {}

fn alloc_pid() -> usize {
    static NEXT_PID: AtomicUsize = AtomicUsize::new(1);
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// The first user words executed, loaded at USER_BASE: exec("/init")
// and, should that return, exit(0) forever.
static INITCODE: [u8; 64] = [
    0x17, 0x05, 0x00, 0x00, // auipc a0, 0
    0x13, 0x05, 0x85, 0x02, // addi  a0, a0, 40     ; "/init"
    0x97, 0x05, 0x00, 0x00, // auipc a1, 0
    0x93, 0x85, 0x85, 0x02, // addi  a1, a1, 40     ; argv
    0x93, 0x08, 0x10, 0x00, // li    a7, 1          ; SYS_exec
    0x73, 0x00, 0x00, 0x00, // ecall
    0x13, 0x05, 0x00, 0x00, // li    a0, 0
    0x93, 0x08, 0x70, 0x00, // li    a7, 7          ; SYS_exit
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0xf0, 0x5f, 0xff, // jal   x0, -12
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x00, // "/init\0"
    0x28, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[0] = USER_BASE + 0x28
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[1] = NULL
];

impl Procs {
    const fn new() -> Self {
        const P: Proc = Proc::new();
        Self {
            pool: [P; NPROC],
            wait_lock: Mutex::new((), "wait lock"),
        }
    }

    pub fn index_of(&self, p: &Proc) -> usize {
        let base = self.pool.as_ptr() as usize;
        (p as *const Proc as usize - base) / core::mem::size_of::<Proc>()
    }

    // Look in the table for an Unused slot. If found, initialize the
    // state required to run in the kernel and return it with its lock
    // held. None when the table is full or allocation fails.
    pub fn alloc_proc(&'static self) -> Option<(&'static Proc, MutexGuard<'static, ProcInner>)> {
        for p in self.pool.iter() {
            let mut guard = p.lock.lock();
            if guard.state != ProcState::Unused {
                continue;
            }
            guard.pid = alloc_pid();
            guard.state = ProcState::Used;

            let data = p.data_mut();

            // a trapframe frame, from the kernel pool
            match KMEM.alloc() {
                Some(tf) => data.trapframe = Some(tf.cast()),
                None => {
                    p.free_proc(guard);
                    return None;
                }
            }

            // an almost-empty user page table
            match p.make_user_pagetable() {
                Some(uvm) => data.uvm = Some(uvm),
                None => {
                    p.free_proc(guard);
                    return None;
                }
            }

            // the first switch-in lands in fork_ret
            data.context.clear();
            data.context.ra = fork_ret as usize;
            data.context.sp = data.kstack + PGSIZE;
            return Some((p, guard));
        }
        None
    }

    // Pass p's abandoned children to init. Caller holds wait_lock.
    unsafe fn reparent(&self, idx: usize) {
        for pp in self.pool.iter() {
            if *pp.parent.get() == Some(idx) {
                *pp.parent.get() = Some(INITPROC);
                self.wakeup(&self.pool[INITPROC] as *const _ as usize);
            }
        }
    }

    // Wake every process sleeping on chan.
    // Must not be called while holding any proc lock.
    pub fn wakeup(&self, chan: usize) {
        let me = CPUS.my_proc().map(|p| p as *const Proc);
        for p in self.pool.iter() {
            if Some(p as *const Proc) == me {
                continue;
            }
            let mut guard = p.lock.lock();
            if guard.state == ProcState::Sleeping && guard.chan == chan {
                guard.state = ProcState::Runnable;
            }
        }
    }
}

// Record each process's kernel stack VA; the stacks themselves were
// mapped when the kernel page table was built.
pub fn init() {
    for (i, p) in PROCS.pool.iter().enumerate() {
        p.data_mut().kstack = kstack(i);
    }
}

impl Proc {
    const fn new() -> Self {
        Self {
            lock: Mutex::new(ProcInner::new(), "proc"),
            parent: UnsafeCell::new(None),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn pid(&self) -> usize {
        self.lock.lock().pid
    }

    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    // A user page table with no user memory, but with the trampoline
    // and this process's trapframe mapped at the top.
    fn make_user_pagetable(&self) -> Option<Uvm> {
        user_pagetable(self.data().trapframe.unwrap().as_ptr() as usize)
    }

    // Return everything a process slot holds. Open files and the cwd
    // must already be gone (exit closes them; failed allocations never
    // made any). Caller holds the proc lock.
    fn free_proc(&self, mut guard: MutexGuard<'_, ProcInner>) {
        let data = self.data_mut();
        if let Some(tf) = data.trapframe.take() {
            KMEM.free(PAddr::from(tf.as_ptr() as usize));
        }
        if let Some(uvm) = data.uvm.take() {
            uvm.destroy();
        }
        POOL.lock().release(&mut data.mmap);
        data.heap_top = 0;
        data.ustack_pages = 0;
        data.name = [0; 16];
        unsafe { *self.parent.get() = None };
        guard.pid = 0;
        guard.chan = 0;
        guard.xstate = 0;
        guard.state = ProcState::Unused;
    }

    // Atomically release the given lock and sleep on chan; reacquire on
    // wakeup. The proc lock is taken before the condition lock is
    // dropped, so no wakeup between the two can be missed.
    pub fn sleep<'a, T>(&self, chan: usize, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex;
        {
            let mut lock = self.lock.lock();
            mutex = Mutex::unlock(guard);

            lock.chan = chan;
            lock.state = ProcState::Sleeping;

            unsafe {
                lock = CPUS.my_cpu().sched(lock, &mut self.data_mut().context);
            }
            lock.chan = 0;
        }
        mutex.lock()
    }

    // Give up the CPU for one scheduling round.
    pub fn yielding(&self) {
        let mut guard = self.lock.lock();
        guard.state = ProcState::Runnable;
        unsafe {
            let _ = CPUS.my_cpu().sched(guard, &mut self.data_mut().context);
        }
    }

    // Create a new process copying this one: address space, mmap list,
    // trapframe (with a0 = 0 in the child), open files, cwd, name.
    pub fn fork(&self) -> Result<usize, ()> {
        let data = self.data_mut();
        let (np, np_guard) = PROCS.alloc_proc().ok_or(())?;
        let ndata = np.data_mut();

        let uvm = data.uvm.as_mut().unwrap();
        let nuvm = ndata.uvm.as_mut().unwrap();
        if uvm
            .copy_to(nuvm, data.heap_top, data.ustack_pages, &data.mmap)
            .is_err()
        {
            np.free_proc(np_guard);
            return Err(());
        }
        ndata.heap_top = data.heap_top;
        ndata.ustack_pages = data.ustack_pages;

        match POOL.lock().clone_list(&data.mmap) {
            Some(list) => ndata.mmap = list,
            None => {
                np.free_proc(np_guard);
                return Err(());
            }
        }

        // nothing can fail past this point
        *ndata.trapframe_mut() = unsafe { core::ptr::read(data.trapframe() as *const Trapframe) };
        ndata.trapframe_mut().a0 = 0; // fork returns 0 in the child

        for (i, f) in data.ofile.iter().enumerate() {
            ndata.ofile[i] = f.as_ref().map(|f| f.dup());
        }
        ndata.cwd = data.cwd.as_ref().map(|ip| ip.dup());
        ndata.name = data.name;

        let pid = np_guard.pid;
        drop(np_guard);

        {
            let _wait_lock = PROCS.wait_lock.lock();
            unsafe { *np.parent.get() = Some(PROCS.index_of(self)) };
        }

        np.lock.lock().state = ProcState::Runnable;
        Ok(pid)
    }

    // Exit the current process; does not return. The process stays a
    // zombie until its parent calls wait().
    pub fn exit(&self, status: i32) -> ! {
        let idx = PROCS.index_of(self);
        assert!(idx != INITPROC, "init exiting");

        let data = self.data_mut();
        for f in data.ofile.iter_mut() {
            f.take(); // drop closes
        }
        data.cwd.take();

        let guard;
        {
            let wait_guard = PROCS.wait_lock.lock();

            unsafe { PROCS.reparent(idx) };

            // parent might be sleeping in wait()
            let parent = unsafe { (*self.parent.get()).unwrap() };
            PROCS.wakeup(&PROCS.pool[parent] as *const _ as usize);

            let mut g = self.lock.lock();
            g.xstate = status;
            g.state = ProcState::Zombie;
            guard = g;
            drop(wait_guard);
        }

        // jump into the scheduler, never to return
        unsafe {
            let _ = CPUS.my_cpu().sched(guard, &mut self.data_mut().context);
        }
        unreachable!("zombie exit");
    }

    // Wait for a child to exit; copy its status to addr and return its
    // pid. None when this process has no children.
    pub fn wait(&self, addr: UVAddr) -> Option<usize> {
        let my_idx = PROCS.index_of(self);
        loop {
            let wait_guard = PROCS.wait_lock.lock();
            let mut have_kids = false;
            for np in PROCS.pool.iter() {
                if unsafe { *np.parent.get() } != Some(my_idx) {
                    continue;
                }
                // the lock ensures the child is done with exit()
                let np_guard = np.lock.lock();
                have_kids = true;
                if np_guard.state == ProcState::Zombie {
                    let pid = np_guard.pid;
                    let xstate = np_guard.xstate;
                    self.data_mut()
                        .uvm
                        .as_mut()
                        .unwrap()
                        .copy_out(addr, &xstate.to_ne_bytes());
                    np.free_proc(np_guard);
                    return Some(pid);
                }
            }

            if !have_kids {
                return None;
            }

            // wait for a child to exit
            drop(self.sleep(self as *const _ as usize, wait_guard));
        }
    }
}

// An almost-empty user page table: the trampoline (RX, supervisor
// only, shared by everyone) and the given trapframe frame (RW) mapped
// at the top two slots.
pub fn user_pagetable(trapframe_pa: usize) -> Option<Uvm> {
    extern "C" {
        fn trampoline();
    }
    let mut uvm = Uvm::create()?;
    uvm.map_pages(
        UVAddr::from(TRAMPOLINE),
        PAddr::from(trampoline as usize),
        PGSIZE,
        PteFlags::RX,
    );
    uvm.map_pages(
        UVAddr::from(TRAPFRAME),
        PAddr::from(trapframe_pa),
        PGSIZE,
        PteFlags::RW,
    );
    Some(uvm)
}

// Set up the first user process: one page of INITCODE at USER_BASE, one
// user stack page below the trapframe, and the whole mmap arena free.
pub fn make_first() {
    let (p, mut guard) = PROCS.alloc_proc().expect("make_first");
    assert_eq!(PROCS.index_of(p), INITPROC);

    let data = p.data_mut();
    let uvm = data.uvm.as_mut().unwrap();

    let code = UMEM.alloc().expect("make_first: code page");
    unsafe {
        core::ptr::copy_nonoverlapping(
            INITCODE.as_ptr(),
            code.as_ptr() as *mut u8,
            INITCODE.len(),
        );
    }
    uvm.map_pages(
        UVAddr::from(USER_BASE),
        PAddr::from(code.as_ptr() as usize),
        PGSIZE,
        PteFlags::RWU | PteFlags::X,
    );
    data.heap_top = USER_BASE + PGSIZE;

    let stack = UMEM.alloc().expect("make_first: stack page");
    uvm.map_pages(
        UVAddr::from(TRAPFRAME - PGSIZE),
        PAddr::from(stack.as_ptr() as usize),
        PGSIZE,
        PteFlags::RWU,
    );
    data.ustack_pages = 1;

    data.mmap = POOL.lock().full_list();

    let tf = data.trapframe_mut();
    tf.epc = USER_BASE; // user pc
    tf.sp = TRAPFRAME; // user stack top

    data.set_name(b"initcode");
    guard.state = ProcState::Runnable;
}

// A fork child's first scheduling lands here, still holding the proc
// lock taken by the scheduler.
pub unsafe extern "C" fn fork_ret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    let p = CPUS.my_proc().unwrap();
    p.lock.force_unlock();

    if FIRST.swap(false, Ordering::AcqRel) {
        // The file system must be mounted from process context: it
        // sleeps on disk I/O. Give the first process the root cwd and
        // make sure the console device node exists.
        fs::init();
        p.data_mut().cwd = Some(ITABLE.get(ROOTINO));
        crate::file::make_console_node();
    }

    usertrap_ret()
}

// Per-hart scheduler; never returns. Picks the next Runnable process,
// runs it until it yields, repeats. With nothing runnable the hart
// waits for an interrupt instead of spinning through the table.
pub fn scheduler() -> ! {
    let c = unsafe { CPUS.my_cpu() };
    loop {
        // interrupts were off on the way in; open a window so devices
        // (and the timer) can preempt a wedged scan.
        intr_on();
        intr_off();

        let mut found = false;
        for (i, p) in PROCS.pool.iter().enumerate() {
            let mut guard = p.lock.lock();
            if guard.state == ProcState::Runnable {
                // switch to the chosen process; it releases the lock
                // and reacquires it on the way back.
                guard.state = ProcState::Running;
                c.proc = Some(i);
                unsafe { swtch(&mut c.context, &p.data().context) };
                c.proc = None;
                found = true;
            }
            drop(guard);
        }
        if !found {
            unsafe { asm!("wfi") };
        }
    }
}

// Print a process listing to the console, for the ^P debug key.
// No locks, to avoid wedging a stuck machine further.
pub fn procdump() {
    println!("");
    for p in PROCS.pool.iter() {
        let inner = unsafe { p.lock.get_mut() };
        if inner.state != ProcState::Unused {
            println!(
                "{} {:?} {}",
                inner.pid,
                inner.state,
                p.data().name_str()
            );
        }
    }
}
