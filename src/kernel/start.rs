// Machine-mode setup, one pass per hart: drop to supervisor mode with
// everything delegated, arm the per-hart machine timer, then mret into
// main().

use crate::kernelvec::timervec;
use crate::memlayout::{clint_mtimecmp, CLINT_MTIME};
use crate::param::{INTERVAL, NCPU};
use crate::riscv::register::{mepc, mhartid, mie, mscratch, mstatus, mtvec, satp, sie};
use crate::riscv::w_tp;
use core::arch::asm;

// the boot stacks, one 4 KiB stack per hart. entry.rs points sp here.
#[no_mangle]
static mut STACK0: Stack0 = Stack0([0; 4096 * NCPU]);

#[repr(C, align(16))]
struct Stack0([u8; 4096 * NCPU]);

// scratch area per hart for timervec: three register save slots, the
// hart's mtimecmp address, and the tick interval.
static mut TIMER_SCRATCH: [[u64; 5]; NCPU] = [[0; 5]; NCPU];

extern "C" {
    fn main(); // the kernel entry point in main.rs
}

#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    mstatus::set_mpp(mstatus::MPP::Supervisor);

    // set M Exception Program Counter to main, for mret.
    mepc::write(main as usize);

    // disable paging for now.
    satp::write(0);

    // delegate all interrupts and exceptions to supervisor mode.
    asm!("csrw medeleg, {}", in(reg) 0xffffusize);
    asm!("csrw mideleg, {}", in(reg) 0xffffusize);
    sie::set_sext();
    sie::set_stimer();
    sie::set_ssoft();

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    asm!("csrw pmpaddr0, {}", in(reg) 0x3f_ffff_ffff_ffffusize);
    asm!("csrw pmpcfg0, {}", in(reg) 0xfusize);

    // arm the machine timer on this hart.
    timer_init();

    // keep each hart's id in its tp register, for Cpus::cpu_id().
    let id = mhartid::read();
    w_tp(id);

    // switch to supervisor mode and jump to main().
    asm!("mret");
    unreachable!()
}

// Arrange for timer interrupts. They arrive in machine mode at
// timervec (kernelvec.rs), which turns them into supervisor software
// interrupts for devintr() in trap.rs.
unsafe fn timer_init() {
    let id = mhartid::read();

    // ask the CLINT for the first timer interrupt. mtime has been
    // running since power-on, so an unprogrammed mtimecmp would fire
    // immediately and forever.
    let mtimecmp = clint_mtimecmp(id) as *mut u64;
    *mtimecmp = *(CLINT_MTIME as *const u64) + INTERVAL;

    // tell timervec where this hart's scratch state lives.
    let scratch = &mut *core::ptr::addr_of_mut!(TIMER_SCRATCH[id]);
    scratch[3] = mtimecmp as u64;
    scratch[4] = INTERVAL;
    mscratch::write(scratch.as_mut_ptr() as usize);

    // machine-mode traps go to timervec.
    mtvec::write(timervec as usize, mtvec::TrapMode::Direct);

    // enable machine-mode timer interrupts.
    mie::set_mtimer();
    mstatus::set_mie();
}
