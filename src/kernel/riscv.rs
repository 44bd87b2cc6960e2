// Low-level RISC-V definitions: page constants, PTE bits, and the
// handful of CSR accessors the `riscv` crate does not cover.

use bitflags::bitflags;

#[cfg(target_os = "none")]
pub use ::riscv::register;

#[cfg(target_os = "none")]
use core::arch::asm;

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

// one beyond the highest possible virtual address.
// MAXVA is actually one bit less than the max allowed by
// Sv39, to avoid having to sign-extend virtual addresses
// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(sz: usize) -> usize {
    sz & !(PGSIZE - 1)
}

bitflags! {
    pub struct PteFlags: usize {
        const V = 1 << 0; // valid
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4; // user can access
        const RW = Self::R.bits | Self::W.bits;
        const RX = Self::R.bits | Self::X.bits;
        const RWU = Self::RW.bits | Self::U.bits;
    }
}

// use riscv's sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

pub const fn make_satp(pagetable: usize) -> usize {
    SATP_SV39 | (pagetable >> PGSHIFT)
}

#[cfg(target_os = "none")]
pub fn r_tp() -> usize {
    let tp;
    unsafe { asm!("mv {}, tp", out(reg) tp) };
    tp
}

#[cfg(target_os = "none")]
pub unsafe fn w_tp(tp: usize) {
    asm!("mv tp, {}", in(reg) tp);
}

#[cfg(target_os = "none")]
pub fn r_sstatus() -> usize {
    let x;
    unsafe { asm!("csrr {}, sstatus", out(reg) x) };
    x
}

#[cfg(target_os = "none")]
pub fn w_sstatus(x: usize) {
    unsafe { asm!("csrw sstatus, {}", in(reg) x) };
}

#[cfg(target_os = "none")]
pub fn w_sip(x: usize) {
    unsafe { asm!("csrw sip, {}", in(reg) x) };
}

// enable device interrupts
#[cfg(target_os = "none")]
pub fn intr_on() {
    unsafe { register::sstatus::set_sie() };
}

// disable device interrupts
#[cfg(target_os = "none")]
pub fn intr_off() {
    unsafe { register::sstatus::clear_sie() };
}

// are device interrupts enabled?
#[cfg(target_os = "none")]
pub fn intr_get() -> bool {
    register::sstatus::read().sie()
}

// flush the TLB. the zero, zero means flush all entries.
#[cfg(target_os = "none")]
pub unsafe fn sfence_vma() {
    asm!("sfence.vma zero, zero");
}
