// The riscv Platform Level Interrupt Controller (PLIC) routes device
// interrupts to harts.

use crate::memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::Cpus;

unsafe fn write_reg(addr: usize, value: u32) {
    core::ptr::write_volatile(addr as *mut u32, value);
}

pub fn init() {
    // set non-zero priorities for the sources we use.
    unsafe {
        write_reg(PLIC + UART0_IRQ * 4, 1);
        write_reg(PLIC + VIRTIO0_IRQ * 4, 1);
    }
}

pub fn inithart() {
    let hart = unsafe { Cpus::cpu_id() };
    unsafe {
        // enable the uart and virtio bits for this hart's S-mode.
        write_reg(
            plic_senable(hart),
            (1 << UART0_IRQ) | (1 << VIRTIO0_IRQ),
        );
        // accept every enabled source.
        write_reg(plic_spriority(hart), 0);
    }
}

// Ask the PLIC which interrupt we should serve.
pub fn claim() -> Option<u32> {
    let hart = unsafe { Cpus::cpu_id() };
    let irq = unsafe { core::ptr::read_volatile(plic_sclaim(hart) as *const u32) };
    if irq == 0 {
        None
    } else {
        Some(irq)
    }
}

// Tell the PLIC we've served this source.
pub fn complete(irq: u32) {
    let hart = unsafe { Cpus::cpu_id() };
    unsafe { write_reg(plic_sclaim(hart), irq) };
}
