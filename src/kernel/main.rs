#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(target_os = "none")]
use kernel::{
    console, kalloc, kmain, plic, println,
    proc::{self, scheduler, Cpus},
    trap, virtio_disk, vm,
};

#[cfg(target_os = "none")]
static STARTED: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "none")]
kmain!(main);

// start() jumps here in supervisor mode on every hart. Hart 0 builds
// the world; the rest wait at the barrier and then bring up their own
// paging, trap vector and PLIC state.
#[cfg(target_os = "none")]
extern "C" fn main() -> ! {
    let cpuid = unsafe { Cpus::cpu_id() };
    if cpuid == 0 {
        console::init();
        println!("");
        println!("moss kernel is booting");
        println!("");
        unsafe { kalloc::init() }; // physical frame pools
        vm::kinit(); // create the kernel page table
        vm::kinithart(); // turn on paging
        proc::init(); // process table
        trap::inithart(); // install the kernel trap vector
        plic::init(); // set up the interrupt controller
        plic::inithart(); // ask the PLIC for device interrupts
        virtio_disk::init(); // the emulated disk
        proc::make_first(); // first user process
        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        println!("hart {} starting", cpuid);
        vm::kinithart();
        trap::inithart();
        plic::inithart();
    }
    scheduler()
}

// Hosted builds (mkfs, cargo test) never run the kernel image.
#[cfg(not(target_os = "none"))]
fn main() {}
