use crate::kernelvec::kernelvec;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ};
use crate::plic;
use crate::proc::{Cpus, ProcState, CPUS, PROCS};
use crate::riscv::register::{satp, scause, sepc, sstatus, stval, stvec};
use crate::riscv::register::scause::{Exception, Interrupt, Trap};
use crate::riscv::{intr_get, intr_off, intr_on, r_sstatus, w_sip, w_sstatus, PGSIZE};
use crate::spinlock::Mutex;
use crate::syscall::syscall;
use crate::{console, println, virtio_disk};

extern "C" {
    fn trampoline();
    fn uservec();
    fn userret();
}

pub static TICKS: Mutex<usize> = Mutex::new(0, "time");

#[derive(PartialEq, Clone, Copy)]
pub enum Intr {
    Timer,
    Device,
}

// set up to take exceptions and traps while in the kernel.
pub fn inithart() {
    unsafe {
        stvec::write(kernelvec as usize, stvec::TrapMode::Direct);
    }
}

// Handle an interrupt, exception or system call from user space.
// Called from the trampoline's uservec.
#[no_mangle]
pub extern "C" fn usertrap() -> ! {
    assert!(
        sstatus::read().spp() == sstatus::SPP::User,
        "usertrap: not from user mode"
    );

    // traps are now handled in the kernel, off the trampoline.
    unsafe {
        stvec::write(kernelvec as usize, stvec::TrapMode::Direct);
    }

    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();

    // save user program counter
    data.trapframe_mut().epc = sepc::read();

    let mut which_dev = None;
    match scause::read().cause() {
        Trap::Exception(Exception::UserEnvCall) => {
            // sepc points to the ecall instruction; return past it.
            data.trapframe_mut().epc += 4;

            // an interrupt would clobber sstatus &c, so only enable
            // once we are done with those registers.
            intr_on();

            syscall();
        }
        Trap::Interrupt(intr)
            if {
                which_dev = devintr(intr);
                which_dev.is_some()
            } => {}
        cause => {
            println!(
                "usertrap: unexpected scause {:?} pid={}",
                cause,
                p.pid()
            );
            panic!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
        }
    }

    // give up the CPU if this was a timer interrupt.
    if which_dev == Some(Intr::Timer) {
        p.yielding();
    }

    unsafe { usertrap_ret() }
}

// Return to user space through the trampoline.
pub unsafe fn usertrap_ret() -> ! {
    let p = CPUS.my_proc().unwrap();

    // we're about to switch the destination of traps from kerneltrap
    // to usertrap; keep interrupts off until back in user space.
    intr_off();

    stvec::write(
        TRAMPOLINE + (uservec as usize - trampoline as usize),
        stvec::TrapMode::Direct,
    );

    // values uservec needs when the process traps back in.
    // re-read the trapframe pointer: exec may have swapped it.
    let data = p.data_mut();
    let tf = data.trapframe_mut();
    tf.kernel_satp = satp::read().bits();
    tf.kernel_sp = data.kstack + PGSIZE;
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = Cpus::cpu_id();

    // set up the registers the trampoline's sret will use.
    sstatus::set_spp(sstatus::SPP::User);
    sstatus::set_spie(); // enable interrupts in user mode
    sepc::write(tf.epc);

    let satp = data.uvm.as_ref().unwrap().as_satp();

    // jump to the top-of-memory trampoline, which switches to the user
    // page table, restores user registers, and srets to user mode.
    let trampoline_userret = TRAMPOLINE + (userret as usize - trampoline as usize);
    let trampoline_userret: extern "C" fn(usize, usize) -> ! =
        core::mem::transmute(trampoline_userret);
    trampoline_userret(TRAPFRAME, satp)
}

// Interrupts and exceptions from kernel code come here via kernelvec,
// on whatever the current kernel stack is.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc_saved = sepc::read();
    let sstatus_saved = r_sstatus();
    let scause = scause::read();

    assert!(
        sstatus::read().spp() == sstatus::SPP::Supervisor,
        "kerneltrap: not from supervisor mode"
    );
    assert!(!intr_get(), "kerneltrap: interrupts enabled");

    let which_dev = match scause.cause() {
        Trap::Interrupt(intr) => {
            let dev = devintr(intr);
            if dev.is_none() {
                println!("scause {:?}", scause.cause());
                panic!("kerneltrap: sepc={:#x} stval={:#x}", sepc_saved, stval::read());
            }
            dev
        }
        Trap::Exception(_) => {
            println!("scause {:?}", scause.cause());
            panic!("kerneltrap: sepc={:#x} stval={:#x}", sepc_saved, stval::read());
        }
    };

    // give up the CPU if this was a timer interrupt.
    if which_dev == Some(Intr::Timer) {
        if let Some(p) = CPUS.my_proc() {
            if p.lock.lock().state == ProcState::Running {
                p.yielding();
            }
        }
    }

    // yielding may have caused traps on other processes, so restore
    // the trap registers for kernelvec's sret.
    sepc::write(sepc_saved);
    w_sstatus(sstatus_saved);
}

fn clockintr() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    drop(ticks);
    PROCS.wakeup(&TICKS as *const _ as usize);
}

// Decide what kind of interrupt this is and handle it.
fn devintr(intr: Interrupt) -> Option<Intr> {
    match intr {
        Interrupt::SupervisorExternal => {
            // a device interrupt, via the PLIC.
            if let Some(irq) = plic::claim() {
                match irq as usize {
                    UART0_IRQ => console::uart_intr(),
                    VIRTIO0_IRQ => virtio_disk::intr(),
                    _ => println!("unexpected interrupt irq={}", irq),
                }
                // allow the device to raise the next one.
                plic::complete(irq);
            }
            Some(Intr::Device)
        }
        Interrupt::SupervisorSoft => {
            // a machine-mode timer interrupt, forwarded by timervec.
            // one hart owns the system clock.
            if unsafe { Cpus::cpu_id() } == 0 {
                clockintr();
            }

            // acknowledge by clearing SSIP in sip.
            w_sip(crate::riscv::register::sip::read().bits() & !2);
            Some(Intr::Timer)
        }
        _ => None,
    }
}
