// qemu loads the kernel at 0x80000000 and jumps here with every hart,
// in machine mode. Give each hart a 4 KiB boot stack carved out of
// STACK0 (declared in start.rs), then head for start().

use core::arch::global_asm;

global_asm!(
    r#"
.section .entry
.globl _entry
_entry:
    # sp = STACK0 + (mhartid + 1) * 4096
    la sp, STACK0
    li a0, 4096
    csrr a1, mhartid
    addi a1, a1, 1
    mul a0, a0, a1
    add sp, sp, a0

    call start
spin:
    j spin
"#
);
