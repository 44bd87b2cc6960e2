// Console input and output. Implements the Device interface for the
// console major number, with a canonical ("cooked") input line
// discipline: erase and kill editing, input becomes available a line
// at a time.

use crate::file::{Device, Major, DEVSW};
use crate::proc::{CPUS, PROCS};
use crate::spinlock::Mutex;
use crate::uart;
use crate::vm::{either_copy_in, either_copy_out, VirtAddr};

const INPUT_BUF: usize = 128;

const CTRL_H: u8 = 8; // backspace
const CTRL_P: u8 = 16; // print process list
const CTRL_U: u8 = 21; // kill line
const CTRL_D: u8 = 4; // end of file
const DEL: u8 = 0x7f;

pub static CONS: Mutex<Console> = Mutex::new(Console::new(), "cons");

static CONSDEV: ConsDev = ConsDev;

pub struct Console {
    buf: [u8; INPUT_BUF],
    r: usize, // read index
    w: usize, // write index
    e: usize, // edit index
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

// Send one byte to the uart, expanding backspace for the terminal.
pub fn putc(c: u8) {
    if c == CTRL_H {
        uart::putc_sync(CTRL_H);
        uart::putc_sync(b' ');
        uart::putc_sync(CTRL_H);
    } else {
        uart::putc_sync(c);
    }
}

struct ConsDev;

impl Device for ConsDev {
    // Read up to n bytes into dst, blocking until a whole line (or
    // end-of-file) has arrived.
    fn read(&self, mut dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = CPUS.my_proc().ok_or(())?;
        let target = n;
        let mut n = n;
        let mut cons = CONS.lock();
        while n > 0 {
            // wait for interrupt handlers to deliver input.
            while cons.r == cons.w {
                cons = p.sleep(&CONS as *const _ as usize, cons);
            }

            let c = cons.buf[cons.r % INPUT_BUF];
            cons.r += 1;

            if c == CTRL_D {
                if n < target {
                    // save ^D for next time, to ensure caller gets a
                    // 0-byte result.
                    cons.r -= 1;
                }
                break;
            }

            either_copy_out(dst, &[c]);
            dst = dst.offset(1);
            n -= 1;

            if c == b'\n' {
                // a whole line has been consumed.
                break;
            }
        }
        Ok(target - n)
    }

    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        for i in 0..n {
            let mut c = [0u8];
            either_copy_in(&mut c, src.offset(i));
            putc(c[0]);
        }
        Ok(n)
    }
}

// The uart received a byte (or several); run the line discipline and
// wake any reader once a line is complete.
pub fn uart_intr() {
    while let Some(c) = uart::getc() {
        let mut cons = CONS.lock();
        match c {
            CTRL_P => {
                drop(cons);
                crate::proc::procdump();
                continue;
            }
            CTRL_U => {
                while cons.e != cons.w && cons.buf[(cons.e - 1) % INPUT_BUF] != b'\n' {
                    cons.e -= 1;
                    putc(CTRL_H);
                }
            }
            CTRL_H | DEL => {
                if cons.e != cons.w {
                    cons.e -= 1;
                    putc(CTRL_H);
                }
            }
            mut c => {
                if cons.e - cons.r < INPUT_BUF {
                    if c == b'\r' {
                        c = b'\n';
                    }
                    putc(c); // echo
                    let e = cons.e;
                    cons.buf[e % INPUT_BUF] = c;
                    cons.e += 1;
                    if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                        // the line is ready for ConsDev::read.
                        cons.w = cons.e;
                        drop(cons);
                        PROCS.wakeup(&CONS as *const _ as usize);
                    }
                }
            }
        }
    }
}

pub fn init() {
    uart::init();
    DEVSW.set(Major::Console, &CONSDEV);
}
