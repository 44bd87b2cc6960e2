use crate::console;
use crate::spinlock::Mutex;
use core::fmt;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

pub static PR: Pr = Pr {
    writer: Mutex::new(Writer, "pr"),
    panicked: AtomicBool::new(false),
};

// Lock to avoid interleaving concurrent println!'s. Once a hart has
// panicked the lock is bypassed, so diagnostics still come out even if
// the panicking hart holds it.
pub struct Pr {
    writer: Mutex<Writer>,
    panicked: AtomicBool,
}

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            console::putc(byte);
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;

    if !PR.panicked.load(Ordering::Relaxed) {
        PR.writer.lock().write_fmt(args).expect("_print: error");
    } else {
        unsafe {
            PR.writer.get_mut().write_fmt(args).ok();
        }
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    ($fmt:expr) => {
        $crate::print!(concat!($fmt, "\n"))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

// Freeze this hart: print the diagnostic through the bypass path and
// spin. Other harts keep running but can no longer print.
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    PR.panicked.store(true, Ordering::Relaxed);
    crate::println!("kernel panic: {}", info);
    loop {}
}
