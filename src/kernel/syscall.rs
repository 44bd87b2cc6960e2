// System call numbers, argument fetching, and the dispatch table.
//
// Arguments arrive in a0..a5 of the trapframe; the number rides in a7
// and the result goes back through a0. The trapframe pointer is
// re-read after the handler runs, because exec installs a new one.

use crate::proc::{ProcData, CPUS};
use crate::vm::UVAddr;
use crate::{println, sysfile, sysproc};

#[derive(Copy, Clone, Debug)]
#[repr(usize)]
pub enum SysCallNum {
    Exec = 1,
    Brk = 2,
    Mmap = 3,
    Munmap = 4,
    Fork = 5,
    Wait = 6,
    Exit = 7,
    Sleep = 8,
    Open = 9,
    Close = 10,
    Read = 11,
    Write = 12,
    Lseek = 13,
    Dup = 14,
    Fstat = 15,
    Getdir = 16,
    Mkdir = 17,
    Chdir = 18,
    Link = 19,
    Unlink = 20,
}

impl SysCallNum {
    pub fn from_usize(n: usize) -> Option<Self> {
        match n {
            1 => Some(Self::Exec),
            2 => Some(Self::Brk),
            3 => Some(Self::Mmap),
            4 => Some(Self::Munmap),
            5 => Some(Self::Fork),
            6 => Some(Self::Wait),
            7 => Some(Self::Exit),
            8 => Some(Self::Sleep),
            9 => Some(Self::Open),
            10 => Some(Self::Close),
            11 => Some(Self::Read),
            12 => Some(Self::Write),
            13 => Some(Self::Lseek),
            14 => Some(Self::Dup),
            15 => Some(Self::Fstat),
            16 => Some(Self::Getdir),
            17 => Some(Self::Mkdir),
            18 => Some(Self::Chdir),
            19 => Some(Self::Link),
            20 => Some(Self::Unlink),
            _ => None,
        }
    }

    fn handler(self) -> fn() -> Result<usize, ()> {
        match self {
            Self::Exec => sysproc::sys_exec,
            Self::Brk => sysproc::sys_brk,
            Self::Mmap => sysproc::sys_mmap,
            Self::Munmap => sysproc::sys_munmap,
            Self::Fork => sysproc::sys_fork,
            Self::Wait => sysproc::sys_wait,
            Self::Exit => sysproc::sys_exit,
            Self::Sleep => sysproc::sys_sleep,
            Self::Open => sysfile::sys_open,
            Self::Close => sysfile::sys_close,
            Self::Read => sysfile::sys_read,
            Self::Write => sysfile::sys_write,
            Self::Lseek => sysfile::sys_lseek,
            Self::Dup => sysfile::sys_dup,
            Self::Fstat => sysfile::sys_fstat,
            Self::Getdir => sysfile::sys_getdir,
            Self::Mkdir => sysfile::sys_mkdir,
            Self::Chdir => sysfile::sys_chdir,
            Self::Link => sysfile::sys_link,
            Self::Unlink => sysfile::sys_unlink,
        }
    }
}

pub fn syscall() {
    let p = CPUS.my_proc().unwrap();
    let num = p.data().trapframe().a7;

    let ret = match SysCallNum::from_usize(num) {
        Some(call) => call.handler()().map_or(-1isize as usize, |v| v),
        None => {
            println!(
                "{} {}: unknown sys call {}",
                p.pid(),
                p.data().name_str(),
                num
            );
            -1isize as usize
        }
    };

    // exec replaces the trapframe, so fetch it afresh before storing
    // the return value.
    let p = CPUS.my_proc().unwrap();
    p.data_mut().trapframe_mut().a0 = ret;
}

impl ProcData {
    // Fetch the n'th raw system call argument.
    pub fn arg(&self, n: usize) -> usize {
        let tf = self.trapframe();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("arg"),
        }
    }

    // The n'th argument as a user virtual address. Legality is checked
    // when it is actually used.
    pub fn arg_addr(&self, n: usize) -> UVAddr {
        UVAddr::from(self.arg(n))
    }

    // The n'th argument as a NUL-terminated user string, copied into
    // buf. Returns the filled prefix.
    pub fn arg_str<'a>(&mut self, n: usize, buf: &'a mut [u8]) -> Result<&'a [u8], ()> {
        let addr = self.arg_addr(n);
        let uvm = self.uvm.as_mut().unwrap();
        let s = uvm.copy_in_str(buf, addr)?;
        Ok(s.as_bytes())
    }

    // The n'th argument as a file descriptor, with the open file it
    // names.
    pub fn arg_fd(&self, n: usize) -> Option<(usize, &crate::file::File)> {
        let fd = self.arg(n);
        match self.ofile.get(fd)? {
            Some(f) => Some((fd, f)),
            None => None,
        }
    }

    // Hand the file a descriptor slot. Gives the file back on a full
    // table so the caller can dispose of it.
    pub fn fd_alloc(&mut self, file: crate::file::File) -> Result<usize, crate::file::File> {
        for (fd, f) in self.ofile.iter_mut().enumerate() {
            if f.is_none() {
                f.replace(file);
                return Ok(fd);
            }
        }
        Err(file)
    }
}
