// Open files and the device switch.
//
// A File is a counted handle into the global open-file table; the fd
// arrays in proc hold these. Reference counts live under the table
// spin lock. The rest of a slot is written once when the slot is
// claimed; the read/write offset is mutated only under the backing
// inode's sleep lock, which serializes concurrent users of the same
// open file.

use crate::fcntl::{seek_offset, OpenMode};
use crate::fs::{self, Inode};
use crate::param::{NDEV, NFILE};
use crate::spinlock::Mutex;
use crate::stat::IType;
use crate::vm::{either_copy_out, VirtAddr};
use core::cell::UnsafeCell;

pub static FTABLE: Ftable = Ftable::new();
pub static DEVSW: DevSw = DevSw::new();

// Device major numbers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    Null = 0,
    Console = 1,
}

// Per-major read/write entry points, selected through DEVSW.
pub trait Device: Send + Sync {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()>;
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()>;
}

// The device switch is filled in during single-threaded boot and only
// read afterwards.
pub struct DevSw {
    table: [UnsafeCell<Option<&'static dyn Device>>; NDEV],
}

unsafe impl Sync for DevSw {}

impl DevSw {
    const fn new() -> Self {
        const NONE: UnsafeCell<Option<&'static dyn Device>> = UnsafeCell::new(None);
        Self {
            table: [NONE; NDEV],
        }
    }

    pub fn set(&self, major: Major, dev: &'static dyn Device) {
        unsafe { *self.table[major as usize].get() = Some(dev) };
    }

    pub fn get(&self, major: u16) -> Option<&'static dyn Device> {
        if (major as usize) < NDEV {
            unsafe { *self.table[major as usize].get() }
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    Unused,
    File,
    Dir,
    Device,
}

struct FSlot {
    kind: FileKind,
    readable: bool,
    writable: bool,
    major: u16,
    offset: u64,
    ip: Option<Inode>,
}

impl FSlot {
    const fn empty() -> Self {
        Self {
            kind: FileKind::Unused,
            readable: false,
            writable: false,
            major: 0,
            offset: 0,
            ip: None,
        }
    }
}

pub struct Ftable {
    refcnt: Mutex<[u32; NFILE]>,
    slots: [UnsafeCell<FSlot>; NFILE],
}

unsafe impl Sync for Ftable {}

// A counted handle to one open file. Dropping it closes: the last
// reference releases the slot and the inode behind it.
pub struct File {
    idx: usize,
}

impl Ftable {
    const fn new() -> Self {
        const SLOT: UnsafeCell<FSlot> = UnsafeCell::new(FSlot::empty());
        Self {
            refcnt: Mutex::new([0; NFILE], "ftable"),
            slots: [SLOT; NFILE],
        }
    }

    // Claim a free slot and fill it. None when the table is full.
    fn alloc(
        &'static self,
        kind: FileKind,
        mode: OpenMode,
        major: u16,
        ip: Inode,
    ) -> Option<File> {
        let idx = {
            let mut refcnt = self.refcnt.lock();
            let idx = refcnt.iter().position(|&r| r == 0)?;
            refcnt[idx] = 1;
            idx
        };
        // sole owner of the slot until the File is shared.
        unsafe {
            *self.slots[idx].get() = FSlot {
                kind,
                readable: mode.is_read(),
                writable: mode.is_write(),
                major,
                offset: 0,
                ip: Some(ip),
            };
        }
        Some(File { idx })
    }
}

impl File {
    #[allow(clippy::mut_from_ref)]
    fn slot(&self) -> &mut FSlot {
        unsafe { &mut *FTABLE.slots[self.idx].get() }
    }

    // Another handle to the same open file, sharing the offset.
    pub fn dup(&self) -> File {
        let mut refcnt = FTABLE.refcnt.lock();
        refcnt[self.idx] += 1;
        File { idx: self.idx }
    }

    pub fn readable(&self) -> bool {
        self.slot().readable
    }

    pub fn writable(&self) -> bool {
        self.slot().writable
    }

    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let slot = self.slot();
        if !slot.readable {
            return Err(());
        }
        match slot.kind {
            FileKind::Device => DEVSW.get(slot.major).ok_or(())?.read(dst, n),
            FileKind::File | FileKind::Dir => {
                let mut g = slot.ip.as_ref().unwrap().lock();
                let r = g.read(dst, slot.offset, n);
                slot.offset += r as u64;
                Ok(r)
            }
            FileKind::Unused => Err(()),
        }
    }

    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        let slot = self.slot();
        if !slot.writable {
            return Err(());
        }
        match slot.kind {
            FileKind::Device => DEVSW.get(slot.major).ok_or(())?.write(src, n),
            FileKind::File => {
                let mut g = slot.ip.as_ref().unwrap().lock();
                let r = g.write(src, slot.offset, n)?;
                slot.offset += r as u64;
                Ok(r)
            }
            _ => Err(()),
        }
    }

    // Move the offset; plain files only.
    pub fn lseek(&self, offset: u64, whence: usize) -> Result<u64, ()> {
        let slot = self.slot();
        if slot.kind != FileKind::File {
            return Err(());
        }
        let g = slot.ip.as_ref().unwrap().lock();
        slot.offset = seek_offset(slot.offset, offset, whence)?;
        drop(g);
        Ok(slot.offset)
    }

    // Copy file metadata out to addr.
    pub fn stat(&self, addr: VirtAddr) -> Result<(), ()> {
        let slot = self.slot();
        match slot.kind {
            FileKind::File | FileKind::Dir => {
                let st = slot.ip.as_ref().unwrap().lock().stat();
                either_copy_out(addr, &st.to_bytes());
                Ok(())
            }
            _ => Err(()),
        }
    }

    // Copy the directory's live entries out to addr; getdir backend.
    pub fn dir_entries(&self, dst: VirtAddr, len: usize) -> Result<usize, ()> {
        let slot = self.slot();
        if slot.kind != FileKind::Dir || !slot.readable {
            return Err(());
        }
        let mut g = slot.ip.as_ref().unwrap().lock();
        Ok(g.dir_entries(dst, len))
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let mut refcnt = FTABLE.refcnt.lock();
        assert!(refcnt[self.idx] >= 1, "file close");
        refcnt[self.idx] -= 1;
        if refcnt[self.idx] > 0 {
            return;
        }
        // last reference: empty the slot, then let the inode go after
        // the table lock is gone (the final put can sleep on disk I/O).
        let ip = {
            let slot = unsafe { &mut *FTABLE.slots[self.idx].get() };
            slot.kind = FileKind::Unused;
            slot.readable = false;
            slot.writable = false;
            slot.offset = 0;
            slot.ip.take()
        };
        drop(refcnt);
        drop(ip);
    }
}

// Open (and possibly create) the file at path.
pub fn open(path: &[u8], mode: OpenMode) -> Option<File> {
    let ip = if mode.is_create() {
        fs::path_create_inode(path, IType::File, 0, 0)?
    } else {
        let ip = fs::path_to_inode(path)?;
        let g = ip.lock();
        // a directory may only be opened read-only.
        if g.itype == IType::Dir && mode != OpenMode::READ {
            return None;
        }
        drop(g);
        ip
    };

    let g = ip.lock();
    let (kind, major) = match g.itype {
        IType::Device => (FileKind::Device, g.major),
        IType::Dir => (FileKind::Dir, 0),
        IType::File => (FileKind::File, 0),
        IType::None => return None,
    };
    drop(g);

    FTABLE.alloc(kind, mode, major, ip)
}

// Make sure /console exists, so init can open its fds 0..2.
// Runs once, from the first process.
pub fn make_console_node() {
    let _ = fs::path_create_inode(b"/console", IType::Device, Major::Console as u16, 0);
}
