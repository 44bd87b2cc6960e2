// File system implementation. Five layers:
//   - blocks: bitmap allocators for raw disk blocks and inode numbers.
//   - inodes: allocation, the in-core table, reading, writing, metadata.
//   - data addressing: direct, single- and double-indirect blocks.
//   - directories: inodes whose payload is an array of dirents.
//   - names: path lookup, /a/b/c -> inode.
//
// On-disk records are read and written through explicit little-endian
// codecs, so the layout is the same no matter who compiled the kernel
// or the mkfs tool. The higher-level system call implementations live
// in sysfile.rs.

#[cfg(target_os = "none")]
use crate::bio::BCACHE;
#[cfg(target_os = "none")]
use crate::param::NINODE;
#[cfg(target_os = "none")]
use crate::proc::CPUS;
#[cfg(target_os = "none")]
use crate::sleeplock::{SleepLock, SleepLockGuard};
#[cfg(target_os = "none")]
use crate::spinlock::Mutex;
use crate::stat::IType;
#[cfg(target_os = "none")]
use crate::stat::FileStat;
#[cfg(target_os = "none")]
use crate::vm::{either_copy_in, either_copy_out, VirtAddr};
#[cfg(target_os = "none")]
use core::cell::UnsafeCell;
#[cfg(target_os = "none")]
use zerocopy::LayoutVerified;

// Disk layout:
// [ superblock | inode bitmap | inode table | data bitmap | data ]
//
// mkfs computes the superblock and builds an initial file system.

pub const BLOCK_SIZE: usize = 4096;
pub const FS_MAGIC: u32 = 0x1234_5678;
pub const SB_BLOCK: u32 = 0;

pub const ROOTINO: u16 = 1; // root directory inode number
pub const INUM_FREE: u16 = 0; // inode number 0 marks a free dirent

// the inode address array: direct entries, then single-indirect, then
// one double-indirect. every indirect block holds ENTRY_PER_BLOCK
// 64-bit block addresses.
pub const N_ADDRS_1: usize = 11;
pub const N_ADDRS_2: usize = 2;
pub const N_ADDRS_3: usize = 1;
pub const N_ADDRS: usize = N_ADDRS_1 + N_ADDRS_2 + N_ADDRS_3;
pub const ENTRY_PER_BLOCK: usize = 512;

pub const MAX_FILE_BLOCKS: usize = N_ADDRS_1
    + N_ADDRS_2 * ENTRY_PER_BLOCK
    + N_ADDRS_3 * ENTRY_PER_BLOCK * ENTRY_PER_BLOCK;
pub const INODE_MAXSIZE: u64 = (MAX_FILE_BLOCKS * BLOCK_SIZE) as u64;

pub const DINODE_SIZE: usize = 128;
pub const INODE_PER_BLOCK: usize = BLOCK_SIZE / DINODE_SIZE;

pub const DIR_NAME_LEN: usize = 126;
pub const DIRENT_SIZE: usize = 128;
pub const DIRENT_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub inode_blocks: u32,
    pub data_blocks: u32,
    pub inode_bitmap_start: u32,
    pub inode_start: u32,
    pub data_bitmap_start: u32,
    pub data_start: u32,
}

pub const SUPERBLOCK_SIZE: usize = 36;

impl SuperBlock {
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut b = [0u8; SUPERBLOCK_SIZE];
        let fields = [
            self.magic,
            self.block_size,
            self.total_blocks,
            self.inode_blocks,
            self.data_blocks,
            self.inode_bitmap_start,
            self.inode_start,
            self.data_bitmap_start,
            self.data_start,
        ];
        for (i, f) in fields.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let f = |i: usize| u32::from_le_bytes([b[i * 4], b[i * 4 + 1], b[i * 4 + 2], b[i * 4 + 3]]);
        Self {
            magic: f(0),
            block_size: f(1),
            total_blocks: f(2),
            inode_blocks: f(3),
            data_blocks: f(4),
            inode_bitmap_start: f(5),
            inode_start: f(6),
            data_bitmap_start: f(7),
            data_start: f(8),
        }
    }

    // block holding inode inum
    pub fn inode_block(&self, inum: u16) -> u32 {
        self.inode_start + inum as u32 / INODE_PER_BLOCK as u32
    }
}

// the on-disk inode record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DInode {
    pub itype: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u64,
    pub addrs: [u64; N_ADDRS],
}

impl DInode {
    pub fn to_bytes(&self) -> [u8; DINODE_SIZE] {
        let mut b = [0u8; DINODE_SIZE];
        b[0..2].copy_from_slice(&self.itype.to_le_bytes());
        b[2..4].copy_from_slice(&self.major.to_le_bytes());
        b[4..6].copy_from_slice(&self.minor.to_le_bytes());
        b[6..8].copy_from_slice(&self.nlink.to_le_bytes());
        b[8..16].copy_from_slice(&self.size.to_le_bytes());
        for (i, a) in self.addrs.iter().enumerate() {
            b[16 + i * 8..24 + i * 8].copy_from_slice(&a.to_le_bytes());
        }
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let mut addrs = [0u64; N_ADDRS];
        for (i, a) in addrs.iter_mut().enumerate() {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[16 + i * 8..24 + i * 8]);
            *a = u64::from_le_bytes(w);
        }
        Self {
            itype: u16::from_le_bytes([b[0], b[1]]),
            major: u16::from_le_bytes([b[2], b[3]]),
            minor: u16::from_le_bytes([b[4], b[5]]),
            nlink: u16::from_le_bytes([b[6], b[7]]),
            size: u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]),
            addrs,
        }
    }
}

// one directory entry; inum 0 marks a hole.
#[derive(Debug, Clone, Copy)]
pub struct DirEnt {
    pub inum: u16,
    pub name: [u8; DIR_NAME_LEN],
}

impl Default for DirEnt {
    fn default() -> Self {
        Self {
            inum: INUM_FREE,
            name: [0; DIR_NAME_LEN],
        }
    }
}

impl DirEnt {
    pub fn new(inum: u16, name: &[u8]) -> Self {
        let mut de = DirEnt {
            inum,
            name: [0; DIR_NAME_LEN],
        };
        let n = core::cmp::min(name.len(), DIR_NAME_LEN);
        de.name[..n].copy_from_slice(&name[..n]);
        de
    }

    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut b = [0u8; DIRENT_SIZE];
        b[0..2].copy_from_slice(&self.inum.to_le_bytes());
        b[2..2 + DIR_NAME_LEN].copy_from_slice(&self.name);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let mut name = [0u8; DIR_NAME_LEN];
        name.copy_from_slice(&b[2..2 + DIR_NAME_LEN]);
        Self {
            inum: u16::from_le_bytes([b[0], b[1]]),
            name,
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let n = self.name.iter().position(|&c| c == 0).unwrap_or(DIR_NAME_LEN);
        &self.name[..n]
    }

    // compare against a path element, with the same truncation the
    // path walker applies.
    pub fn name_is(&self, name: &[u8]) -> bool {
        let n = core::cmp::min(name.len(), DIR_NAME_LEN);
        self.name_bytes() == &name[..n]
    }
}

// Where block bn of a file lives in the address array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrPath {
    Direct(usize),
    Single { slot: usize, idx: usize },
    Double { slot: usize, idx1: usize, idx2: usize },
}

pub fn addr_path(bn: usize) -> Option<AddrPath> {
    if bn < N_ADDRS_1 {
        return Some(AddrPath::Direct(bn));
    }
    let bn = bn - N_ADDRS_1;
    if bn < N_ADDRS_2 * ENTRY_PER_BLOCK {
        return Some(AddrPath::Single {
            slot: N_ADDRS_1 + bn / ENTRY_PER_BLOCK,
            idx: bn % ENTRY_PER_BLOCK,
        });
    }
    let bn = bn - N_ADDRS_2 * ENTRY_PER_BLOCK;
    if bn < N_ADDRS_3 * ENTRY_PER_BLOCK * ENTRY_PER_BLOCK {
        return Some(AddrPath::Double {
            slot: N_ADDRS_1 + N_ADDRS_2 + bn / (ENTRY_PER_BLOCK * ENTRY_PER_BLOCK),
            idx1: (bn / ENTRY_PER_BLOCK) % ENTRY_PER_BLOCK,
            idx2: bn % ENTRY_PER_BLOCK,
        });
    }
    None
}

// Split off the first path element:
//   skip_element(b"a/bb/c") == Some((b"a", b"bb/c"))
//   skip_element(b"///a//bb") == Some((b"a", b"bb"))
//   skip_element(b"a") == Some((b"a", b""))
//   skip_element(b"") == skip_element(b"////") == None
pub fn skip_element(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path
        .iter()
        .position(|&c| c == b'/')
        .unwrap_or(path.len());
    let (name, rest) = path.split_at(end);
    let rest_start = rest
        .iter()
        .position(|&c| c != b'/')
        .unwrap_or(rest.len());
    Some((name, &rest[rest_start..]))
}

// ------------------------------------------------------------ kernel side

// the one in-memory superblock copy, filled in by init() before any
// other hart touches the file system.
#[cfg(target_os = "none")]
static SB: SbCell = SbCell(UnsafeCell::new(SuperBlock {
    magic: 0,
    block_size: 0,
    total_blocks: 0,
    inode_blocks: 0,
    data_blocks: 0,
    inode_bitmap_start: 0,
    inode_start: 0,
    data_bitmap_start: 0,
    data_start: 0,
}));

#[cfg(target_os = "none")]
struct SbCell(UnsafeCell<SuperBlock>);
#[cfg(target_os = "none")]
unsafe impl Sync for SbCell {}

#[cfg(target_os = "none")]
pub fn sb() -> &'static SuperBlock {
    unsafe { &*SB.0.get() }
}

// Mount: read the superblock. Runs in the first process's context,
// because it sleeps on disk I/O.
#[cfg(target_os = "none")]
pub fn init() {
    let bp = BCACHE.read(SB_BLOCK);
    let sb_read = SuperBlock::from_bytes(&bp.data[..SUPERBLOCK_SIZE]);
    drop(bp);
    assert!(sb_read.magic == FS_MAGIC, "fs: bad magic");
    assert!(
        sb_read.block_size == BLOCK_SIZE as u32,
        "fs: block size mismatch"
    );
    unsafe { *SB.0.get() = sb_read };
    crate::println!(
        "fs: {} blocks, {} inodes",
        sb_read.total_blocks,
        sb_read.inode_blocks * INODE_PER_BLOCK as u32
    );
}

#[cfg(target_os = "none")]
mod kernel {
    use super::*;

    // ------------------------------------------------------------ bitmaps

    // Find, set and return the first clear bit in a one-block bitmap.
    fn bitmap_set_first_free(bitmap_block: u32) -> u32 {
        let mut bp = BCACHE.read(bitmap_block);
        for byte in 0..BLOCK_SIZE {
            if bp.data[byte] == 0xff {
                continue;
            }
            for shift in 0..8 {
                if bp.data[byte] & (1 << shift) == 0 {
                    bp.data[byte] |= 1 << shift;
                    bp.write();
                    return (byte * 8 + shift) as u32;
                }
            }
        }
        panic!("bitmap: no free bit");
    }

    fn bitmap_clear(bitmap_block: u32, num: u32) {
        let mut bp = BCACHE.read(bitmap_block);
        let byte = (num / 8) as usize;
        let mask = 1u8 << (num % 8);
        assert!(bp.data[byte] & mask != 0, "bitmap: clearing free bit");
        bp.data[byte] &= !mask;
        bp.write();
    }

    fn zero_block(bno: u32) {
        let mut bp = BCACHE.read(bno);
        bp.data.iter_mut().for_each(|b| *b = 0);
        bp.write();
    }

    // Allocate a zeroed data block.
    pub fn alloc_block() -> u32 {
        let off = bitmap_set_first_free(sb().data_bitmap_start);
        let bno = sb().data_start + off;
        zero_block(bno);
        bno
    }

    pub fn free_block(bno: u32) {
        bitmap_clear(sb().data_bitmap_start, bno - sb().data_start);
    }

    // inode numbers start at 1; bit i of the bitmap is inode i+1.
    fn alloc_inum() -> u16 {
        (bitmap_set_first_free(sb().inode_bitmap_start) + 1) as u16
    }

    fn free_inum(inum: u16) {
        bitmap_clear(sb().inode_bitmap_start, inum as u32 - 1);
    }

    // ------------------------------------------------------- inode table
    //
    // The table caches at most NINODE disk inodes. inum and the
    // reference count of each slot live under the table lock; the rest
    // of a slot is guarded by its sleep lock. An Inode value is a
    // counted handle: dup() adds a reference, dropping the handle
    // releases one, and releasing the last reference of an unlinked
    // inode destroys it on disk.

    pub static ITABLE: Itable = Itable::new();

    pub struct Itable {
        meta: Mutex<[IMeta; NINODE]>,
        slots: [SleepLock<IData>; NINODE],
    }

    #[derive(Clone, Copy)]
    struct IMeta {
        inum: u16,
        refcnt: u32,
    }

    pub struct IData {
        pub inum: u16,
        pub valid: bool,
        pub itype: IType,
        pub major: u16,
        pub minor: u16,
        pub nlink: u16,
        pub size: u64,
        pub addrs: [u64; N_ADDRS],
    }

    impl IData {
        const fn empty() -> Self {
            Self {
                inum: 0,
                valid: false,
                itype: IType::None,
                major: 0,
                minor: 0,
                nlink: 0,
                size: 0,
                addrs: [0; N_ADDRS],
            }
        }
    }

    pub struct Inode {
        idx: usize,
        pub inum: u16,
    }

    impl Itable {
        const fn new() -> Self {
            const SLOT: SleepLock<IData> = SleepLock::new(IData::empty(), "inode");
            const META: IMeta = IMeta { inum: 0, refcnt: 0 };
            Self {
                meta: Mutex::new([META; NINODE], "itable"),
                slots: [SLOT; NINODE],
            }
        }

        // Find the in-core inode with this number, or claim a free
        // slot for it. The returned handle is unlocked.
        pub fn get(&'static self, inum: u16) -> Inode {
            let mut meta = self.meta.lock();

            let mut empty = None;
            for i in 0..NINODE {
                if meta[i].refcnt > 0 && meta[i].inum == inum {
                    meta[i].refcnt += 1;
                    return Inode { idx: i, inum };
                }
                if meta[i].refcnt == 0 && empty.is_none() {
                    empty = Some(i);
                }
            }

            let i = empty.expect("itable: no slots");
            meta[i] = IMeta { inum, refcnt: 1 };
            // refcnt was zero, so nobody holds or can take the sleep
            // lock; stale cached state is discarded here.
            unsafe { self.slots[i].get_mut().valid = false };
            Inode { idx: i, inum }
        }

        fn dup(&self, ip: &Inode) -> Inode {
            let mut meta = self.meta.lock();
            meta[ip.idx].refcnt += 1;
            Inode {
                idx: ip.idx,
                inum: ip.inum,
            }
        }

        // Release one reference. On the last reference of a valid,
        // unlinked inode, free its data and its on-disk slot. Taking
        // the sleep lock cannot block: refcnt == 1 means no one else
        // holds it, and nlink == 0 means no path can reach it anymore.
        fn put(&'static self, idx: usize) {
            let mut meta = self.meta.lock();
            if meta[idx].refcnt == 1 {
                // sole reference: the payload cannot be sleep-locked
                // by anyone else, so peeking is safe.
                let needs_destroy = {
                    let d = unsafe { self.slots[idx].get_mut() };
                    d.valid && d.nlink == 0
                };
                if needs_destroy {
                    let mut idata = self.slots[idx].lock();
                    let meta_lock = Mutex::unlock(meta);

                    idata.free_data();
                    free_inum(idata.inum);
                    idata.itype = IType::None;
                    idata.update();
                    idata.valid = false;
                    drop(idata);

                    meta = meta_lock.lock();
                }
            }
            meta[idx].refcnt -= 1;
        }
    }

    impl Inode {
        // Another handle to the same inode; ip = ip.dup() idiom.
        pub fn dup(&self) -> Inode {
            ITABLE.dup(self)
        }

        // Sleep-lock the inode, reading it from disk if this slot has
        // not seen it yet.
        pub fn lock(&self) -> SleepLockGuard<'static, IData> {
            let mut guard = ITABLE.slots[self.idx].lock();
            if !guard.valid {
                guard.inum = self.inum;
                guard.load();
                guard.valid = true;
                assert!(guard.itype != IType::None, "inode lock: no type");
            }
            guard
        }
    }

    impl Drop for Inode {
        fn drop(&mut self) {
            ITABLE.put(self.idx);
        }
    }

    // Allocate a fresh on-disk inode of the given type and return a
    // referenced, unlocked handle to it.
    pub fn create_inode(itype: IType, major: u16, minor: u16) -> Inode {
        let inum = alloc_inum();
        let ip = ITABLE.get(inum);
        // a fresh inode's disk slot holds garbage; initialize it
        // instead of loading it.
        let mut g = ITABLE.slots[ip.idx].lock();
        g.inum = inum;
        g.itype = itype;
        g.major = major;
        g.minor = minor;
        g.nlink = 1;
        g.size = 0;
        g.addrs = [0; N_ADDRS];
        g.valid = true;
        g.update();
        drop(g);
        ip
    }

    // ------------------------------------------------- inode contents

    impl IData {
        // Copy the cached inode from its disk slot.
        fn load(&mut self) {
            let bp = BCACHE.read(sb().inode_block(self.inum));
            let off = (self.inum as usize % INODE_PER_BLOCK) * DINODE_SIZE;
            let din = DInode::from_bytes(&bp.data[off..off + DINODE_SIZE]);
            drop(bp);
            self.itype = IType::from_u16(din.itype);
            self.major = din.major;
            self.minor = din.minor;
            self.nlink = din.nlink;
            self.size = din.size;
            self.addrs = din.addrs;
        }

        // Copy the cached inode back to its disk slot. Must be called
        // after every change to a field that lives on disk. Caller
        // holds the inode lock.
        pub fn update(&self) {
            let din = DInode {
                itype: self.itype as u16,
                major: self.major,
                minor: self.minor,
                nlink: self.nlink,
                size: self.size,
                addrs: self.addrs,
            };
            let mut bp = BCACHE.read(sb().inode_block(self.inum));
            let off = (self.inum as usize % INODE_PER_BLOCK) * DINODE_SIZE;
            bp.data[off..off + DINODE_SIZE].copy_from_slice(&din.to_bytes());
            bp.write();
        }

        pub fn stat(&self) -> FileStat {
            FileStat {
                itype: self.itype as u16,
                inum: self.inum,
                nlink: self.nlink,
                size: self.size,
            }
        }

        // Look up (or allocate) entry idx of an indirect block,
        // rewriting the block iff the entry changed.
        fn indirect_entry(block: u32, idx: usize) -> u32 {
            let mut bp = BCACHE.read(block);
            let entries = LayoutVerified::<&mut [u8], [u64]>::new_slice(&mut bp.data[..])
                .unwrap()
                .into_mut_slice();
            let old = entries[idx];
            let mut val = old;
            if val == 0 {
                val = alloc_block() as u64;
            }
            if val != old {
                entries[idx] = val;
                bp.write();
            }
            val as u32
        }

        // The disk block backing file block bn, allocated on first
        // touch at every level of the address tree.
        fn locate_block(&mut self, bn: usize) -> u32 {
            let path = addr_path(bn).expect("locate_block: out of range");
            let slot = match path {
                AddrPath::Direct(s) | AddrPath::Single { slot: s, .. } | AddrPath::Double { slot: s, .. } => s,
            };
            if self.addrs[slot] == 0 {
                self.addrs[slot] = alloc_block() as u64;
            }
            match path {
                AddrPath::Direct(_) => self.addrs[slot] as u32,
                AddrPath::Single { idx, .. } => Self::indirect_entry(self.addrs[slot] as u32, idx),
                AddrPath::Double { idx1, idx2, .. } => {
                    let mid = Self::indirect_entry(self.addrs[slot] as u32, idx1);
                    Self::indirect_entry(mid, idx2)
                }
            }
        }

        // Read from the inode's data. Caller holds the inode lock.
        // Returns the number of bytes copied, clipped to the file size.
        pub fn read(&mut self, mut dst: VirtAddr, off: u64, n: usize) -> usize {
            if off > self.size {
                return 0;
            }
            let n = core::cmp::min(n as u64, self.size - off) as usize;

            let mut tot = 0;
            let mut off = off;
            while tot < n {
                let bno = self.locate_block((off / BLOCK_SIZE as u64) as usize);
                let bp = BCACHE.read(bno);
                let boff = (off % BLOCK_SIZE as u64) as usize;
                let m = core::cmp::min(n - tot, BLOCK_SIZE - boff);
                either_copy_out(dst, &bp.data[boff..boff + m]);
                drop(bp);
                tot += m;
                off += m as u64;
                dst = dst.offset(m);
            }
            tot
        }

        // Write into the inode's data, growing the file as needed (but
        // never past the address tree). Caller holds the inode lock.
        pub fn write(&mut self, mut src: VirtAddr, off: u64, n: usize) -> Result<usize, ()> {
            if off + n as u64 > INODE_MAXSIZE {
                return Err(());
            }

            let mut tot = 0;
            let mut off = off;
            while tot < n {
                let bno = self.locate_block((off / BLOCK_SIZE as u64) as usize);
                let mut bp = BCACHE.read(bno);
                let boff = (off % BLOCK_SIZE as u64) as usize;
                let m = core::cmp::min(n - tot, BLOCK_SIZE - boff);
                either_copy_in(&mut bp.data[boff..boff + m], src);
                bp.write();
                drop(bp);
                tot += m;
                off += m as u64;
                src = src.offset(m);
            }

            if off > self.size {
                self.size = off;
            }
            // write the inode back even if the size is unchanged:
            // locate_block may have extended the address tree.
            self.update();
            Ok(tot)
        }

        // Free every data block (and every indirect block on the way),
        // leaving the inode empty. Caller holds the inode lock.
        pub fn free_data(&mut self) {
            fn level_free(block: u32, level: usize) {
                assert!(block != 0, "level_free: block 0");
                if level > 0 {
                    let bp = BCACHE.read(block);
                    let entries = LayoutVerified::<&[u8], [u64]>::new_slice(&bp.data[..])
                        .unwrap()
                        .into_slice();
                    for &e in entries.iter() {
                        if e != 0 {
                            level_free(e as u32, level - 1);
                        }
                    }
                    drop(bp);
                }
                free_block(block);
            }

            for slot in 0..N_ADDRS {
                if self.addrs[slot] == 0 {
                    continue;
                }
                let level = if slot < N_ADDRS_1 {
                    0
                } else if slot < N_ADDRS_1 + N_ADDRS_2 {
                    1
                } else {
                    2
                };
                level_free(self.addrs[slot] as u32, level);
                self.addrs[slot] = 0;
            }
            self.size = 0;
            self.update();
        }

        // ------------------------------------------------ directories
        //
        // A directory's payload is a single block of dirents, which
        // caps it at DIRENT_PER_BLOCK entries. The cap is enforced on
        // every insert, "." and ".." included.

        fn read_entry(&mut self, off: u64) -> DirEnt {
            let mut buf = [0u8; DIRENT_SIZE];
            let n = self.read(VirtAddr::Kernel(buf.as_mut_ptr() as usize), off, DIRENT_SIZE);
            assert!(n == DIRENT_SIZE, "dir: short entry read");
            DirEnt::from_bytes(&buf)
        }

        fn write_entry(&mut self, off: u64, de: &DirEnt) {
            let buf = de.to_bytes();
            let n = self
                .write(VirtAddr::Kernel(buf.as_ptr() as usize), off, DIRENT_SIZE)
                .expect("dir: entry write");
            assert!(n == DIRENT_SIZE, "dir: short entry write");
        }

        // Scan for name; the offset comes along for delete.
        pub fn dir_lookup(&mut self, name: &[u8]) -> Option<(u16, u64)> {
            assert!(self.itype == IType::Dir, "dir_lookup: not a dir");
            let mut off = 0;
            while off < self.size {
                let de = self.read_entry(off);
                if de.inum != INUM_FREE && de.name_is(name) {
                    return Some((de.inum, off));
                }
                off += DIRENT_SIZE as u64;
            }
            None
        }

        // Add an entry, reusing the first hole or appending. Fails on
        // a duplicate name or a full block.
        pub fn dir_add(&mut self, name: &[u8], inum: u16) -> Result<(), ()> {
            assert!(self.itype == IType::Dir, "dir_add: not a dir");
            let mut hole = None;
            let mut off = 0;
            while off < self.size {
                let de = self.read_entry(off);
                if de.inum == INUM_FREE {
                    if hole.is_none() {
                        hole = Some(off);
                    }
                } else if de.name_is(name) {
                    return Err(()); // duplicate
                }
                off += DIRENT_SIZE as u64;
            }

            let off = match hole {
                Some(off) => off,
                None => {
                    if self.size + DIRENT_SIZE as u64 > BLOCK_SIZE as u64 {
                        return Err(()); // single-block directory is full
                    }
                    self.size
                }
            };
            self.write_entry(off, &DirEnt::new(inum, name));
            Ok(())
        }

        // Zero the named entry in place; its inode number is returned
        // so the caller can drop the link count.
        pub fn dir_delete(&mut self, name: &[u8]) -> Option<u16> {
            let (inum, off) = self.dir_lookup(name)?;
            self.write_entry(off, &DirEnt::default());
            Some(inum)
        }

        // Copy the live entries to dst, at most len bytes. Returns the
        // bytes copied.
        pub fn dir_entries(&mut self, mut dst: VirtAddr, len: usize) -> usize {
            assert!(self.itype == IType::Dir, "dir_entries: not a dir");
            let mut copied = 0;
            let mut off = 0;
            while off < self.size {
                let de = self.read_entry(off);
                if de.inum != INUM_FREE {
                    if copied + DIRENT_SIZE > len {
                        break;
                    }
                    either_copy_out(dst, &de.to_bytes());
                    dst = dst.offset(DIRENT_SIZE);
                    copied += DIRENT_SIZE;
                }
                off += DIRENT_SIZE as u64;
            }
            copied
        }

        // A directory may be unlinked only when "." and ".." are its
        // sole entries; probing for a third live entry decides.
        pub fn dir_is_empty(&mut self) -> bool {
            let mut buf = [0u8; DIRENT_SIZE * 3];
            let n = self.dir_entries(VirtAddr::Kernel(buf.as_mut_ptr() as usize), DIRENT_SIZE * 3);
            match n / DIRENT_SIZE {
                2 => true,
                3 => false,
                _ => panic!("dir_is_empty: {} entries", n / DIRENT_SIZE),
            }
        }
    }

    // ------------------------------------------------------------ paths

    // Walk path to an inode. With parent set, stop one element early
    // and hand back the final name too.
    fn resolve<'p>(path: &'p [u8], parent: bool) -> Option<(Inode, &'p [u8])> {
        let mut ip = if path.first() == Some(&b'/') {
            ITABLE.get(ROOTINO)
        } else {
            CPUS.my_proc().unwrap().data().cwd.as_ref()?.dup()
        };

        let mut rest = path;
        loop {
            let (name, next) = match skip_element(rest) {
                Some(x) => x,
                None => break,
            };
            let mut guard = ip.lock();
            if guard.itype != IType::Dir {
                return None;
            }
            if parent && next.is_empty() {
                drop(guard);
                return Some((ip, name));
            }
            let (inum, _) = guard.dir_lookup(name)?;
            drop(guard);
            ip = ITABLE.get(inum);
            rest = next;
        }

        if parent {
            // path had no final element to split off
            return None;
        }
        Some((ip, b""))
    }

    pub fn path_to_inode(path: &[u8]) -> Option<Inode> {
        resolve(path, false).map(|(ip, _)| ip)
    }

    pub fn path_to_parent_inode(path: &[u8]) -> Option<(Inode, &[u8])> {
        resolve(path, true)
    }

    // Return the inode for path, creating it (and linking it into its
    // parent) if no entry exists yet. An existing inode is returned as
    // is, whatever its type.
    pub fn path_create_inode(path: &[u8], itype: IType, major: u16, minor: u16) -> Option<Inode> {
        let (pip, name) = path_to_parent_inode(path)?;
        let mut pguard = pip.lock();

        if let Some((inum, _)) = pguard.dir_lookup(name) {
            drop(pguard);
            return Some(ITABLE.get(inum));
        }

        let ip = create_inode(itype, major, minor);

        if pguard.dir_add(name, ip.inum).is_err() {
            // parent directory is full: undo the fresh inode. no one
            // else can reference it yet.
            drop(pguard);
            let mut g = ip.lock();
            g.nlink = 0;
            g.update();
            drop(g);
            return None;
        }

        if itype == IType::Dir {
            let mut g = ip.lock();
            g.dir_add(b".", ip.inum).expect("dot entry");
            g.dir_add(b"..", pip.inum).expect("dotdot entry");
            g.nlink += 1; // for "."
            g.update();
            drop(g);

            pguard.nlink += 1; // for ".."
            pguard.update();
        }

        drop(pguard);
        Some(ip)
    }

    // Make new name the same inode as old. Directories cannot be
    // linked.
    pub fn link(old: &[u8], new: &[u8]) -> Result<(), ()> {
        let ip = path_to_inode(old).ok_or(())?;
        {
            let mut g = ip.lock();
            if g.itype == IType::Dir {
                return Err(());
            }
            g.nlink += 1;
            g.update();
        }

        let undo = |ip: &Inode| {
            let mut g = ip.lock();
            g.nlink -= 1;
            g.update();
        };

        let (pip, name) = match path_to_parent_inode(new) {
            Some(x) => x,
            None => {
                undo(&ip);
                return Err(());
            }
        };
        let mut pguard = pip.lock();
        if pguard.dir_add(name, ip.inum).is_err() {
            drop(pguard);
            undo(&ip);
            return Err(());
        }
        Ok(())
    }

    // Remove path's directory entry and drop the link count. The
    // on-disk inode itself is destroyed when the last in-core
    // reference goes away.
    pub fn unlink(path: &[u8]) -> Result<(), ()> {
        let (pip, name) = path_to_parent_inode(path).ok_or(())?;
        let mut pguard = pip.lock();

        if name == b"." || name == b".." {
            return Err(());
        }

        let (inum, _) = pguard.dir_lookup(name).ok_or(())?;
        let ip = ITABLE.get(inum);
        let mut g = ip.lock();

        assert!(g.nlink >= 1, "unlink: nlink < 1");
        if g.itype == IType::Dir && !g.dir_is_empty() {
            return Err(());
        }

        pguard.dir_delete(name).expect("unlink: entry vanished");
        if g.itype == IType::Dir {
            pguard.nlink -= 1; // the victim's ".." goes away
            pguard.update();
        }
        drop(pguard);

        g.nlink -= 1;
        g.update();
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use kernel::{
    alloc_block, create_inode, free_block, link, path_create_inode, path_to_inode,
    path_to_parent_inode, unlink, IData, Inode, Itable, ITABLE,
};

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(INODE_PER_BLOCK, 32);
        assert_eq!(DIRENT_PER_BLOCK, 32);
        assert_eq!(
            MAX_FILE_BLOCKS,
            11 + 2 * 512 + 512 * 512
        );
    }

    #[test]
    fn superblock_roundtrips() {
        let sb = SuperBlock {
            magic: FS_MAGIC,
            block_size: BLOCK_SIZE as u32,
            total_blocks: 2048,
            inode_blocks: 4,
            data_blocks: 2041,
            inode_bitmap_start: 1,
            inode_start: 2,
            data_bitmap_start: 6,
            data_start: 7,
        };
        assert_eq!(SuperBlock::from_bytes(&sb.to_bytes()), sb);
    }

    #[test]
    fn dinode_roundtrips() {
        let mut addrs = [0u64; N_ADDRS];
        addrs[0] = 7;
        addrs[N_ADDRS - 1] = 0xdead_beef;
        let din = DInode {
            itype: IType::File as u16,
            major: 0,
            minor: 0,
            nlink: 3,
            size: 0x10_0000,
            addrs,
        };
        let bytes = din.to_bytes();
        assert_eq!(bytes.len(), DINODE_SIZE);
        assert_eq!(DInode::from_bytes(&bytes), din);
    }

    #[test]
    fn dirent_names() {
        let de = DirEnt::new(3, b"console");
        assert_eq!(de.inum, 3);
        assert!(de.name_is(b"console"));
        assert!(!de.name_is(b"consol"));
        assert_eq!(de.name_bytes(), b"console");

        let bytes = de.to_bytes();
        assert_eq!(DirEnt::from_bytes(&bytes).name_bytes(), b"console");

        // over-long names are truncated the same way on both sides
        let long = [b'x'; 200];
        let de = DirEnt::new(1, &long);
        assert!(de.name_is(&long));
        assert_eq!(de.name_bytes().len(), DIR_NAME_LEN);
    }

    #[test]
    fn addr_path_boundaries() {
        assert_eq!(addr_path(0), Some(AddrPath::Direct(0)));
        assert_eq!(addr_path(N_ADDRS_1 - 1), Some(AddrPath::Direct(N_ADDRS_1 - 1)));
        assert_eq!(
            addr_path(N_ADDRS_1),
            Some(AddrPath::Single {
                slot: N_ADDRS_1,
                idx: 0
            })
        );
        assert_eq!(
            addr_path(N_ADDRS_1 + ENTRY_PER_BLOCK),
            Some(AddrPath::Single {
                slot: N_ADDRS_1 + 1,
                idx: 0
            })
        );
        // the first double-indirect block
        let first_double = N_ADDRS_1 + N_ADDRS_2 * ENTRY_PER_BLOCK;
        assert_eq!(
            addr_path(first_double),
            Some(AddrPath::Double {
                slot: N_ADDRS_1 + N_ADDRS_2,
                idx1: 0,
                idx2: 0
            })
        );
        assert_eq!(
            addr_path(first_double + ENTRY_PER_BLOCK + 1),
            Some(AddrPath::Double {
                slot: N_ADDRS_1 + N_ADDRS_2,
                idx1: 1,
                idx2: 1
            })
        );
        // the very last addressable block, then one past it
        assert_eq!(
            addr_path(MAX_FILE_BLOCKS - 1),
            Some(AddrPath::Double {
                slot: N_ADDRS - 1,
                idx1: ENTRY_PER_BLOCK - 1,
                idx2: ENTRY_PER_BLOCK - 1
            })
        );
        assert_eq!(addr_path(MAX_FILE_BLOCKS), None);
    }

    #[test]
    fn skip_element_cases() {
        assert_eq!(skip_element(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_element(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_element(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_element(b"a////"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_element(b""), None);
        assert_eq!(skip_element(b"////"), None);
    }
}
