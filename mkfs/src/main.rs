// Build an initial file system image on the build host.
//
//   mkfs fs.img [files...]
//
// Disk layout (see fs.rs):
//   [ superblock | inode bitmap | inode table | data bitmap | data ]
//
// Blocks and inodes are handed out sequentially while the image is
// assembled; the bitmaps are rendered from the final counters at the
// end.

use mkfs::fs::{
    DInode, DirEnt, SuperBlock, BLOCK_SIZE, DINODE_SIZE, DIRENT_SIZE, ENTRY_PER_BLOCK, FS_MAGIC,
    INODE_PER_BLOCK, N_ADDRS_1, N_ADDRS_2, ROOTINO,
};
use mkfs::stat::IType;
use std::env;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process;
use zerocopy::LayoutVerified;

const FSSIZE: u32 = 2048; // blocks in the image
const NINODES: u32 = 128;

const INODE_BITMAP_START: u32 = 1;
const INODE_START: u32 = 2;
const INODE_BLOCKS: u32 = (NINODES + INODE_PER_BLOCK as u32 - 1) / INODE_PER_BLOCK as u32;
const DATA_BITMAP_START: u32 = INODE_START + INODE_BLOCKS;
const DATA_START: u32 = DATA_BITMAP_START + 1;

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}

struct FsImg {
    img: std::fs::File,
    freeinode: u16, // next inode number to hand out
    freeblock: u32, // next data block to hand out
}

impl FsImg {
    fn wsect(&mut self, sec: u32, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE);
        self.img
            .seek(SeekFrom::Start(sec as u64 * BLOCK_SIZE as u64))
            .unwrap_or_else(|_| die("seek"));
        self.img.write_all(buf).unwrap_or_else(|_| die("write"));
    }

    fn rsect(&mut self, sec: u32) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        self.img
            .seek(SeekFrom::Start(sec as u64 * BLOCK_SIZE as u64))
            .unwrap_or_else(|_| die("seek"));
        self.img.read_exact(&mut buf).unwrap_or_else(|_| die("read"));
        buf
    }

    fn winode(&mut self, inum: u16, din: &DInode) {
        let sec = INODE_START + inum as u32 / INODE_PER_BLOCK as u32;
        let mut buf = self.rsect(sec);
        let off = (inum as usize % INODE_PER_BLOCK) * DINODE_SIZE;
        buf[off..off + DINODE_SIZE].copy_from_slice(&din.to_bytes());
        self.wsect(sec, &buf);
    }

    fn rinode(&mut self, inum: u16) -> DInode {
        let sec = INODE_START + inum as u32 / INODE_PER_BLOCK as u32;
        let buf = self.rsect(sec);
        let off = (inum as usize % INODE_PER_BLOCK) * DINODE_SIZE;
        DInode::from_bytes(&buf[off..off + DINODE_SIZE])
    }

    fn ialloc(&mut self, itype: IType) -> u16 {
        let inum = self.freeinode;
        self.freeinode += 1;
        if self.freeinode as u32 > NINODES {
            die("out of inodes");
        }
        let din = DInode {
            itype: itype as u16,
            nlink: 1,
            ..Default::default()
        };
        self.winode(inum, &din);
        inum
    }

    fn balloc(&mut self) -> u32 {
        let b = self.freeblock;
        self.freeblock += 1;
        if self.freeblock > FSSIZE {
            die("out of blocks");
        }
        b
    }

    // Append data to inum's file, extending the address tree through
    // the single-indirect range. mkfs never needs double-indirect
    // files.
    fn iappend(&mut self, inum: u16, data: &[u8]) {
        let mut din = self.rinode(inum);
        let mut off = 0;

        while off < data.len() {
            let fbn = (din.size as usize) / BLOCK_SIZE;
            let block = if fbn < N_ADDRS_1 {
                if din.addrs[fbn] == 0 {
                    din.addrs[fbn] = self.balloc() as u64;
                }
                din.addrs[fbn] as u32
            } else {
                let idx = fbn - N_ADDRS_1;
                if idx >= N_ADDRS_2 * ENTRY_PER_BLOCK {
                    die("file too large");
                }
                let slot = N_ADDRS_1 + idx / ENTRY_PER_BLOCK;
                if din.addrs[slot] == 0 {
                    din.addrs[slot] = self.balloc() as u64;
                }
                let ind = din.addrs[slot] as u32;
                let mut buf = self.rsect(ind);
                let entries = LayoutVerified::<&mut [u8], [u64]>::new_slice(&mut buf[..])
                    .unwrap()
                    .into_mut_slice();
                if entries[idx % ENTRY_PER_BLOCK] == 0 {
                    entries[idx % ENTRY_PER_BLOCK] = self.balloc() as u64;
                    let b = entries[idx % ENTRY_PER_BLOCK] as u32;
                    self.wsect(ind, &buf);
                    b
                } else {
                    entries[idx % ENTRY_PER_BLOCK] as u32
                }
            };

            let boff = din.size as usize % BLOCK_SIZE;
            let n = std::cmp::min(BLOCK_SIZE - boff, data.len() - off);
            let mut buf = self.rsect(block);
            buf[boff..boff + n].copy_from_slice(&data[off..off + n]);
            self.wsect(block, &buf);

            din.size += n as u64;
            off += n;
        }
        self.winode(inum, &din);
    }

    fn add_dirent(&mut self, dir: u16, name: &[u8], inum: u16) {
        self.iappend(dir, &DirEnt::new(inum, name).to_bytes());
    }

    // Render a bitmap: the first `used` bits set, and every bit past
    // `valid` set too, so the kernel's first-fit scan can never hand
    // out a resource the disk does not have.
    fn write_bitmap(&mut self, sec: u32, used: u32, valid: u32) {
        let mut buf = [0u8; BLOCK_SIZE];
        for bit in 0..BLOCK_SIZE * 8 {
            if bit < used as usize || bit >= valid as usize {
                buf[bit / 8] |= 1 << (bit % 8);
            }
        }
        self.wsect(sec, &buf);
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        die("usage: mkfs fs.img [files...]");
    }
    assert_eq!(BLOCK_SIZE % DIRENT_SIZE, 0);
    assert_eq!(BLOCK_SIZE % DINODE_SIZE, 0);

    let img = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&args[1])
        .unwrap_or_else(|_| die("cannot create image"));

    let mut fsimg = FsImg {
        img,
        freeinode: ROOTINO,
        freeblock: DATA_START,
    };

    // zero the whole image first.
    let zeroes = [0u8; BLOCK_SIZE];
    for sec in 0..FSSIZE {
        fsimg.wsect(sec, &zeroes);
    }

    // the root directory holds itself and a console device node.
    let root = fsimg.ialloc(IType::Dir);
    assert_eq!(root, ROOTINO);
    fsimg.add_dirent(root, b".", root);
    fsimg.add_dirent(root, b"..", root);
    let mut din = fsimg.rinode(root);
    din.nlink = 2; // "." and ".."
    fsimg.winode(root, &din);

    let console = fsimg.ialloc(IType::Device);
    let mut din = fsimg.rinode(console);
    din.major = 1; // Major::Console
    fsimg.winode(console, &din);
    fsimg.add_dirent(root, b"console", console);

    // install the requested files under the root directory.
    for arg in &args[2..] {
        let data = std::fs::read(arg).unwrap_or_else(|_| die("cannot read input file"));
        let base = Path::new(arg)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| die("bad file name"));
        // user binaries are conventionally stored under their plain
        // name, shorn of any leading underscore build prefix.
        let name = base.trim_start_matches('_');

        let inum = fsimg.ialloc(IType::File);
        fsimg.iappend(inum, &data);
        fsimg.add_dirent(root, name.as_bytes(), inum);
        println!("mkfs: {} ({} bytes) as /{}", arg, data.len(), name);
    }

    // bitmaps reflect everything handed out above.
    let used_inodes = fsimg.freeinode as u32 - 1; // numbering starts at 1
    fsimg.write_bitmap(INODE_BITMAP_START, used_inodes, NINODES);
    let used_data = fsimg.freeblock - DATA_START;
    fsimg.write_bitmap(DATA_BITMAP_START, used_data, FSSIZE - DATA_START);

    let sb = SuperBlock {
        magic: FS_MAGIC,
        block_size: BLOCK_SIZE as u32,
        total_blocks: FSSIZE,
        inode_blocks: INODE_BLOCKS,
        data_blocks: FSSIZE - DATA_START,
        inode_bitmap_start: INODE_BITMAP_START,
        inode_start: INODE_START,
        data_bitmap_start: DATA_BITMAP_START,
        data_start: DATA_START,
    };
    let mut sb_block = [0u8; BLOCK_SIZE];
    sb_block[..sb.to_bytes().len()].copy_from_slice(&sb.to_bytes());
    fsimg.wsect(0, &sb_block);

    println!(
        "mkfs: {} blocks total, {} inodes used, first free data block {}",
        FSSIZE, used_inodes, fsimg.freeblock
    );
}
