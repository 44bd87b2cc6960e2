pub const NCPU: usize = 4; // maximum number of harts
pub const NPROC: usize = 32; // maximum number of processes
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 32; // open files per system
pub const NINODE: usize = 32; // maximum number of active i-nodes
pub const NDEV: usize = 4; // maximum major device number
pub const NBUF: usize = 16; // size of disk block cache
pub const N_MMAP: usize = 64; // anonymous-region nodes in the global pool
pub const MAXARG: usize = 16; // max exec arguments
pub const MAXPATH: usize = 128; // maximum file path name
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const KERN_PAGES: usize = 1024; // frames reserved for the kernel pool

// ticks per second given the machine timer interval below.
pub const TICKS_PER_SEC: usize = 10;

// machine-timer interrupt interval, in CLINT cycles.
// qemu's virt machine runs the CLINT at 10 MHz, so this is 1/10th second.
pub const INTERVAL: u64 = 1_000_000;
