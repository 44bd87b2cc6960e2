// Buffer cache: a fixed pool of in-memory copies of disk blocks.
//
// The slots hang on one doubly linked list with a sentinel, most
// recently used first, so the eviction scan (first slot with no
// references, front to back) lands on the oldest free buffer. Links,
// reference counts and block numbers live under the list spin lock;
// each slot's payload and dirty flag live under the slot's sleep lock.
//
// Writes are lazy: write() only marks the buffer dirty, and the data
// goes to disk when the slot is next evicted. At most one slot holds a
// given block, which the reserve-then-recheck dance in read() ensures
// even when two harts miss on the same block at once.

use crate::fs::BLOCK_SIZE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::Mutex;
use crate::virtio_disk;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;

pub const BLOCK_UNUSED: u32 = u32::MAX;

pub static BCACHE: Bcache = Bcache::new();

pub struct Bcache {
    ctrl: Mutex<Ctrl>,
    slots: [SleepLock<BufData>; NBUF],
    // set while the virtio driver owns a slot's payload; the driver's
    // completion interrupt clears it and wakes the waiter.
    in_flight: [AtomicBool; NBUF],
}

// data first and 8-aligned, so typed views of the payload
// (LayoutVerified in fs.rs) never see a misaligned buffer.
#[repr(C, align(8))]
pub struct BufData {
    pub data: [u8; BLOCK_SIZE],
    pub block_no: u32, // mirror of the ctrl entry, for the disk driver
    pub dirty: bool,   // contents newer than disk
}

impl BufData {
    const fn new() -> Self {
        Self {
            data: [0; BLOCK_SIZE],
            block_no: BLOCK_UNUSED,
            dirty: false,
        }
    }
}

// index NBUF is the list sentinel.
struct Ctrl {
    refcnt: [u32; NBUF],
    block_no: [u32; NBUF],
    next: [usize; NBUF + 1],
    prev: [usize; NBUF + 1],
}

impl Ctrl {
    const fn new() -> Self {
        // start with every slot on the list, in index order.
        let mut next = [0usize; NBUF + 1];
        let mut prev = [0usize; NBUF + 1];
        let mut i = 0;
        while i <= NBUF {
            next[i] = if i == NBUF { 0 } else { i + 1 };
            prev[i] = if i == 0 { NBUF } else { i - 1 };
            i += 1;
        }
        Self {
            refcnt: [0; NBUF],
            block_no: [BLOCK_UNUSED; NBUF],
            next,
            prev,
        }
    }

    fn detach(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p] = n;
        self.prev[n] = p;
    }

    // most-recently-used end (sentinel.next)
    fn attach_front(&mut self, i: usize) {
        let n = self.next[NBUF];
        self.next[i] = n;
        self.prev[i] = NBUF;
        self.prev[n] = i;
        self.next[NBUF] = i;
    }

    // free end (sentinel.prev)
    fn attach_back(&mut self, i: usize) {
        let p = self.prev[NBUF];
        self.prev[i] = p;
        self.next[i] = NBUF;
        self.next[p] = i;
        self.prev[NBUF] = i;
    }

    // slots front to back, following the list
    fn iter(&self) -> ListIter<'_> {
        ListIter {
            ctrl: self,
            at: self.next[NBUF],
        }
    }
}

struct ListIter<'a> {
    ctrl: &'a Ctrl,
    at: usize,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.at == NBUF {
            return None;
        }
        let i = self.at;
        self.at = self.ctrl.next[i];
        Some(i)
    }
}

// A locked reference to one cache slot. Dropping it releases the
// sleep lock and the reference, moving an unreferenced slot to the
// free end of the list.
pub struct Buf {
    idx: usize,
    guard: Option<SleepLockGuard<'static, BufData>>,
}

impl Buf {
    pub fn index(&self) -> usize {
        self.idx
    }

    // Record that the contents changed. The write to disk itself
    // happens when the slot is evicted.
    pub fn write(&mut self) {
        self.guard.as_mut().unwrap().dirty = true;
    }
}

impl Deref for Buf {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut BufData {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.guard.take(); // sleep-unlock before touching the list
        let mut ctrl = BCACHE.ctrl.lock();
        let i = self.idx;
        ctrl.refcnt[i] -= 1;
        if ctrl.refcnt[i] == 0 {
            ctrl.detach(i);
            ctrl.attach_back(i);
        }
    }
}

impl Bcache {
    const fn new() -> Self {
        const SLOT: SleepLock<BufData> = SleepLock::new(BufData::new(), "buffer");
        const FLAG: AtomicBool = AtomicBool::new(false);
        Self {
            ctrl: Mutex::new(Ctrl::new(), "bcache"),
            slots: [SLOT; NBUF],
            in_flight: [FLAG; NBUF],
        }
    }

    pub(crate) fn flight_flag(&self, idx: usize) -> &AtomicBool {
        &self.in_flight[idx]
    }

    // Return a locked Buf holding the contents of block_no.
    pub fn read(&'static self, block_no: u32) -> Buf {
        let mut ctrl = self.ctrl.lock();

        // cached already?
        let hit = ctrl.iter().find(|&i| ctrl.block_no[i] == block_no);
        if let Some(i) = hit {
            ctrl.refcnt[i] += 1;
            ctrl.detach(i);
            ctrl.attach_front(i);
            drop(ctrl);
            let guard = self.slots[i].lock();
            return Buf {
                idx: i,
                guard: Some(guard),
            };
        }

        // not cached: reserve the first reference-free slot. front to
        // back, so the oldest free buffer is recycled.
        let v = ctrl
            .iter()
            .find(|&i| ctrl.refcnt[i] == 0)
            .expect("bcache: no buffers");
        ctrl.refcnt[v] = 1;
        let old_block = ctrl.block_no[v];
        ctrl.block_no[v] = BLOCK_UNUSED; // its old identity is gone
        drop(ctrl);

        let mut guard = self.slots[v].lock();

        // evict: push dirty contents back to their old block.
        if guard.dirty && old_block != BLOCK_UNUSED {
            guard.block_no = old_block;
            virtio_disk::rw(v, &mut guard, true);
            guard.dirty = false;
        }

        // load the new block.
        guard.block_no = block_no;
        virtio_disk::rw(v, &mut guard, false);

        // someone else may have loaded the same block while we slept
        // on the disk. if so, stand down and use theirs.
        let mut ctrl = self.ctrl.lock();
        let racer = ctrl
            .iter()
            .find(|&i| i != v && ctrl.block_no[i] == block_no);
        match racer {
            Some(w) => {
                ctrl.refcnt[v] = 0;
                ctrl.detach(v);
                ctrl.attach_back(v);
                ctrl.refcnt[w] += 1; // cannot be evicted after this
                drop(ctrl);
                drop(guard);
                let wguard = self.slots[w].lock();
                Buf {
                    idx: w,
                    guard: Some(wguard),
                }
            }
            None => {
                ctrl.block_no[v] = block_no;
                ctrl.detach(v);
                ctrl.attach_front(v);
                drop(ctrl);
                Buf {
                    idx: v,
                    guard: Some(guard),
                }
            }
        }
    }
}
