// Driver for qemu's virtio disk device, using the legacy mmio
// interface.
//
// qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0

use crate::bio::{BufData, BCACHE};
use crate::fs::BLOCK_SIZE;
use crate::memlayout::VIRTIO0;
use crate::proc::{CPUS, PROCS};
use crate::riscv::PGSHIFT;
use crate::spinlock::Mutex;
use bitflags::bitflags;
use core::sync::atomic::{fence, Ordering};

pub static DISK: Mutex<Disk> = Mutex::new(Disk::new(), "virtio_disk");

// memory mapped control registers.
#[repr(usize)]
enum Mmio {
    MagicValue = 0x000, // 0x74726976
    Version = 0x004,    // 1 is legacy
    DeviceId = 0x008,   // 1 is net, 2 is disk
    VendorId = 0x00c,   // 0x554d4551
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    GuestPageSize = 0x028, // page size for PFN, write-only
    QueueSel = 0x030,      // select queue, write-only
    QueueNumMax = 0x034,   // max size of current queue, read-only
    QueueNum = 0x038,      // size of current queue, write-only
    QueuePfn = 0x040,      // physical page number of queue, read/write
    QueueNotify = 0x050,   // write-only
    InterruptStatus = 0x060, // read-only
    InterruptAck = 0x064,  // write-only
    Status = 0x070,        // read/write
}

impl Mmio {
    fn read(self) -> u32 {
        unsafe { core::ptr::read_volatile((VIRTIO0 + self as usize) as *const u32) }
    }
    unsafe fn write(self, data: u32) {
        core::ptr::write_volatile((VIRTIO0 + self as usize) as *mut u32, data);
    }
}

bitflags! {
    // status register bits, from qemu virtio_config.h
    struct VirtioStatus: u32 {
        const ACKNOWLEDGE = 0b0001;
        const DRIVER = 0b0010;
        const DRIVER_OK = 0b0100;
        const FEATURES_OK = 0b1000;
    }
}

bitflags! {
    // device feature bits
    struct VirtioFeatures: u32 {
        const BLK_F_RO = 1 << 5;
        const BLK_F_SCSI = 1 << 7;
        const BLK_F_CONFIG_WCE = 1 << 11;
        const BLK_F_MQ = 1 << 12;
        const F_ANY_LAYOUT = 1 << 27;
        const RING_F_INDIRECT_DESC = 1 << 28;
        const RING_F_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    struct VirtqDescFlags: u16 {
        const FREED = 0b00;
        // chained with another descriptor
        const NEXT = 0b01;
        // device writes (vs reads)
        const WRITE = 0b10;
    }
}

// this many virtio descriptors. must be a power of two.
const NUM: usize = 8;

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

// a single DMA descriptor, from the spec.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: VirtqDescFlags,
    next: u16,
}

impl VirtqDesc {
    const fn new() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: VirtqDescFlags::FREED,
            next: 0,
        }
    }
}

// the ring in which the driver writes descriptor numbers that it wants
// the device to process.
#[derive(Clone, Copy)]
#[repr(C, align(2))]
struct VirtqAvail {
    flags: u16,       // always zero
    idx: u16,         // driver writes ring[idx % NUM] next
    ring: [u16; NUM], // chain heads
    unused: u16,
}

// one entry of the ring in which the device reports completions.
#[derive(Clone, Copy)]
#[repr(C)]
struct VirtqUsedElem {
    id: u32, // index of the completed chain's head descriptor
    len: u32,
}

#[derive(Clone, Copy)]
#[repr(C, align(4))]
struct VirtqUsed {
    flags: u16, // always zero
    idx: u16,   // device increments as it adds entries
    ring: [VirtqUsedElem; NUM],
}

// the header of a block request; two more descriptors follow with the
// data and a one-byte status.
#[derive(Clone, Copy)]
#[repr(C)]
struct VirtioBlkReq {
    type_: u32,
    reserved: u32,
    sector: u64,
}

// in-flight bookkeeping, indexed by head descriptor.
#[derive(Clone, Copy)]
struct Info {
    buf_idx: usize,
    status: u8,
    pending: bool,
}

// a page of page-aligned padding, to satisfy the legacy layout's
// "descriptors+avail in one page, used ring in the next" rule.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct PagePad;

#[repr(C, align(4096))]
pub struct Disk {
    pad1: PagePad,
    desc: [VirtqDesc; NUM],
    avail: VirtqAvail,
    pad2: PagePad,
    used: VirtqUsed,
    pad3: PagePad,

    free: [bool; NUM], // is the descriptor free?
    used_idx: u16,     // how far we have looked in used.ring
    info: [Info; NUM],
    ops: [VirtioBlkReq; NUM],
}

impl Disk {
    const fn new() -> Self {
        Self {
            pad1: PagePad,
            desc: [VirtqDesc::new(); NUM],
            avail: VirtqAvail {
                flags: 0,
                idx: 0,
                ring: [0; NUM],
                unused: 0,
            },
            pad2: PagePad,
            used: VirtqUsed {
                flags: 0,
                idx: 0,
                ring: [VirtqUsedElem { id: 0, len: 0 }; NUM],
            },
            pad3: PagePad,
            free: [false; NUM],
            used_idx: 0,
            info: [Info {
                buf_idx: 0,
                status: 0,
                pending: false,
            }; NUM],
            ops: [VirtioBlkReq {
                type_: 0,
                reserved: 0,
                sector: 0,
            }; NUM],
        }
    }

    unsafe fn setup(&mut self) {
        if Mmio::MagicValue.read() != 0x7472_6976
            || Mmio::Version.read() != 1
            || Mmio::DeviceId.read() != 2
            || Mmio::VendorId.read() != 0x554d_4551
        {
            panic!("could not find virtio disk");
        }

        let mut status = VirtioStatus::empty();
        status.insert(VirtioStatus::ACKNOWLEDGE);
        Mmio::Status.write(status.bits());
        status.insert(VirtioStatus::DRIVER);
        Mmio::Status.write(status.bits());

        // negotiate features.
        let features = VirtioFeatures::from_bits_truncate(Mmio::DeviceFeatures.read())
            - (VirtioFeatures::BLK_F_RO
                | VirtioFeatures::BLK_F_SCSI
                | VirtioFeatures::BLK_F_CONFIG_WCE
                | VirtioFeatures::BLK_F_MQ
                | VirtioFeatures::F_ANY_LAYOUT
                | VirtioFeatures::RING_F_EVENT_IDX
                | VirtioFeatures::RING_F_INDIRECT_DESC);
        Mmio::DriverFeatures.write(features.bits());

        status.insert(VirtioStatus::FEATURES_OK);
        Mmio::Status.write(status.bits());
        status.insert(VirtioStatus::DRIVER_OK);
        Mmio::Status.write(status.bits());

        Mmio::GuestPageSize.write(crate::riscv::PGSIZE as u32);

        // initialize queue 0.
        Mmio::QueueSel.write(0);
        let max = Mmio::QueueNumMax.read();
        assert!(max != 0, "virtio disk has no queue 0");
        assert!(max >= NUM as u32, "virtio disk max queue too short");
        Mmio::QueueNum.write(NUM as u32);
        Mmio::QueuePfn.write((self as *const Disk as usize >> PGSHIFT) as u32);

        for f in self.free.iter_mut() {
            *f = true;
        }
        // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
    }

    fn alloc_desc(&mut self) -> Option<usize> {
        for (i, f) in self.free.iter_mut().enumerate() {
            if *f {
                *f = false;
                return Some(i);
            }
        }
        None
    }

    fn free_desc(&mut self, i: usize) {
        assert!(i < NUM && !self.free[i], "free_desc");
        self.desc[i] = VirtqDesc::new();
        self.free[i] = true;
        PROCS.wakeup(&self.free[0] as *const _ as usize);
    }

    fn free_chain(&mut self, mut i: usize) {
        loop {
            let flags = self.desc[i].flags;
            let next = self.desc[i].next;
            self.free_desc(i);
            if flags.contains(VirtqDescFlags::NEXT) {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    // three descriptors, or None (caller sleeps and retries).
    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut idx = [0; 3];
        for n in 0..3 {
            match self.alloc_desc() {
                Some(i) => idx[n] = i,
                None => {
                    for &i in idx.iter().take(n) {
                        self.free_desc(i);
                    }
                    return None;
                }
            }
        }
        Some(idx)
    }
}

// Read or write one cache slot's block, sleeping until the device
// reports completion. Caller holds the slot's sleep lock; idx names
// the slot for the completion interrupt.
pub fn rw(idx: usize, b: &mut BufData, write: bool) {
    let sector = b.block_no as u64 * (BLOCK_SIZE / 512) as u64;
    let p = CPUS.my_proc().unwrap();

    let mut disk = DISK.lock();

    // the legacy spec wants three descriptors per block operation:
    // header, data, one-byte status.
    let idx3 = loop {
        match disk.alloc3_desc() {
            Some(idx3) => break idx3,
            None => {
                let chan = &disk.free[0] as *const _ as usize;
                disk = p.sleep(chan, disk);
            }
        }
    };
    let [h, d, s] = idx3;

    disk.ops[h] = VirtioBlkReq {
        type_: if write {
            VIRTIO_BLK_T_OUT
        } else {
            VIRTIO_BLK_T_IN
        },
        reserved: 0,
        sector,
    };

    let hdr_addr = &disk.ops[h] as *const _ as u64;
    disk.desc[h] = VirtqDesc {
        addr: hdr_addr,
        len: core::mem::size_of::<VirtioBlkReq>() as u32,
        flags: VirtqDescFlags::NEXT,
        next: d as u16,
    };
    disk.desc[d] = VirtqDesc {
        addr: b.data.as_ptr() as u64,
        len: BLOCK_SIZE as u32,
        flags: if write {
            VirtqDescFlags::NEXT // device reads b.data
        } else {
            VirtqDescFlags::NEXT | VirtqDescFlags::WRITE // device writes b.data
        },
        next: s as u16,
    };
    disk.info[h].status = 0xff; // device writes 0 on success
    let status_addr = &disk.info[h].status as *const _ as u64;
    disk.desc[s] = VirtqDesc {
        addr: status_addr,
        len: 1,
        flags: VirtqDescFlags::WRITE,
        next: 0,
    };

    // record the request for intr().
    disk.info[h].buf_idx = idx;
    disk.info[h].pending = true;
    BCACHE
        .flight_flag(idx)
        .store(true, Ordering::Release);

    // tell the device about our chain and kick it.
    let slot = disk.avail.idx as usize % NUM;
    disk.avail.ring[slot] = h as u16;
    fence(Ordering::SeqCst);
    disk.avail.idx = disk.avail.idx.wrapping_add(1);
    fence(Ordering::SeqCst);
    unsafe { Mmio::QueueNotify.write(0) }; // value is queue number

    // wait for intr() to say the request has finished.
    let chan = BCACHE.flight_flag(idx) as *const _ as usize;
    while BCACHE.flight_flag(idx).load(Ordering::Acquire) {
        disk = p.sleep(chan, disk);
    }

    disk.info[h].pending = false;
    disk.free_chain(h);
}

// The device finished one or more requests.
pub fn intr() {
    let mut disk = DISK.lock();

    // ack, so the device can raise the next interrupt. this may race
    // with the device appending used-ring entries; processing them in
    // this call instead of the next is harmless.
    let intr_stat = Mmio::InterruptStatus.read();
    unsafe { Mmio::InterruptAck.write(intr_stat & 0x3) };

    fence(Ordering::SeqCst);

    while disk.used_idx != disk.used.idx {
        fence(Ordering::SeqCst);
        let id = disk.used.ring[disk.used_idx as usize % NUM].id as usize;

        assert!(disk.info[id].status == 0, "virtio disk request failed");
        assert!(disk.info[id].pending, "virtio completion for idle slot");

        let buf_idx = disk.info[id].buf_idx;
        let flag = BCACHE.flight_flag(buf_idx);
        flag.store(false, Ordering::Release);
        PROCS.wakeup(flag as *const _ as usize);

        disk.used_idx = disk.used_idx.wrapping_add(1);
    }
}

pub fn init() {
    unsafe { DISK.get_mut().setup() };
}
