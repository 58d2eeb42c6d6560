//! Virtqueue block device driver.
//!
//! Each request is a three-descriptor chain:
//!
//! 1. **Header** (device-readable, 16 bytes): request type + starting
//!    512-byte sector.
//! 2. **Payload** (device-writable for reads, device-readable for writes):
//!    one 512-byte block.
//! 3. **Status** (device-writable, 1 byte): parked at 0xFF by the driver,
//!    set to OK/IOERR/UNSUPP by the device.
//!
//! The interrupt handler only acknowledges the device and broadcasts the
//! done condition. Reclaim of completed chains happens strictly under the
//! queue lock, and a waiter re-checks its status byte in the same critical
//! section after every wakeup.

#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use alloc::vec::Vec;

use super::{
    features,
    queue::{SplitQueue, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE},
    VirtioMmio, DEFAULT_BASES,
};
use crate::{
    config::{BLKSZ, PAGE_SIZE},
    error::{KernelError, KernelResult},
    fs::blockdev::Storage,
    mm::{PagePool, PAGE_POOL},
    sched::{Condition, Lock},
    sync::OnceLock,
};

/// Request types (virtio-blk).
mod req_type {
    /// Read sectors from the device.
    pub const IN: u32 = 0;
    /// Write sectors to the device.
    pub const OUT: u32 = 1;
}

/// Status byte values. The driver parks PENDING there before submission.
mod blk_status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
    pub const PENDING: u8 = 0xFF;
}

/// Block-device feature bits (virtio-blk).
pub mod blk_features {
    /// Preferred block size is in config space.
    pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
    /// I/O topology hints in config space (advisory).
    pub const VIRTIO_BLK_F_TOPOLOGY: u64 = 1 << 10;
}

/// Queue length requested from the device (clamped to its maximum).
const QUEUE_LEN: u16 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InFlight,
    Complete,
}

/// Per-request record, keyed by the chain's head descriptor index. The
/// owner of a request frees its own triple once it observes completion, so
/// a head index is never reused while its status byte still matters.
#[derive(Clone, Copy)]
struct ReqSlot {
    triple: [u16; 3],
    state: SlotState,
}

impl ReqSlot {
    const FREE: Self = Self {
        triple: [0; 3],
        state: SlotState::Free,
    };
}

struct QueueState {
    queue: SplitQueue,
    slots: Vec<ReqSlot>,
    /// DMA page: `queue.size()` request headers followed by as many status
    /// bytes, both indexed by head descriptor id.
    dma: NonNull<u8>,
}

impl QueueState {
    fn hdr_addr(&self, head: u16) -> usize {
        self.dma.as_ptr() as usize + core::mem::size_of::<BlkReqHeader>() * head as usize
    }

    fn status_addr(&self, head: u16) -> usize {
        self.dma.as_ptr() as usize
            + core::mem::size_of::<BlkReqHeader>() * self.queue.size() as usize
            + head as usize
    }

    fn status(&self, head: u16) -> u8 {
        // SAFETY: status_addr stays inside the driver-owned DMA page.
        unsafe { (self.status_addr(head) as *const u8).read_volatile() }
    }

    /// Walk the used ring in order and mark each returned chain complete.
    /// Runs only under the queue lock.
    fn reclaim(&mut self) {
        while let Some((head, _len)) = self.queue.pop_used() {
            let slot = &mut self.slots[head as usize];
            if slot.state == SlotState::InFlight {
                slot.state = SlotState::Complete;
            } else {
                log::warn!(target: "virtio-blk", "used ring returned idle chain {}", head);
            }
        }
    }
}

/// A virtio block device over MMIO.
pub struct VirtioBlk {
    mmio: VirtioMmio,
    /// Queue lock: descriptor allocation/release and ring updates.
    lock: Lock,
    /// Broadcast by the interrupt handler after acknowledging the device.
    done: Condition,
    state: UnsafeCell<QueueState>,
    capacity_bytes: u64,
    irq_source: u32,
}

// SAFETY: the queue state is mutated only while the queue lock is held; the
// wait predicate performs a read-only status peek with interrupts disabled
// on the single hart.
unsafe impl Send for VirtioBlk {}
// SAFETY: as above.
unsafe impl Sync for VirtioBlk {}

impl VirtioBlk {
    /// Probe and bring up the device behind `base`.
    ///
    /// Needs INDIRECT_DESC and RING_RESET; wants BLK_SIZE and TOPOLOGY. If
    /// a needed feature is refused the device is marked FAILED and left
    /// inert.
    pub fn probe(base: usize, irq_source: u32, pool: &mut PagePool) -> KernelResult<Self> {
        let mmio = VirtioMmio::new(base);
        if !mmio.probe_block() {
            return Err(KernelError::NoEntry);
        }
        mmio.begin_init();

        let offered = mmio.device_features();
        let needed = features::VIRTIO_F_INDIRECT_DESC | features::VIRTIO_F_RING_RESET;
        let wanted = blk_features::VIRTIO_BLK_F_BLK_SIZE | blk_features::VIRTIO_BLK_F_TOPOLOGY;
        if offered & needed != needed {
            mmio.fail();
            return Err(KernelError::NotSupported {
                operation: "required virtio features",
            });
        }
        let mut accepted = needed | (offered & wanted);
        if offered & features::VIRTIO_F_VERSION_1 != 0 {
            accepted |= features::VIRTIO_F_VERSION_1;
        }
        mmio.write_driver_features(accepted);
        if !mmio.set_features_ok() {
            mmio.fail();
            return Err(KernelError::NotSupported {
                operation: "virtio feature negotiation",
            });
        }

        mmio.select_queue(0);
        let max = mmio.queue_num_max();
        if max == 0 {
            mmio.fail();
            return Err(KernelError::Io {
                device: "virtio-blk",
            });
        }
        let qlen = (QUEUE_LEN as u32).min(max) as u16;
        let queue = SplitQueue::new(qlen, pool);
        mmio.set_queue_num(qlen as u32);
        mmio.set_queue_addrs(queue.phys_desc(), queue.phys_avail(), queue.phys_used());
        mmio.set_queue_ready();
        mmio.set_driver_ok();

        let capacity_sectors = mmio.config_u64(0);
        if accepted & blk_features::VIRTIO_BLK_F_BLK_SIZE != 0 {
            log::debug!(
                target: "virtio-blk",
                "device-preferred block size {}",
                mmio.config_u32(20)
            );
        }

        let dma = pool.alloc_pages(1);
        // SAFETY: fresh DMA page, exclusively the driver's.
        unsafe { core::ptr::write_bytes(dma.as_ptr(), 0, PAGE_SIZE) };

        log::info!(
            target: "virtio-blk",
            "device at {:#x}: {} sectors, queue length {}",
            base,
            capacity_sectors,
            qlen
        );

        Ok(Self {
            mmio,
            lock: Lock::new("virtio-blk-queue"),
            done: Condition::new("virtio-blk-done"),
            state: UnsafeCell::new(QueueState {
                queue,
                slots: alloc::vec![ReqSlot::FREE; qlen as usize],
                dma,
            }),
            capacity_bytes: capacity_sectors * BLKSZ as u64,
            irq_source,
        })
    }

    pub fn irq_source(&self) -> u32 {
        self.irq_source
    }

    /// Interrupt path: read the status register, acknowledge exactly the
    /// observed bits, wake the waiters.
    pub fn on_interrupt(&self) {
        let status = self.mmio.interrupt_status();
        if status == 0 {
            return;
        }
        self.mmio.interrupt_ack(status);
        self.done.broadcast();
    }

    /// Submit one 512-byte request and block until its status byte leaves
    /// PENDING and its chain has come back through the used ring.
    fn transfer(&self, sector: u64, buf: *mut u8, write: bool) -> KernelResult<()> {
        self.lock.acquire();
        // SAFETY: queue state is guarded by the queue lock, held here.
        let st = unsafe { &mut *self.state.get() };
        st.reclaim();
        let Some(triple) = st.queue.alloc_triple() else {
            self.lock.release();
            // Short on descriptors: abort, the caller retries.
            return Err(KernelError::Busy {
                resource: "virtqueue descriptors",
            });
        };
        let [head, payload, status] = triple;
        let hdr_addr = st.hdr_addr(head);
        let status_addr = st.status_addr(head);
        // SAFETY: both addresses lie in the driver-owned DMA page, indexed
        // by a descriptor id below the queue length.
        unsafe {
            (hdr_addr as *mut BlkReqHeader).write_volatile(BlkReqHeader {
                type_: if write { req_type::OUT } else { req_type::IN },
                reserved: 0,
                sector,
            });
            (status_addr as *mut u8).write_volatile(blk_status::PENDING);
        }
        st.slots[head as usize] = ReqSlot {
            triple,
            state: SlotState::InFlight,
        };

        let payload_flags = if write {
            VIRTQ_DESC_F_NEXT
        } else {
            // Device writes the payload on reads.
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        };
        st.queue.write_desc(
            head,
            hdr_addr as u64,
            core::mem::size_of::<BlkReqHeader>() as u32,
            VIRTQ_DESC_F_NEXT,
            payload,
        );
        st.queue
            .write_desc(payload, buf as u64, BLKSZ as u32, payload_flags, status);
        st.queue
            .write_desc(status, status_addr as u64, 1, VIRTQ_DESC_F_WRITE, 0);
        st.queue.push_avail(head);
        self.lock.release();
        self.mmio.notify(0);

        loop {
            self.lock.acquire();
            // SAFETY: queue lock held.
            let st = unsafe { &mut *self.state.get() };
            st.reclaim();
            if st.slots[head as usize].state == SlotState::Complete {
                let code = st.status(head);
                st.queue.free_triple(triple);
                st.slots[head as usize] = ReqSlot::FREE;
                self.lock.release();
                return match code {
                    blk_status::OK => Ok(()),
                    blk_status::UNSUPP => Err(KernelError::NotSupported {
                        operation: "virtio-blk request",
                    }),
                    _ => Err(KernelError::Io {
                        device: "virtio-blk",
                    }),
                };
            }
            self.lock.release();
            self.done.wait_if(|| {
                // SAFETY: read-only status peek with interrupts disabled on
                // the single hart.
                let st = unsafe { &*self.state.get() };
                st.status(head) == blk_status::PENDING
            });
        }
    }
}

impl VirtioBlk {
    /// A request that aborted on descriptor shortage is retried after a
    /// yield; every other outcome is final.
    fn transfer_retrying(&self, sector: u64, buf: *mut u8, write: bool) -> KernelResult<()> {
        loop {
            match self.transfer(sector, buf, write) {
                Err(KernelError::Busy { .. }) => crate::sched::yield_now(),
                other => return other,
            }
        }
    }
}

impl Storage for VirtioBlk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn read_block(&self, block: u64, buf: &mut [u8; BLKSZ]) -> KernelResult<()> {
        if (block + 1) * BLKSZ as u64 > self.capacity_bytes {
            return Err(KernelError::InvalidArgument {
                what: "block beyond device capacity",
            });
        }
        self.transfer_retrying(block, buf.as_mut_ptr(), false)
    }

    fn write_block(&self, block: u64, buf: &[u8; BLKSZ]) -> KernelResult<()> {
        if (block + 1) * BLKSZ as u64 > self.capacity_bytes {
            return Err(KernelError::InvalidArgument {
                what: "block beyond device capacity",
            });
        }
        self.transfer_retrying(block, buf.as_ptr() as *mut u8, true)
    }
}

/// The probed boot disk.
static BLOCK_DEV: OnceLock<VirtioBlk> = OnceLock::new();

fn blk_isr(_source: u32, arg: usize) {
    // SAFETY: arg is the address of the static device registered below.
    let dev = unsafe { &*(arg as *const VirtioBlk) };
    dev.on_interrupt();
}

/// Probe the board's virtio-mmio slots and register the first block device.
pub fn init() {
    for (i, &base) in DEFAULT_BASES.iter().enumerate() {
        let source = i as u32 + 1;
        let probed = {
            let mut pool = PAGE_POOL.lock();
            VirtioBlk::probe(base, source, &mut pool)
        };
        match probed {
            Ok(dev) => {
                if BLOCK_DEV.set(dev).is_ok() {
                    let dev = BLOCK_DEV.get().expect("device vanished after set");
                    crate::irq::enable(source, 1, blk_isr, dev as *const VirtioBlk as usize);
                    return;
                }
            }
            Err(_) => continue,
        }
    }
    log::warn!(target: "virtio-blk", "no block device found");
}

/// The boot disk, if one probed.
pub fn device() -> Option<&'static VirtioBlk> {
    BLOCK_DEV.get()
}
