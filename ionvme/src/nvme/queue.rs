//! The NVMe queue pair (component E): SQ/CQ rings, doorbell MMIO,
//! request-slot accounting, PRP assembly, submit/poll/wait.
//!
//! Grounded on the ring/doorbell mechanics in `ktheindifferent`'s
//! `nvme::queue`, the `DoorbellHelper`/`exec_admin` shape in
//! `plos-clan/nvme-rs`, and the request-slot free list pattern used by
//! `ktheindifferent`'s own DMA buffer pool (`driver::dma`), generalized
//! here to a lock-free pool (`crossbeam-queue::ArrayQueue`) instead of a
//! coarse-grained mutex, since §5 specifies "lock-free atomic pop/push
//! on a singly-linked free list".

use std::cell::Cell;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;

use super::command::{Command, Completion};
use crate::error::{Error, Result};
use crate::iommu::IommuContext;

const SLOT_FREE: u8 = 0;
const SLOT_OWNED: u8 = 1;
const SLOT_INFLIGHT: u8 = 2;
const SLOT_ORPHANED: u8 = 3;

/// A DMA-visible buffer this crate owns end to end: mmap'd host memory,
/// sticky-mapped through the IOMMU context for the lifetime of the
/// queue pair that allocated it.
struct OwnedDma {
    ctx: Arc<IommuContext>,
    vaddr: *mut u8,
    len: usize,
    iova: u64,
}

// SAFETY: the raw pointer is mmap'd memory uniquely owned by this
// struct; access to its contents is synchronized by the queue pair's
// own locks, not by this wrapper.
unsafe impl Send for OwnedDma {}
unsafe impl Sync for OwnedDma {}

impl OwnedDma {
    fn alloc(ctx: Arc<IommuContext>, len: usize) -> Result<Self> {
        let page_len = ctx.runtime().page_round_up(len);
        let vaddr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(page_len).ok_or(Error::Invalid("len must be > 0"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| Error::Backend(std::io::Error::from(e)))?
        .as_ptr() as *mut u8;

        let iova = ctx.map(vaddr as u64, page_len as u64)?;
        Ok(OwnedDma { ctx, vaddr, len: page_len, iova })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.vaddr
    }
}

impl Drop for OwnedDma {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.unmap(self.vaddr as u64) {
            warn!("failed to unmap DMA buffer at drop: {e}");
        }
        unsafe {
            let _ = munmap(std::ptr::NonNull::new_unchecked(self.vaddr as *mut _), self.len);
        }
    }
}

/// Write-only MMIO doorbell register.
struct Doorbell {
    addr: *mut u32,
}

// SAFETY: doorbells are distinct, non-overlapping offsets into the
// controller's BAR; each one is owned by exactly one ring.
unsafe impl Send for Doorbell {}
unsafe impl Sync for Doorbell {}

impl Doorbell {
    fn ring(&self, value: u32) {
        unsafe { std::ptr::write_volatile(self.addr, value) }
    }
}

struct RequestSlot {
    cid: u16,
    status: AtomicU8,
    user: Cell<usize>,
    prp_list: OwnedDma,
    prp_list_capacity: usize,
}

// SAFETY: `user` is only touched by the thread that currently holds
// the slot, established by the free-list hand-off in `RequestPool`
// (an `ArrayQueue` pop/push pair acts as the synchronization edge).
unsafe impl Sync for RequestSlot {}

/// A handle to an acquired request slot. Cheap to copy; the real state
/// lives in the queue pair's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RqHandle {
    index: u16,
}

impl RqHandle {
    pub fn cid(&self) -> u16 {
        self.index
    }
}

struct RequestPool {
    slots: Vec<RequestSlot>,
    free: ArrayQueue<u16>,
}

impl RequestPool {
    fn new(ctx: Arc<IommuContext>, sq_depth: u16) -> Result<Self> {
        let capacity = (sq_depth - 1) as usize;
        let free = ArrayQueue::new(capacity);
        let mut slots = Vec::with_capacity(capacity);
        let page_size = ctx.runtime().page_size();
        for cid in 0..capacity as u16 {
            let prp_list = OwnedDma::alloc(ctx.clone(), page_size)?;
            slots.push(RequestSlot {
                cid,
                status: AtomicU8::new(SLOT_FREE),
                user: Cell::new(0),
                prp_list,
                prp_list_capacity: page_size / std::mem::size_of::<u64>(),
            });
            free.push(cid).expect("capacity sized to slot count");
        }
        Ok(RequestPool { slots, free })
    }

    fn acquire(&self) -> Option<RqHandle> {
        let index = self.free.pop()?;
        self.slots[index as usize].status.store(SLOT_OWNED, Ordering::Release);
        Some(RqHandle { index })
    }

    fn release(&self, handle: RqHandle) {
        let slot = &self.slots[handle.index as usize];
        slot.status.store(SLOT_FREE, Ordering::Release);
        self.free.push(handle.index).expect("slot count matches pool capacity");
    }
}

struct CqState {
    head: u16,
    phase: bool,
}

/// Submission queue + completion queue + request-slot pool for one
/// queue ID. See module docs for the grounding.
pub struct NvmeQueuePair {
    qid: u16,
    sq_depth: u16,
    cq_depth: u16,
    sq_ring: OwnedDma,
    cq_ring: OwnedDma,
    sq_tail: Mutex<u16>,
    cq: Mutex<CqState>,
    sq_db: Doorbell,
    cq_db: Doorbell,
    rq_pool: RequestPool,
}

impl NvmeQueuePair {
    /// `mmio_base` is the controller's BAR0 base address, `dstrd` the
    /// Doorbell Stride field read from the Controller Capabilities
    /// register.
    pub fn new(
        ctx: Arc<IommuContext>,
        qid: u16,
        sq_depth: u16,
        cq_depth: u16,
        mmio_base: *mut u8,
        dstrd: u8,
    ) -> Result<Self> {
        if sq_depth < 2 || cq_depth < 2 {
            return Err(Error::Invalid("queue depth must be >= 2"));
        }
        let sq_ring = OwnedDma::alloc(ctx.clone(), sq_depth as usize * std::mem::size_of::<Command>())?;
        let cq_ring = OwnedDma::alloc(ctx.clone(), cq_depth as usize * std::mem::size_of::<Completion>())?;
        let rq_pool = RequestPool::new(ctx, sq_depth)?;

        let sq_db = Doorbell {
            addr: unsafe { mmio_base.add(super::regs::sq_doorbell_offset(qid, dstrd)) as *mut u32 },
        };
        let cq_db = Doorbell {
            addr: unsafe { mmio_base.add(super::regs::cq_doorbell_offset(qid, dstrd)) as *mut u32 },
        };

        Ok(NvmeQueuePair {
            qid,
            sq_depth,
            cq_depth,
            sq_ring,
            cq_ring,
            sq_tail: Mutex::new(0),
            cq: Mutex::new(CqState { head: 0, phase: true }),
            sq_db,
            cq_db,
            rq_pool,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn sq_ring_iova(&self) -> u64 {
        self.sq_ring.iova
    }

    pub fn cq_ring_iova(&self) -> u64 {
        self.cq_ring.iova
    }

    fn sq_slot_ptr(&self, index: u16) -> *mut Command {
        unsafe { (self.sq_ring.as_ptr() as *mut Command).add(index as usize) }
    }

    fn cq_slot_ptr(&self, index: u16) -> *const Completion {
        unsafe { (self.cq_ring.as_ptr() as *const Completion).add(index as usize) }
    }

    /// Pop a free slot. Fails with [`Error::Busy`] immediately rather
    /// than blocking; `acquire_rq_wait` spins until one frees up.
    pub fn acquire_rq(&self) -> Result<RqHandle> {
        self.rq_pool.acquire().ok_or(Error::Busy)
    }

    pub fn acquire_rq_wait(&self, timeout: Duration) -> Result<RqHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(h) = self.rq_pool.acquire() {
                return Ok(h);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::hint::spin_loop();
        }
    }

    /// Stash an opaque caller-supplied pointer alongside a slot, valid
    /// for the lifetime of the OWNED/INFLIGHT/ORPHANED states.
    pub fn set_user_data(&self, handle: RqHandle, value: usize) {
        self.rq_pool.slots[handle.index as usize].user.set(value);
    }

    pub fn user_data(&self, handle: RqHandle) -> usize {
        self.rq_pool.slots[handle.index as usize].user.get()
    }

    /// Write the PRP1/PRP2 fields of `cmd` so the device can DMA `len`
    /// bytes starting at `iova`. See §4.E for the three size regimes.
    pub fn map_prp(&self, handle: RqHandle, cmd: &mut Command, iova: u64, len: usize, page_shift: u32) -> Result<()> {
        let page_size = 1usize << page_shift;
        cmd.prp1 = iova;

        if len <= page_size {
            cmd.prp2 = 0;
            return Ok(());
        }
        if len <= 2 * page_size {
            cmd.prp2 = iova + page_size as u64;
            return Ok(());
        }

        let slot = &self.rq_pool.slots[handle.index as usize];
        let remaining = len - page_size;
        let pages_needed = remaining.div_ceil(page_size);
        if pages_needed > slot.prp_list_capacity {
            return Err(Error::Invalid("transfer too large for PRP list buffer"));
        }

        let list_ptr = slot.prp_list.as_ptr() as *mut u64;
        let mut page_iova = iova + page_size as u64;
        for i in 0..pages_needed {
            unsafe { std::ptr::write_volatile(list_ptr.add(i), page_iova) };
            page_iova += page_size as u64;
        }
        cmd.prp2 = slot.prp_list.iova;
        Ok(())
    }

    /// Stamp `cmd.cid`, write it into the SQ ring, and ring the SQ
    /// doorbell. A release barrier precedes the doorbell write so the
    /// device never observes a partially populated SQE.
    pub fn submit(&self, handle: RqHandle, mut cmd: Command) -> Result<()> {
        cmd.cid = handle.cid();
        self.rq_pool.slots[handle.index as usize]
            .status
            .store(SLOT_INFLIGHT, Ordering::Release);

        let mut tail = self.sq_tail.lock();
        let slot_ptr = self.sq_slot_ptr(*tail);
        unsafe { std::ptr::write_volatile(slot_ptr, cmd) };

        *tail = (*tail + 1) % self.sq_depth;
        std::sync::atomic::fence(Ordering::Release);
        self.sq_db.ring(*tail as u32);
        Ok(())
    }

    /// Read one CQE if the phase bit matches; returns `None` on an
    /// empty queue without touching the doorbell.
    pub fn poll_one(&self) -> Option<Completion> {
        let mut cq = self.cq.lock();
        let entry = unsafe { std::ptr::read_volatile(self.cq_slot_ptr(cq.head)) };
        if entry.phase() != cq.phase {
            return None;
        }
        std::sync::atomic::fence(Ordering::Acquire);

        cq.head = (cq.head + 1) % self.cq_depth;
        if cq.head == 0 {
            cq.phase = !cq.phase;
        }
        self.cq_db.ring(cq.head as u32);
        Some(entry)
    }

    /// Drain the next CQE if it belongs to a currently ORPHANED slot
    /// (an AER, or a command `wait_one` already timed out on), freeing
    /// that slot and returning its handle alongside the completion.
    /// Returns `None` on an empty queue, or when the next CQE belongs
    /// to a slot that is not ORPHANED (logged as spurious, the same
    /// policy `wait_one` applies to a cid mismatch).
    pub fn poll_orphaned(&self) -> Option<(RqHandle, Completion)> {
        let entry = self.poll_one()?;
        let slot = &self.rq_pool.slots[entry.cid as usize];
        if slot.status.load(Ordering::Acquire) == SLOT_ORPHANED {
            slot.status.store(SLOT_FREE, Ordering::Release);
            self.rq_pool.free.push(entry.cid).ok();
            Some((RqHandle { index: entry.cid }, entry))
        } else {
            warn!("spurious completion while polling for orphaned slots: cid={}", entry.cid);
            None
        }
    }

    /// Spin on [`NvmeQueuePair::poll_one`] until the CQE matching
    /// `handle` arrives or `timeout` elapses. A completion whose cid
    /// belongs to an already-ORPHANED slot is drained and released; any
    /// other mismatch is logged and treated as spurious, per the design
    /// notes' caveat.
    pub fn wait_one(&self, handle: RqHandle, timeout: Duration) -> Result<Completion> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.poll_one() {
                if entry.cid == handle.cid() {
                    self.rq_pool.release(handle);
                    if entry.is_error() {
                        return Err(Error::Device { status: entry.status_field() });
                    }
                    return Ok(entry);
                }

                let other = &self.rq_pool.slots[entry.cid as usize];
                if other.status.load(Ordering::Acquire) == SLOT_ORPHANED {
                    debug!("draining orphaned completion for cid={}", entry.cid);
                    other.status.store(SLOT_FREE, Ordering::Release);
                    self.rq_pool.free.push(entry.cid).ok();
                } else {
                    warn!(
                        "spurious completion: waiting on cid={} but observed cid={}",
                        handle.cid(),
                        entry.cid
                    );
                }
            }
            if Instant::now() >= deadline {
                self.rq_pool.slots[handle.index as usize].status.store(SLOT_ORPHANED, Ordering::Release);
                return Err(Error::Timeout);
            }
            std::hint::spin_loop();
        }
    }

    /// Submit an Asynchronous Event Request whose slot remains
    /// indefinitely in flight. The matching CQE is drained by
    /// [`NvmeQueuePair::poll_orphaned`], called from
    /// [`crate::nvme::controller::NvmeControllerSession::dispatch_events`],
    /// rather than `wait_one`, since there is no deadline.
    pub fn submit_aer(&self, handle: RqHandle) -> Result<()> {
        let cmd = Command::new(super::regs::admin_opcode::ASYNC_EVENT_REQUEST);
        self.submit(handle, cmd)?;
        self.rq_pool.slots[handle.index as usize].status.store(SLOT_ORPHANED, Ordering::Release);
        Ok(())
    }

    /// True when every slot is FREE, i.e. the pair can be safely torn
    /// down. Closing with ORPHANED slots outstanding is a caller error
    /// (§5): the caller must reset the controller first.
    pub fn is_quiescent(&self) -> bool {
        self.rq_pool.slots.iter().all(|s| s.status.load(Ordering::Acquire) == SLOT_FREE)
    }

    pub fn close(self) -> Result<()> {
        if !self.is_quiescent() {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::backend::NullBackend;
    use crate::iova::IovaRange;
    use crate::runtime::Runtime;

    fn test_ctx() -> Arc<IommuContext> {
        let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fffffffff }]));
        Arc::new(IommuContext::init(Runtime::with_page_size(4096), backend).unwrap())
    }

    fn fake_bar() -> *mut u8 {
        // A queue pair only ever writes to computed doorbell offsets;
        // a page of anonymous memory is a safe stand-in for a real BAR
        // in tests that never touch real hardware.
        unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(0x2000).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .unwrap()
            .as_ptr() as *mut u8
        }
    }

    #[test]
    fn acquire_exhausts_at_depth_minus_one() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(qp.acquire_rq().unwrap());
        }
        assert!(matches!(qp.acquire_rq(), Err(Error::Busy)));

        qp.rq_pool.release(handles.pop().unwrap());
        assert!(qp.acquire_rq().is_ok());
    }

    #[test]
    fn poll_empty_queue_returns_none_and_does_not_ring_doorbell() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        assert!(qp.poll_one().is_none());
    }

    #[test]
    fn submit_then_manually_posted_completion_matches_cid() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let handle = qp.acquire_rq().unwrap();
        let cmd = Command::new(super::super::regs::admin_opcode::IDENTIFY);
        qp.submit(handle, cmd).unwrap();

        // Hardware isn't present in this test; post a completion by
        // hand to exercise the phase/cid matching logic in wait_one.
        let cqe = Completion { cid: handle.cid(), status: 0b1, ..Default::default() };
        unsafe { std::ptr::write_volatile(qp.cq_slot_ptr(0) as *mut Completion, cqe) };

        let got = qp.wait_one(handle, Duration::from_millis(10)).unwrap();
        assert_eq!(got.cid, handle.cid());
        assert!(qp.is_quiescent());
    }

    #[test]
    fn wait_one_zero_timeout_with_no_cqe_times_out_immediately() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let handle = qp.acquire_rq().unwrap();
        let cmd = Command::new(super::super::regs::admin_opcode::IDENTIFY);
        qp.submit(handle, cmd).unwrap();
        let res = qp.wait_one(handle, Duration::from_nanos(0));
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[test]
    fn map_prp_single_page() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let handle = qp.acquire_rq().unwrap();
        let mut cmd = Command::new(0);
        qp.map_prp(handle, &mut cmd, 0x20000, 4096, 12).unwrap();
        assert_eq!(cmd.prp1, 0x20000);
        assert_eq!(cmd.prp2, 0);
    }

    #[test]
    fn map_prp_two_pages() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let handle = qp.acquire_rq().unwrap();
        let mut cmd = Command::new(0);
        qp.map_prp(handle, &mut cmd, 0x20000, 8192, 12).unwrap();
        assert_eq!(cmd.prp1, 0x20000);
        assert_eq!(cmd.prp2, 0x21000);
    }

    #[test]
    fn map_prp_uses_prp_list_for_large_transfers() {
        let qp = NvmeQueuePair::new(test_ctx(), 0, 4, 4, fake_bar(), 0).unwrap();
        let handle = qp.acquire_rq().unwrap();
        let mut cmd = Command::new(0);
        qp.map_prp(handle, &mut cmd, 0x20000, 3 * 4096, 12).unwrap();
        assert_eq!(cmd.prp1, 0x20000);
        assert_ne!(cmd.prp2, 0);
        assert_ne!(cmd.prp2, 0x21000);
    }
}
