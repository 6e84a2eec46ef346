//! The NVMe controller session (component F): admin queue bring-up,
//! the one-shot `admin()` helper, Identify parsing, and I/O queue pair
//! lifecycle. Grounded on `ktheindifferent`'s `nvme::controller`
//! (register bring-up sequence, `identify` flow) and `plos-clan/nvme-rs`'s
//! `exec_admin` one-shot pattern.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;

use super::command::{self, Command, Completion};
use super::queue::{NvmeQueuePair, RqHandle};
use super::regs;
use crate::error::{Error, Result};
use crate::iommu::IommuContext;

const ADMIN_QID: u16 = 0;
const ADMIN_SQ_DEPTH: u16 = 64;
const ADMIN_CQ_DEPTH: u16 = 64;
const ADMIN_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Parsed subset of the 4096-byte Identify Controller data structure.
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    /// Maximum data transfer size, in bytes; `None` when MDTS is 0
    /// ("no restriction").
    pub max_transfer_bytes: Option<u32>,
}

/// Block geometry of one attached namespace, populated from Identify
/// Namespace. Metadata only; see §3's non-goal on block I/O.
#[derive(Debug, Clone, Copy)]
pub struct NvmeNamespace {
    pub nsid: u32,
    pub block_count: u64,
    pub block_size: u32,
}

fn read32(mmio: *const u8, offset: usize) -> u32 {
    unsafe { std::ptr::read_volatile(mmio.add(offset) as *const u32) }
}

fn read64(mmio: *const u8, offset: usize) -> u64 {
    unsafe { std::ptr::read_volatile(mmio.add(offset) as *const u64) }
}

fn write32(mmio: *mut u8, offset: usize, value: u32) {
    unsafe { std::ptr::write_volatile(mmio.add(offset) as *mut u32, value) }
}

fn write64(mmio: *mut u8, offset: usize, value: u64) {
    unsafe { std::ptr::write_volatile(mmio.add(offset) as *mut u64, value) }
}

fn ascii_field(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).trim_end().to_string()
}

/// A host page mapped into the device's IOVA space for the lifetime of
/// one admin transfer. Not slot-local like a queue pair's PRP list
/// buffer, since Identify/Get-Log-Page buffers outlive any one slot.
struct ScratchBuffer<'a> {
    ctx: &'a IommuContext,
    vaddr: *mut u8,
    len: usize,
    iova: u64,
}

impl<'a> ScratchBuffer<'a> {
    fn alloc(ctx: &'a IommuContext, len: usize) -> Result<Self> {
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
        let iova = ctx.map_ephemeral(vaddr as u64, page_len as u64)?;
        Ok(ScratchBuffer { ctx, vaddr, len: page_len, iova })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.vaddr, self.len) }
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.unmap_ephemeral(self.iova, self.len as u64) {
            warn!("failed to unmap scratch buffer at drop: {e}");
        }
        unsafe {
            let _ = munmap(std::ptr::NonNull::new_unchecked(self.vaddr as *mut _), self.len);
        }
    }
}

/// A caller-supplied handler invoked once with an AER completion's
/// opaque result payload (the CQE's `result` field).
type AerHandler = Box<dyn FnOnce(u32) + Send>;

/// One bring-up, one admin queue, zero or more I/O queue pairs.
pub struct NvmeControllerSession {
    ctx: Arc<IommuContext>,
    mmio: *mut u8,
    dstrd: u8,
    mps_shift: u32,
    admin_qp: NvmeQueuePair,
    io_qps: Vec<NvmeQueuePair>,
    /// Handlers registered by `aer`, keyed by the cid of the slot the
    /// request was submitted on; drained by `dispatch_events`.
    aer_handlers: Mutex<HashMap<u16, AerHandler>>,
}

// SAFETY: `mmio` is a BAR mapping owned exclusively by this session;
// every access goes through volatile reads/writes that do not alias
// Rust-level references, and concurrent admin submissions are
// serialized by the admin queue pair's own locks.
unsafe impl Send for NvmeControllerSession {}
unsafe impl Sync for NvmeControllerSession {}

impl NvmeControllerSession {
    /// Reset the controller (if enabled), bring up the admin queue at
    /// the documented depth, and enable it. `mmio` must be a valid
    /// mapping of the controller's BAR0/BAR1 covering at least the
    /// admin registers and one doorbell pair.
    pub fn init(ctx: Arc<IommuContext>, mmio: *mut u8) -> Result<Self> {
        let cap = read64(mmio, regs::CAP);
        let dstrd = regs::doorbell_stride(cap);
        let mps_shift = regs::min_page_shift(cap);
        let max_entries = regs::max_queue_entries(cap);
        if ADMIN_SQ_DEPTH > max_entries || ADMIN_CQ_DEPTH > max_entries {
            return Err(Error::Invalid("controller does not support the requested admin queue depth"));
        }

        Self::disable(mmio)?;

        let admin_qp = NvmeQueuePair::new(ctx.clone(), ADMIN_QID, ADMIN_SQ_DEPTH, ADMIN_CQ_DEPTH, mmio, dstrd)?;

        write32(mmio, regs::AQA, ((ADMIN_CQ_DEPTH - 1) as u32) << 16 | (ADMIN_SQ_DEPTH - 1) as u32);
        write64(mmio, regs::ASQ, admin_qp.sq_ring_iova());
        write64(mmio, regs::ACQ, admin_qp.cq_ring_iova());

        let cc = regs::CC_EN
            | regs::CC_CSS_NVM
            | ((mps_shift - 12) << regs::CC_MPS_SHIFT)
            | regs::CC_AMS_RR
            | (6 << regs::CC_IOSQES_SHIFT)
            | (4 << regs::CC_IOCQES_SHIFT);
        write32(mmio, regs::CC, cc);

        Self::wait_ready(mmio, true)?;
        info!("controller enabled: dstrd={dstrd} mps_shift={mps_shift}");

        Ok(NvmeControllerSession {
            ctx,
            mmio,
            dstrd,
            mps_shift,
            admin_qp,
            io_qps: Vec::new(),
            aer_handlers: Mutex::new(HashMap::new()),
        })
    }

    fn disable(mmio: *mut u8) -> Result<()> {
        let csts = read32(mmio, regs::CSTS);
        if csts & regs::CSTS_RDY == 0 {
            return Ok(());
        }
        let cc = read32(mmio, regs::CC);
        write32(mmio, regs::CC, cc & !regs::CC_EN);
        Self::wait_ready(mmio, false)
    }

    fn wait_ready(mmio: *mut u8, want: bool) -> Result<()> {
        let deadline = std::time::Instant::now() + READY_POLL_TIMEOUT;
        loop {
            let csts = read32(mmio, regs::CSTS);
            if csts & regs::CSTS_CFS != 0 {
                return Err(Error::Device { status: 0xffff });
            }
            if (csts & regs::CSTS_RDY != 0) == want {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::yield_now();
        }
    }

    pub fn mps_shift(&self) -> u32 {
        self.mps_shift
    }

    /// Submit one admin command and block for its completion.
    /// `transfer` is an optional `(buffer_ptr, len)` the command reads
    /// from or writes into; PRP1/PRP2 are filled in automatically.
    pub fn admin(&self, mut cmd: Command, transfer: Option<(u64, usize)>) -> Result<Completion> {
        let handle = self.admin_qp.acquire_rq_wait(ADMIN_TIMEOUT)?;
        if let Some((iova, len)) = transfer {
            self.admin_qp.map_prp(handle, &mut cmd, iova, len, self.mps_shift)?;
        }
        self.admin_qp.submit(handle, cmd)?;
        self.admin_qp.wait_one(handle, ADMIN_TIMEOUT)
    }

    /// Submit an Asynchronous Event Request. The slot is ORPHANED by
    /// design until the controller reports an event or the session is
    /// torn down; see [`NvmeQueuePair::submit_aer`]. `handler` runs
    /// once, from inside [`NvmeControllerSession::dispatch_events`],
    /// with the eventual CQE's opaque `result` payload.
    pub fn aer(&self, handler: impl FnOnce(u32) + Send + 'static) -> Result<RqHandle> {
        let handle = self.admin_qp.acquire_rq()?;
        self.aer_handlers.lock().insert(handle.cid(), Box::new(handler));
        if let Err(e) = self.admin_qp.submit_aer(handle) {
            self.aer_handlers.lock().remove(&handle.cid());
            return Err(e);
        }
        Ok(handle)
    }

    /// Drain every currently posted AER completion on the admin queue
    /// and invoke its registered handler. Returns the number of
    /// handlers invoked. Callers poll this periodically (or in
    /// response to an interrupt/eventfd outside this crate's scope)
    /// since AER slots never resolve through `wait_one`.
    pub fn dispatch_events(&self) -> usize {
        let mut dispatched = 0;
        while let Some((handle, cqe)) = self.admin_qp.poll_orphaned() {
            if let Some(handler) = self.aer_handlers.lock().remove(&handle.cid()) {
                handler(cqe.result);
                dispatched += 1;
            } else {
                warn!("orphaned completion for cid={} has no registered AER handler", handle.cid());
            }
        }
        dispatched
    }

    pub fn identify_controller(&self) -> Result<ControllerIdentity> {
        let buf = ScratchBuffer::alloc(&self.ctx, 4096)?;
        let cmd = command::identify_command(1, 0);
        self.admin(cmd, Some((buf.iova, 4096)))?;

        let data = buf.as_slice();
        let serial_number = ascii_field(&data[4..24]);
        let model_number = ascii_field(&data[24..64]);
        let firmware_revision = ascii_field(&data[64..72]);
        let mdts = data[77];
        let max_transfer_bytes =
            if mdts == 0 { None } else { Some((1u32 << mdts) << self.mps_shift) };

        Ok(ControllerIdentity { serial_number, model_number, firmware_revision, max_transfer_bytes })
    }

    pub fn identify_namespaces(&self) -> Result<Vec<NvmeNamespace>> {
        let list_buf = ScratchBuffer::alloc(&self.ctx, 4096)?;
        let cmd = command::identify_command(2, 0);
        self.admin(cmd, Some((list_buf.iova, 4096)))?;

        let mut nsids = Vec::new();
        for chunk in list_buf.as_slice().chunks_exact(4) {
            let nsid = u32::from_le_bytes(chunk.try_into().unwrap());
            if nsid == 0 {
                break;
            }
            nsids.push(nsid);
        }

        let mut namespaces = Vec::with_capacity(nsids.len());
        for nsid in nsids {
            let ns_buf = ScratchBuffer::alloc(&self.ctx, 4096)?;
            let cmd = command::identify_command(0, nsid);
            self.admin(cmd, Some((ns_buf.iova, 4096)))?;

            let data = ns_buf.as_slice();
            let block_count = u64::from_le_bytes(data[0..8].try_into().unwrap());
            let flbas = (data[26] & 0x0f) as usize;
            let lbaf_offset = 128 + 4 * flbas;
            let lbads = data[lbaf_offset + 2];
            let block_size = 1u32 << lbads;
            namespaces.push(NvmeNamespace { nsid, block_count, block_size });
        }
        Ok(namespaces)
    }

    /// Create one I/O queue pair: Create I/O Completion Queue, then
    /// Create I/O Submission Queue, both against the rings the pair
    /// allocated for itself. Returns the assigned queue ID.
    pub fn create_io_queue_pair(&mut self, qid: u16, sq_depth: u16, cq_depth: u16) -> Result<u16> {
        if self.io_qps.iter().any(|q| q.qid() == qid) {
            return Err(Error::Exists);
        }
        let qp = NvmeQueuePair::new(self.ctx.clone(), qid, sq_depth, cq_depth, self.mmio, self.dstrd)?;

        let mut create_cq = command::create_cq_command(qid, cq_depth - 1);
        create_cq.prp1 = qp.cq_ring_iova();
        self.admin(create_cq, None)?;

        let mut create_sq = command::create_sq_command(qid, sq_depth - 1, qid);
        create_sq.prp1 = qp.sq_ring_iova();
        self.admin(create_sq, None)?;

        debug!("created I/O queue pair qid={qid} sq_depth={sq_depth} cq_depth={cq_depth}");
        self.io_qps.push(qp);
        Ok(qid)
    }

    pub fn queue_pair(&self, qid: u16) -> Option<&NvmeQueuePair> {
        self.io_qps.iter().find(|q| q.qid() == qid)
    }

    /// Delete Submission Queue then Completion Queue for `qid`. Fails
    /// with [`Error::Busy`] if the pair still has ORPHANED slots; the
    /// caller must resolve those (typically via a controller reset)
    /// before deleting.
    pub fn delete_io_queue_pair(&mut self, qid: u16) -> Result<()> {
        let idx = self.io_qps.iter().position(|q| q.qid() == qid).ok_or(Error::NotFound)?;
        if !self.io_qps[idx].is_quiescent() {
            return Err(Error::Busy);
        }

        self.admin(command::delete_sq_command(qid), None)?;
        self.admin(command::delete_cq_command(qid), None)?;

        let qp = self.io_qps.remove(idx);
        qp.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::backend::NullBackend;
    use crate::iova::IovaRange;
    use crate::runtime::Runtime;
    use std::num::NonZeroUsize as NZ;

    fn fake_bar() -> *mut u8 {
        unsafe {
            mmap_anonymous(
                None,
                NZ::new(0x3000).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .unwrap()
            .as_ptr() as *mut u8
        }
    }

    fn test_ctx() -> Arc<IommuContext> {
        let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fffffffff }]));
        Arc::new(IommuContext::init(Runtime::with_page_size(4096), backend).unwrap())
    }

    /// A controller that never flips CSTS.RDY would hang `init`
    /// forever; this confirms the deadline fires instead.
    #[test]
    fn init_times_out_if_controller_never_reports_ready() {
        let mmio = fake_bar();
        write64(mmio, regs::CAP, (0x3fu64) | (0u64 << 48));
        let res = NvmeControllerSession::init(test_ctx(), mmio);
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[test]
    fn rejects_admin_depth_above_controller_maximum() {
        let mmio = fake_bar();
        // MQES = 3 (max 4 entries), far below ADMIN_SQ_DEPTH.
        write64(mmio, regs::CAP, 0x3);
        let res = NvmeControllerSession::init(test_ctx(), mmio);
        assert!(matches!(res, Err(Error::Invalid(_))));
    }
}
