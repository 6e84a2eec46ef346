//! The IOMMU context (component C): aggregates the IOVA index and
//! allocator, performs MAP/UNMAP through the backend, and exposes
//! vaddr<->iova translation.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::iommu::backend::{Backend, DmaFlags};
use crate::iova::{IovaAllocator, IovaIndex, IovaRange};
use crate::runtime::Runtime;

/// Owns one index, one allocator, and one backend handle. Lifetime
/// begins at construction and ends at [`IommuContext::destroy`], which
/// removes every mapping before releasing backend resources.
pub struct IommuContext {
    rt: Runtime,
    backend: Box<dyn Backend>,
    index: IovaIndex,
    allocator: IovaAllocator,
}

impl IommuContext {
    /// Open `backend` and discover its permitted IOVA ranges. Falls
    /// back to [`crate::iova::DEFAULT_RANGE`] when the backend reports
    /// none.
    pub fn init(rt: Runtime, mut backend: Box<dyn Backend>) -> Result<Self> {
        backend.open()?;
        let ranges: Vec<IovaRange> = backend.query_iova_ranges()?;
        Ok(IommuContext {
            rt,
            backend,
            index: IovaIndex::new(),
            allocator: IovaAllocator::new(ranges),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Install a sticky mapping for `[vaddr, vaddr+len)`. Idempotent: a
    /// mapping that already covers this range — not necessarily an
    /// exact match — returns the IOVA corresponding to `vaddr` within
    /// that existing entry rather than allocating a new one.
    pub fn map(&self, vaddr: u64, len: u64) -> Result<u64> {
        if let Some(entry) = self.index.find(vaddr) {
            let end = vaddr.saturating_add(len);
            let entry_end = entry.vaddr.saturating_add(entry.len);
            if vaddr >= entry.vaddr && end <= entry_end {
                return Ok(entry.iova + (vaddr - entry.vaddr));
            }
        }

        let page_len = self.rt.page_round_up(len as usize) as u64;
        let iova = self.allocator.sticky_allocate(&self.rt, page_len)?;

        self.backend.map_dma(vaddr, iova, len, DmaFlags::default())?;

        if let Err(e) = self.index.insert(vaddr, len, iova) {
            // The kernel mapping succeeded but we could not record it;
            // leaving it installed would leak IOVA space and desync
            // the index, so roll the DMA_MAP back before surfacing the
            // original error.
            if let Err(unmap_err) = self.backend.unmap_dma(iova, len) {
                warn!("rollback unmap_dma failed after index insert error: {unmap_err}");
            }
            return Err(e);
        }
        debug!("mapped vaddr={vaddr:#x} len={len:#x} -> iova={iova:#x}");
        Ok(iova)
    }

    /// Remove a sticky mapping. Succeeds silently if `vaddr` is not
    /// currently mapped.
    pub fn unmap(&self, vaddr: u64) -> Result<()> {
        let entry = match self.index.find(vaddr) {
            Some(e) if e.vaddr == vaddr => e,
            _ => return Ok(()),
        };
        self.backend.unmap_dma(entry.iova, entry.len)?;
        self.index.remove(vaddr)?;
        Ok(())
    }

    /// Allocate and map an ephemeral IOVA for a short-lived command
    /// buffer. Not indexed; the caller is responsible for passing the
    /// returned IOVA to [`IommuContext::unmap_ephemeral`] exactly once.
    pub fn map_ephemeral(&self, vaddr: u64, len: u64) -> Result<u64> {
        let page_len = self.rt.page_round_up(len as usize) as u64;
        let iova = self.allocator.ephemeral_allocate(&self.rt, page_len)?;
        if let Err(e) = self.backend.map_dma(vaddr, iova, len, DmaFlags::default()) {
            self.allocator.ephemeral_release();
            return Err(e);
        }
        Ok(iova)
    }

    pub fn unmap_ephemeral(&self, iova: u64, len: u64) -> Result<()> {
        self.backend.unmap_dma(iova, len)?;
        self.allocator.ephemeral_release();
        Ok(())
    }

    /// `iova + (vaddr - entry.vaddr)` for the sticky entry containing
    /// `vaddr`, or `None` if no such entry exists.
    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        let entry = self.index.find(vaddr)?;
        Some(entry.iova + (vaddr - entry.vaddr))
    }

    /// Unmap every sticky entry and release backend resources. Consumes
    /// the context; no further operations are possible afterwards.
    pub fn destroy(mut self) -> Result<()> {
        let backend = &self.backend;
        let mut first_err = None;
        let mut unmap = |entry: crate::iova::Entry| {
            if let Err(e) = backend.unmap_dma(entry.iova, entry.len) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };
        self.index.clear(Some(&mut unmap));
        if let Some(e) = first_err {
            return Err(e);
        }
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::backend::NullBackend;

    fn ctx() -> IommuContext {
        let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fffffffff }]));
        IommuContext::init(Runtime::with_page_size(4096), backend).unwrap()
    }

    #[test]
    fn map_translate_unmap_idempotent() {
        let ctx = ctx();
        let iova = ctx.map(0x7f00_0000_0000, 4096).unwrap();
        assert_eq!(iova, 0x10000);
        assert_eq!(ctx.translate(0x7f00_0000_0008), Some(0x10008));
        ctx.unmap(0x7f00_0000_0000).unwrap();
        ctx.unmap(0x7f00_0000_0000).unwrap(); // idempotent
        assert_eq!(ctx.translate(0x7f00_0000_0000), None);
    }

    #[test]
    fn repeated_map_is_idempotent() {
        let ctx = ctx();
        let a = ctx.map(0x7f00_0000_0000, 4096).unwrap();
        let b = ctx.map(0x7f00_0000_0000, 4096).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ephemeral_round_trip() {
        let ctx = ctx();
        let iova = ctx.map_ephemeral(0x7f01_0000_0000, 4096).unwrap();
        ctx.unmap_ephemeral(iova, 4096).unwrap();
        assert_eq!(ctx.allocator.outstanding_ephemeral(), 0);
    }

    #[test]
    fn failed_backend_map_does_not_leak_index_entry() {
        let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fffffffff }]));
        backend.fail_next_map();
        let ctx = IommuContext::init(Runtime::with_page_size(4096), backend).unwrap();
        assert!(ctx.map(0x7f00_0000_0000, 4096).is_err());
        assert_eq!(ctx.translate(0x7f00_0000_0000), None);
    }
}
