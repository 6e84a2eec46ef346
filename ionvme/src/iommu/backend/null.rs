//! An in-memory fake backend used by this crate's own test suite and by
//! callers who want to exercise [`crate::iommu::IommuContext`] without
//! hardware. Tracks installed mappings only well enough to catch a
//! caller unmapping something it never mapped; it performs no real
//! DMA.

use parking_lot::Mutex;
use std::collections::HashSet;

use super::{Backend, DmaFlags};
use crate::error::{Error, Result};
use crate::iova::IovaRange;

pub struct NullBackend {
    ranges: Vec<IovaRange>,
    mapped: Mutex<HashSet<u64>>,
    opened: Mutex<bool>,
    fail_next_map: Mutex<bool>,
}

impl NullBackend {
    pub fn new(ranges: Vec<IovaRange>) -> Self {
        NullBackend {
            ranges,
            mapped: Mutex::new(HashSet::new()),
            opened: Mutex::new(false),
            fail_next_map: Mutex::new(false),
        }
    }

    /// Test hook: make the next `map_dma` call fail, to exercise the
    /// context's rollback path (index insert succeeds only after the
    /// backend call succeeds).
    pub fn fail_next_map(&self) {
        *self.fail_next_map.lock() = true;
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }
}

impl Backend for NullBackend {
    fn open(&mut self) -> Result<()> {
        *self.opened.lock() = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.opened.lock() = false;
        Ok(())
    }

    fn map_dma(&self, _vaddr: u64, iova: u64, _len: u64, _flags: DmaFlags) -> Result<()> {
        if std::mem::take(&mut *self.fail_next_map.lock()) {
            return Err(Error::Backend(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            )));
        }
        self.mapped.lock().insert(iova);
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, _len: u64) -> Result<()> {
        self.mapped.lock().remove(&iova);
        Ok(())
    }

    fn reset_device(&self) -> Result<()> {
        Ok(())
    }

    fn set_irqs(&self, _eventfds: &[i32]) -> Result<()> {
        Ok(())
    }

    fn disable_irqs(&self) -> Result<()> {
        Ok(())
    }

    fn query_iova_ranges(&self) -> Result<Vec<IovaRange>> {
        Ok(self.ranges.clone())
    }
}
