//! The IOMMU backend port (component D): a single façade implemented by
//! two real variants (legacy VFIO group/container, modern IOMMUFD) plus
//! an in-memory fake used by this crate's own tests.

mod fd;
mod legacy;
#[cfg(any(test, feature = "testing"))]
mod null;

pub use fd::FdBackend;
pub use legacy::LegacyGroupBackend;
#[cfg(any(test, feature = "testing"))]
pub use null::NullBackend;

use crate::error::Result;
use crate::iova::IovaRange;

bitflags::bitflags! {
    /// Direction flags for a DMA mapping, mirrored onto
    /// `VFIO_DMA_MAP_FLAG_{READ,WRITE}` / the IOMMUFD equivalent.
    pub struct DmaFlags: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Default for DmaFlags {
    fn default() -> Self {
        DmaFlags::READ | DmaFlags::WRITE
    }
}

/// The kernel-side mechanism providing IOMMU passthrough for one
/// device. Both variants expose an identical contract; the context
/// never branches on which one it holds.
pub trait Backend: Send + Sync {
    /// Open the container/device and bring the backend to a state
    /// where `query_iova_ranges` and `map_dma` can be called.
    fn open(&mut self) -> Result<()>;

    /// Tear down the container/device. Idempotent: calling `close` on
    /// an already-closed backend is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Install a DMA mapping for `[vaddr, vaddr+len)` at IOVA `iova`.
    fn map_dma(&self, vaddr: u64, iova: u64, len: u64, flags: DmaFlags) -> Result<()>;

    /// Remove a previously installed DMA mapping.
    fn unmap_dma(&self, iova: u64, len: u64) -> Result<()>;

    /// Issue a function-level reset of the device.
    fn reset_device(&self) -> Result<()>;

    /// Route MSI/MSI-X vectors to the given eventfds.
    fn set_irqs(&self, eventfds: &[i32]) -> Result<()>;

    /// Disable IRQ routing previously installed by `set_irqs`.
    fn disable_irqs(&self) -> Result<()>;

    /// Ranges of IOVA space the kernel permits mapping into for this
    /// device. Empty means "the backend reported none"; the context
    /// falls back to [`crate::iova::DEFAULT_RANGE`] in that case.
    fn query_iova_ranges(&self) -> Result<Vec<IovaRange>>;
}

/// Select a backend at context construction. The probe runs once, not
/// per operation, per the design notes: "the runtime probe that
/// selects between them runs once at context construction."
pub fn probe_backend(group_or_device_path: &str) -> Box<dyn Backend> {
    if fd::iommufd_available() {
        Box::new(FdBackend::new(group_or_device_path))
    } else {
        Box::new(LegacyGroupBackend::new(group_or_device_path))
    }
}
