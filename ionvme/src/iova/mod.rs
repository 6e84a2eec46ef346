//! The address-space bookkeeping that backs [`crate::iommu::IommuContext`]:
//! an ordered index of active mappings (component A) and a bump
//! allocator over backend-permitted ranges (component B).

pub mod allocator;
pub mod index;

pub use allocator::{IovaAllocator, IovaRange, DEFAULT_RANGE};
pub use index::{Entry, IovaIndex};
