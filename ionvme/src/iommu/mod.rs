//! The IOMMU address-space manager: context (C), backend port (D), and
//! the IOVA bookkeeping in [`crate::iova`] that backs it.

pub mod backend;
mod context;

pub use backend::{probe_backend, Backend, DmaFlags, FdBackend, LegacyGroupBackend};
#[cfg(any(test, feature = "testing"))]
pub use backend::NullBackend;
pub use context::IommuContext;
