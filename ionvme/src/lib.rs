//! `ionvme` drives a PCIe NVMe controller from user space through a
//! kernel IOMMU passthrough facility (VFIO group/container or
//! IOMMUFD). It owns the address-space bookkeeping an IOMMU mapping
//! needs (an ordered index plus a sticky/ephemeral allocator), a port
//! abstracting the two kernel passthrough mechanisms, and the NVMe
//! queue-pair/controller-session machinery built on top of both.
//!
//! This crate does not discover or map a device's PCI BARs, parse PCI
//! config space, or provide a CLI — callers hand it an already-mapped
//! MMIO region and an open backend. See each module for the component
//! it implements.

pub mod crc64;
pub mod error;
pub mod iommu;
pub mod iova;
pub mod nvme;
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::Runtime;
