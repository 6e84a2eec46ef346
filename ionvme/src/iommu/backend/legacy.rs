//! Legacy group-based VFIO backend: container -> group -> device,
//! the sequence every VFIO user-space driver follows (grounded on the
//! ioctl choreography in `ixy`'s ixgbe driver, with the ioctl request
//! structs and numbers sourced from the `vfio-bindings` crate instead
//! of hand-transcribed constants).

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use vfio_bindings::bindings::vfio::*;

use super::{Backend, DmaFlags};
use crate::error::{Error, Result};
use crate::iova::IovaRange;

const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

nix::ioctl_none!(vfio_get_api_version, VFIO_TYPE, VFIO_BASE);
nix::ioctl_write_int!(vfio_check_extension, VFIO_TYPE, VFIO_BASE + 1);
nix::ioctl_write_int!(vfio_set_iommu, VFIO_TYPE, VFIO_BASE + 2);
nix::ioctl_readwrite!(vfio_group_get_status, VFIO_TYPE, VFIO_BASE + 3, vfio_group_status);
nix::ioctl_write_int!(vfio_group_set_container, VFIO_TYPE, VFIO_BASE + 4);
nix::ioctl_write_ptr!(vfio_group_get_device_fd, VFIO_TYPE, VFIO_BASE + 6, u8);
nix::ioctl_readwrite!(vfio_iommu_get_info, VFIO_TYPE, VFIO_BASE + 12, vfio_iommu_type1_info);
nix::ioctl_write_ptr!(vfio_iommu_map_dma, VFIO_TYPE, VFIO_BASE + 13, vfio_iommu_type1_dma_map);
nix::ioctl_write_ptr!(vfio_iommu_unmap_dma, VFIO_TYPE, VFIO_BASE + 14, vfio_iommu_type1_dma_unmap);
nix::ioctl_none!(vfio_device_reset, VFIO_TYPE, VFIO_BASE + 9);
nix::ioctl_write_ptr!(vfio_device_set_irqs, VFIO_TYPE, VFIO_BASE + 10, vfio_irq_set);

struct Open {
    container: File,
    group: File,
    device: RawFd,
}

/// `group_path` is the path to the device's isolation group, e.g.
/// `/dev/vfio/42`; it is discovered by the PCI-binding layer this
/// crate treats as an external collaborator.
pub struct LegacyGroupBackend {
    group_path: String,
    open: Option<Open>,
}

impl LegacyGroupBackend {
    pub fn new(group_path: &str) -> Self {
        LegacyGroupBackend { group_path: group_path.to_string(), open: None }
    }

    fn device(&self) -> Result<RawFd> {
        self.open.as_ref().map(|o| o.device).ok_or_else(|| {
            Error::Backend(io::Error::new(io::ErrorKind::NotConnected, "backend not open"))
        })
    }
}

impl Backend for LegacyGroupBackend {
    fn open(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Ok(());
        }

        let container = OpenOptions::new().read(true).write(true).open(VFIO_CONTAINER_PATH)?;
        let cfd = container.as_raw_fd();

        let version = unsafe { vfio_get_api_version(cfd) }.map_err(io::Error::from)?;
        if version != VFIO_API_VERSION as i32 {
            return Err(Error::Unsupported("unexpected VFIO API version"));
        }
        let type1 = unsafe { vfio_check_extension(cfd, VFIO_TYPE1_IOMMU as u64) }.map_err(io::Error::from)?;
        if type1 != 1 {
            return Err(Error::Unsupported("VFIO Type1 IOMMU not supported"));
        }

        let group = OpenOptions::new().read(true).write(true).open(&self.group_path)?;
        let gfd = group.as_raw_fd();

        let mut status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        unsafe { vfio_group_get_status(gfd, &mut status) }.map_err(io::Error::from)?;
        if status.flags & VFIO_GROUP_FLAGS_VIABLE != VFIO_GROUP_FLAGS_VIABLE {
            return Err(Error::Unsupported("VFIO group is not viable"));
        }

        unsafe { vfio_group_set_container(gfd, cfd as u64) }.map_err(io::Error::from)?;
        unsafe { vfio_set_iommu(cfd, VFIO_TYPE1_IOMMU as u64) }.map_err(io::Error::from)?;

        let device_name = Path::new(&self.group_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let device =
            unsafe { vfio_group_get_device_fd(gfd, device_name.as_ptr()) }.map_err(io::Error::from)?;

        self.open = Some(Open { container, group, device });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            unsafe { libc::close(open.device) };
            drop(open.group);
            drop(open.container);
        }
        Ok(())
    }

    fn map_dma(&self, vaddr: u64, iova: u64, len: u64, flags: DmaFlags) -> Result<()> {
        let cfd = self.open.as_ref().ok_or_else(|| {
            Error::Backend(io::Error::new(io::ErrorKind::NotConnected, "backend not open"))
        })?.container.as_raw_fd();

        let mut vfio_flags = 0u32;
        if flags.contains(DmaFlags::READ) {
            vfio_flags |= VFIO_DMA_MAP_FLAG_READ;
        }
        if flags.contains(DmaFlags::WRITE) {
            vfio_flags |= VFIO_DMA_MAP_FLAG_WRITE;
        }

        let req = vfio_iommu_type1_dma_map {
            argsz: mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: vfio_flags,
            vaddr,
            iova,
            size: len,
        };
        unsafe { vfio_iommu_map_dma(cfd, &req) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, len: u64) -> Result<()> {
        let cfd = self.open.as_ref().ok_or_else(|| {
            Error::Backend(io::Error::new(io::ErrorKind::NotConnected, "backend not open"))
        })?.container.as_raw_fd();

        let mut req = vfio_iommu_type1_dma_unmap {
            argsz: mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags: 0,
            iova,
            size: len,
            ..Default::default()
        };
        unsafe { vfio_iommu_unmap_dma(cfd, &mut req) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn reset_device(&self) -> Result<()> {
        let fd = self.device()?;
        unsafe { vfio_device_reset(fd) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn set_irqs(&self, eventfds: &[i32]) -> Result<()> {
        let fd = self.device()?;
        let mut req = vfio_irq_set {
            argsz: (mem::size_of::<vfio_irq_set>() + eventfds.len() * mem::size_of::<i32>()) as u32,
            flags: VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
            index: VFIO_PCI_MSIX_IRQ_INDEX,
            start: 0,
            count: eventfds.len() as u32,
            data: Default::default(),
        };
        // The eventfd array trails the fixed struct in the real ioctl
        // buffer; `vfio_irq_set` here carries only the fixed header, so
        // build the full buffer by hand before issuing the ioctl.
        let mut buf = vec![0u8; req.argsz as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                &req as *const vfio_irq_set as *const u8,
                buf.as_mut_ptr(),
                mem::size_of::<vfio_irq_set>(),
            );
            std::ptr::copy_nonoverlapping(
                eventfds.as_ptr() as *const u8,
                buf.as_mut_ptr().add(mem::size_of::<vfio_irq_set>()),
                eventfds.len() * mem::size_of::<i32>(),
            );
            req = std::ptr::read(buf.as_ptr() as *const vfio_irq_set);
            vfio_device_set_irqs(fd, buf.as_ptr() as *const vfio_irq_set)
        }
        .map_err(io::Error::from)?;
        Ok(())
    }

    fn disable_irqs(&self) -> Result<()> {
        let fd = self.device()?;
        let req = vfio_irq_set {
            argsz: mem::size_of::<vfio_irq_set>() as u32,
            flags: VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
            index: VFIO_PCI_MSIX_IRQ_INDEX,
            start: 0,
            count: 0,
            data: Default::default(),
        };
        unsafe { vfio_device_set_irqs(fd, &req) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn query_iova_ranges(&self) -> Result<Vec<IovaRange>> {
        let cfd = self.open.as_ref().ok_or_else(|| {
            Error::Backend(io::Error::new(io::ErrorKind::NotConnected, "backend not open"))
        })?.container.as_raw_fd();

        // Two-phase sizing: the kernel may report a larger argsz than
        // our fixed-size guess if the capability chain is long.
        let mut info = vfio_iommu_type1_info {
            argsz: mem::size_of::<vfio_iommu_type1_info>() as u32,
            flags: 0,
            iova_pgsizes: 0,
            cap_offset: 0,
            ..Default::default()
        };
        unsafe { vfio_iommu_get_info(cfd, &mut info) }.map_err(io::Error::from)?;

        if info.argsz as usize <= mem::size_of::<vfio_iommu_type1_info>() || info.cap_offset == 0 {
            return Ok(Vec::new());
        }

        let mut raw = vec![0u8; info.argsz as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                &info as *const _ as *const u8,
                raw.as_mut_ptr(),
                mem::size_of::<vfio_iommu_type1_info>(),
            );
        }
        let mut resized = unsafe { std::ptr::read(raw.as_ptr() as *const vfio_iommu_type1_info) };
        resized.argsz = raw.len() as u32;
        unsafe { vfio_iommu_get_info(cfd, raw.as_mut_ptr() as *mut vfio_iommu_type1_info) }
            .map_err(io::Error::from)?;

        Ok(parse_iova_range_capability(&raw, info.cap_offset as usize))
    }
}

/// Walk the capability-header linked list anchored at `cap_offset`
/// looking for the IOVA-range capability (the only one this driver
/// understands, per §6).
fn parse_iova_range_capability(raw: &[u8], mut offset: usize) -> Vec<IovaRange> {
    const VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE: u16 = 1;

    let mut ranges = Vec::new();
    while offset != 0 && offset + 8 <= raw.len() {
        let id = u16::from_ne_bytes([raw[offset], raw[offset + 1]]);
        let next = u32::from_ne_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]) as usize;

        if id == VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE {
            let nr_off = offset + 8;
            if nr_off + 4 <= raw.len() {
                let nr_iovas = u32::from_ne_bytes([
                    raw[nr_off],
                    raw[nr_off + 1],
                    raw[nr_off + 2],
                    raw[nr_off + 3],
                ]) as usize;
                let mut entry_off = nr_off + 8; // skip nr_iovas + reserved
                for _ in 0..nr_iovas {
                    if entry_off + 16 > raw.len() {
                        break;
                    }
                    let start = u64::from_ne_bytes(raw[entry_off..entry_off + 8].try_into().unwrap());
                    let last = u64::from_ne_bytes(raw[entry_off + 8..entry_off + 16].try_into().unwrap());
                    ranges.push(IovaRange { start, last });
                    entry_off += 16;
                }
            }
        }

        offset = next;
    }
    ranges
}
