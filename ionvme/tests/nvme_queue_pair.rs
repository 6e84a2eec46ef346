//! Queue-pair scenarios from the design notes: filling a queue to
//! depth-1 yields `Busy`, and a timed-out command is parked as
//! ORPHANED rather than silently dropped.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use ionvme::iommu::backend::NullBackend;
use ionvme::iommu::IommuContext;
use ionvme::iova::IovaRange;
use ionvme::nvme::command::Command;
use ionvme::nvme::queue::NvmeQueuePair;
use ionvme::Runtime;
use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};

fn test_ctx() -> Arc<IommuContext> {
    let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fff_ffff_ffff }]));
    Arc::new(IommuContext::init(Runtime::with_page_size(4096), backend).unwrap())
}

fn fake_bar() -> *mut u8 {
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
fn filling_the_queue_to_depth_minus_one_returns_busy() {
    let qp = NvmeQueuePair::new(test_ctx(), 1, 4, 4, fake_bar(), 0).unwrap();

    let _a = qp.acquire_rq().unwrap();
    let _b = qp.acquire_rq().unwrap();
    let _c = qp.acquire_rq().unwrap();
    assert!(matches!(qp.acquire_rq(), Err(ionvme::Error::Busy)));
}

#[test]
fn acquire_rq_wait_times_out_when_pool_stays_empty() {
    let qp = NvmeQueuePair::new(test_ctx(), 1, 2, 2, fake_bar(), 0).unwrap();
    let _held = qp.acquire_rq().unwrap();
    let res = qp.acquire_rq_wait(Duration::from_millis(20));
    assert!(matches!(res, Err(ionvme::Error::Timeout)));
}

#[test]
fn wait_one_marks_slot_orphaned_on_timeout() {
    let qp = NvmeQueuePair::new(test_ctx(), 1, 4, 4, fake_bar(), 0).unwrap();
    let handle = qp.acquire_rq().unwrap();
    qp.submit(handle, Command::new(0)).unwrap();

    let res = qp.wait_one(handle, Duration::from_millis(5));
    assert!(matches!(res, Err(ionvme::Error::Timeout)));

    // The orphaned slot keeps the pool from being quiescent until a
    // later completion (real or drained) reclaims it.
    assert!(!qp.is_quiescent());
}
