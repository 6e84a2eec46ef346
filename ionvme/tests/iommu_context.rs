//! Cross-component scenarios that exercise the IOVA index, allocator,
//! and context together through the public API, using the in-memory
//! fake backend instead of hardware.

use ionvme::iommu::backend::NullBackend;
use ionvme::iommu::IommuContext;
use ionvme::iova::IovaRange;
use ionvme::Runtime;

fn ctx_with_range(start: u64, last: u64) -> IommuContext {
    let backend = Box::new(NullBackend::new(vec![IovaRange { start, last }]));
    IommuContext::init(Runtime::with_page_size(4096), backend).unwrap()
}

/// Sticky allocation followed by an ephemeral pair that is released in
/// reverse order rewinds the cursor to right after the sticky mapping,
/// matching the interleaving scenario in the design notes.
#[test]
fn sticky_then_ephemeral_pair_rewinds_cursor() {
    let ctx = ctx_with_range(0x10000, 0x7fff_ffff_ffff);

    let sticky_iova = ctx.map(0x7f00_0000_0000, 0x1000).unwrap();
    assert_eq!(sticky_iova, 0x10000);

    let a = ctx.map_ephemeral(0x7f01_0000_0000, 0x1000).unwrap();
    let b = ctx.map_ephemeral(0x7f01_0001_0000, 0x1000).unwrap();
    assert_eq!(a, 0x11000);
    assert_eq!(b, 0x12000);

    ctx.unmap_ephemeral(b, 0x1000).unwrap();
    ctx.unmap_ephemeral(a, 0x1000).unwrap();

    // Cursor rewound; the next ephemeral allocation reuses 0x11000.
    let c = ctx.map_ephemeral(0x7f01_0002_0000, 0x1000).unwrap();
    assert_eq!(c, 0x11000);
}

#[test]
fn sticky_allocation_exhausts_a_tight_range() {
    let ctx = ctx_with_range(0x10000, 0x10fff);
    assert!(ctx.map(0x7f00_0000_0000, 0x1000).is_ok());
    assert!(matches!(ctx.map(0x7f00_0001_0000, 0x1000), Err(ionvme::Error::NoSpace)));
}

#[test]
fn unmap_of_never_mapped_address_is_a_no_op() {
    let ctx = ctx_with_range(0x10000, 0x7fff_ffff_ffff);
    assert!(ctx.unmap(0xdead_beef_0000).is_ok());
}

#[test]
fn destroy_unmaps_every_outstanding_sticky_entry() {
    let backend = Box::new(NullBackend::new(vec![IovaRange { start: 0x10000, last: 0x7fff_ffff_ffff }]));
    let ctx = IommuContext::init(Runtime::with_page_size(4096), backend).unwrap();
    ctx.map(0x7f00_0000_0000, 0x1000).unwrap();
    ctx.map(0x7f00_0001_0000, 0x1000).unwrap();
    assert!(ctx.destroy().is_ok());
}
