//! The IOVA bump allocator (component B): sticky and ephemeral pools
//! sharing one cursor across an ordered sequence of permitted ranges.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// An inclusive range of IOVA the backend permits mapping into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRange {
    pub start: u64,
    pub last: u64,
}

/// Default permitted range when the backend reports none.
pub const DEFAULT_RANGE: IovaRange = IovaRange {
    start: 0x10000,
    last: (1u64 << 39) - 1,
};

struct State {
    next: u64,
    ephemeral_watermark: Option<u64>,
}

/// Bump-allocates IOVA from a fixed, ordered set of permitted ranges.
/// Two lifetimes share the same cursor: sticky allocations persist
/// until explicitly released by the caller (via unmap); ephemeral
/// allocations are recycled in bulk once every outstanding ephemeral
/// has been released.
pub struct IovaAllocator {
    ranges: Vec<IovaRange>,
    state: Mutex<State>,
    // read outside the `state` lock so `ephemeral_release` can detect
    // the 1->0 transition exactly once under concurrent callers.
    nephemeral: AtomicUsize,
}

impl IovaAllocator {
    pub fn new(ranges: Vec<IovaRange>) -> Self {
        let ranges = if ranges.is_empty() { vec![DEFAULT_RANGE] } else { ranges };
        let next = ranges[0].start;
        IovaAllocator {
            ranges,
            state: Mutex::new(State { next, ephemeral_watermark: None }),
            nephemeral: AtomicUsize::new(0),
        }
    }

    fn place(&self, state: &mut State, len: u64) -> Result<u64> {
        for range in &self.ranges {
            let base = state.next.max(range.start);
            if base > range.last {
                continue;
            }
            let end = base.checked_add(len).ok_or(Error::NoSpace)?;
            if end - 1 > range.last {
                continue;
            }
            state.next = end;
            return Ok(base);
        }
        Err(Error::NoSpace)
    }

    /// Allocate an IOVA that remains valid until the caller explicitly
    /// unmaps it. `len` must be a multiple of the runtime's page size.
    pub fn sticky_allocate(&self, rt: &Runtime, len: u64) -> Result<u64> {
        if len == 0 || !rt.is_page_aligned(len as usize) {
            return Err(Error::Invalid("len must be a non-zero multiple of the page size"));
        }
        let mut state = self.state.lock();
        self.place(&mut state, len)
    }

    /// Allocate an IOVA valid only until the owning command completes.
    /// The caller must pair this with exactly one [`ephemeral_release`]
    /// once the command drains.
    pub fn ephemeral_allocate(&self, rt: &Runtime, len: u64) -> Result<u64> {
        if len == 0 || !rt.is_page_aligned(len as usize) {
            return Err(Error::Invalid("len must be a non-zero multiple of the page size"));
        }
        let mut state = self.state.lock();
        let iova = self.place(&mut state, len)?;
        if self.nephemeral.fetch_add(1, Ordering::AcqRel) == 0 {
            state.ephemeral_watermark = Some(iova);
        }
        Ok(iova)
    }

    /// Release one ephemeral allocation. When the outstanding count
    /// reaches zero, rewind the bump cursor to the watermark captured
    /// at the latest 0->1 transition so ephemeral space is recycled
    /// without fragmenting sticky space.
    pub fn ephemeral_release(&self) {
        if self.nephemeral.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut state = self.state.lock();
            if let Some(watermark) = state.ephemeral_watermark.take() {
                state.next = watermark;
            }
        }
    }

    pub fn outstanding_ephemeral(&self) -> usize {
        self.nephemeral.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn cursor(&self) -> u64 {
        self.state.lock().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> Runtime {
        Runtime::with_page_size(4096)
    }

    #[test]
    fn sticky_bumps_cursor() {
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0x10000, last: 0x1ffff }]);
        assert_eq!(alloc.sticky_allocate(&rt(), 4096).unwrap(), 0x10000);
        assert_eq!(alloc.sticky_allocate(&rt(), 8192).unwrap(), 0x11000);
    }

    #[test]
    fn exact_fit_succeeds_one_byte_over_fails() {
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0, last: 0xfff }]);
        assert_eq!(alloc.sticky_allocate(&rt(), 0x1000).unwrap(), 0);
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0, last: 0xffe }]);
        assert!(matches!(alloc.sticky_allocate(&rt(), 0x1000), Err(Error::NoSpace)));
    }

    #[test]
    fn ephemeral_pairs_rewind_cursor() {
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0x10000, last: 0x7fffffffff }]);
        assert_eq!(alloc.sticky_allocate(&rt(), 4096).unwrap(), 0x10000);
        assert_eq!(alloc.sticky_allocate(&rt(), 8192).unwrap(), 0x11000);

        let a = alloc.ephemeral_allocate(&rt(), 4096).unwrap();
        let b = alloc.ephemeral_allocate(&rt(), 4096).unwrap();
        assert_eq!(a, 0x13000);
        assert_eq!(b, 0x14000);

        alloc.ephemeral_release();
        assert_eq!(alloc.cursor(), 0x15000, "cursor must not rewind until all ephemerals drain");
        alloc.ephemeral_release();
        assert_eq!(alloc.cursor(), 0x13000);

        assert_eq!(alloc.sticky_allocate(&rt(), 4096).unwrap(), 0x13000);
    }

    #[test]
    fn zero_length_rejected() {
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0, last: 0xffff }]);
        assert!(matches!(alloc.sticky_allocate(&rt(), 0), Err(Error::Invalid(_))));
    }

    #[test]
    fn unaligned_length_rejected() {
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0, last: 0xffff }]);
        assert!(matches!(alloc.sticky_allocate(&rt(), 100), Err(Error::Invalid(_))));
    }

    #[test]
    fn empty_ranges_falls_back_to_default() {
        let alloc = IovaAllocator::new(vec![]);
        assert_eq!(alloc.sticky_allocate(&rt(), 4096).unwrap(), DEFAULT_RANGE.start);
    }

    #[test]
    fn long_lived_ephemeral_delays_recycle() {
        // Open question noted in DESIGN.md: a long-lived ephemeral held
        // while short ones churn prevents the cursor from rewinding
        // until it, too, is released. This is the accepted behavior.
        let alloc = IovaAllocator::new(vec![IovaRange { start: 0, last: 0x7fffffffff }]);
        let long = alloc.ephemeral_allocate(&rt(), 4096).unwrap();
        for _ in 0..10 {
            alloc.ephemeral_allocate(&rt(), 4096).unwrap();
            alloc.ephemeral_release();
        }
        assert!(alloc.cursor() > long + 4096);
        alloc.ephemeral_release();
        assert_eq!(alloc.cursor(), long);
    }
}
