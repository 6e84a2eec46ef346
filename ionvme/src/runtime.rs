//! Process-wide constants, scoped to a value instead of a global.
//!
//! §9 of the design notes: "the page size and tick frequency are
//! derived once at library initialization; in a systems rewrite they
//! become fields of a `Runtime` value constructed before any context,
//! not process globals." Everything downstream that used to read
//! `sysconf(_SC_PAGESIZE)` or a lazy_static takes a `&Runtime` instead.

use nix::unistd::{sysconf, SysconfVar};

/// Host facts a context and its queue pairs need but must not
/// rediscover on every call.
#[derive(Debug, Clone, Copy)]
pub struct Runtime {
    page_size: usize,
    page_shift: u32,
}

impl Runtime {
    /// Probe the host once. Panics only if `sysconf` itself fails,
    /// which indicates a broken process environment rather than a
    /// recoverable fault.
    pub fn probe() -> Self {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .expect("sysconf(_SC_PAGESIZE) failed")
            .unwrap_or(4096) as usize;
        Self::with_page_size(page_size)
    }

    /// Construct directly from a known page size, for tests and for
    /// hosts where the controller advertises a non-default MPS.
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Round `len` up to the next multiple of the page size.
    pub fn page_round_up(&self, len: usize) -> usize {
        (len + self.page_size - 1) & !(self.page_size - 1)
    }

    pub fn is_page_aligned(&self, len: usize) -> bool {
        len & (self.page_size - 1) == 0
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_page_size(4096)
    }
}
