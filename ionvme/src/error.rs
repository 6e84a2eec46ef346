//! Error kinds shared by every layer of the crate.
//!
//! Lower layers (the IOVA index and allocator) surface their kind
//! unchanged; the context and session layers only wrap when they are
//! adding information a caller could not otherwise recover (e.g.
//! distinguishing an allocation failure from the backend call that
//! followed it).

use std::io;

/// The single error type returned by every fallible operation in this
/// crate. Variants map 1:1 onto the error kinds of the design: no
/// string-typed errors, no silent downcasting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller violated a precondition: zero length, unaligned length,
    /// an unknown option.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// A lookup found nothing. Non-fatal for idempotent unmap.
    #[error("not found")]
    NotFound,

    /// Insertion would overlap an existing entry.
    #[error("entry already exists")]
    Exists,

    /// No IOVA range can satisfy the request, or the request-slot pool
    /// is transiently empty.
    #[error("no space available")]
    NoSpace,

    /// The operation would block but the caller asked not to.
    #[error("resource busy")]
    Busy,

    /// `wait_one` deadline passed with no matching completion.
    #[error("operation timed out")]
    Timeout,

    /// A backend ioctl or syscall failed; the underlying errno is
    /// preserved.
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),

    /// A CQE returned a non-zero status; the 15-bit status field is
    /// preserved verbatim.
    #[error("device reported error status 0x{status:04x}")]
    Device { status: u16 },

    /// The selected backend lacks a capability the caller requested
    /// (e.g. reset, eventfd-based IRQs).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
