//! The NVMe queue-pair engine (E) and controller session (F).

pub mod command;
mod controller;
pub mod queue;
pub mod regs;

pub use command::{Command, CommandBuilder, Completion};
pub use controller::{ControllerIdentity, NvmeControllerSession, NvmeNamespace};
pub use queue::{NvmeQueuePair, RqHandle};
