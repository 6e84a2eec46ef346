//! 64-byte submission queue entries, 16-byte completion queue entries,
//! and a builder for the former (grounded on the struct layouts and
//! the fluent builder pattern in `ktheindifferent`'s
//! `nvme::{mod,command}`).

/// Submission Queue Entry. `repr(C)` and exactly 64 bytes so it can be
/// written directly into the SQ ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Command {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub reserved: [u32; 2],
    pub metadata: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(std::mem::size_of::<Command>() == 64);

impl Command {
    pub fn new(opcode: u8) -> Self {
        Command { opcode, ..Default::default() }
    }
}

/// Fluent builder mirroring `ktheindifferent`'s `NvmeCommandBuilder`,
/// generalized to every field this design needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder {
    cmd: Command,
}

impl CommandBuilder {
    pub fn new(opcode: u8) -> Self {
        CommandBuilder { cmd: Command::new(opcode) }
    }

    pub fn nsid(mut self, nsid: u32) -> Self {
        self.cmd.nsid = nsid;
        self
    }

    pub fn cdw10(mut self, v: u32) -> Self {
        self.cmd.cdw10 = v;
        self
    }

    pub fn cdw11(mut self, v: u32) -> Self {
        self.cmd.cdw11 = v;
        self
    }

    pub fn cdw12(mut self, v: u32) -> Self {
        self.cmd.cdw12 = v;
        self
    }

    pub fn cdw13(mut self, v: u32) -> Self {
        self.cmd.cdw13 = v;
        self
    }

    pub fn metadata(mut self, addr: u64) -> Self {
        self.cmd.metadata = addr;
        self
    }

    pub fn build(self) -> Command {
        self.cmd
    }
}

/// Build an Identify admin command for the given Controller-or-Namespace
/// Structure selector (`cns`). `cns = 1` identifies the controller,
/// `cns = 0` identifies one namespace, `cns = 2` lists active namespace
/// IDs.
pub fn identify_command(cns: u8, nsid: u32) -> Command {
    CommandBuilder::new(crate::nvme::regs::admin_opcode::IDENTIFY)
        .nsid(nsid)
        .cdw10(cns as u32)
        .build()
}

pub fn create_cq_command(qid: u16, size_minus_one: u16) -> Command {
    CommandBuilder::new(crate::nvme::regs::admin_opcode::CREATE_CQ)
        .cdw10((size_minus_one as u32) << 16 | qid as u32)
        .cdw11(1) // physically contiguous, interrupts disabled
        .build()
}

pub fn create_sq_command(qid: u16, size_minus_one: u16, cqid: u16) -> Command {
    CommandBuilder::new(crate::nvme::regs::admin_opcode::CREATE_SQ)
        .cdw10((size_minus_one as u32) << 16 | qid as u32)
        .cdw11((cqid as u32) << 16 | 1) // physically contiguous
        .build()
}

pub fn delete_cq_command(qid: u16) -> Command {
    CommandBuilder::new(crate::nvme::regs::admin_opcode::DELETE_CQ).cdw10(qid as u32).build()
}

pub fn delete_sq_command(qid: u16) -> Command {
    CommandBuilder::new(crate::nvme::regs::admin_opcode::DELETE_SQ).cdw10(qid as u32).build()
}

/// Completion Queue Entry. `repr(C)` and exactly 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub result: u32,
    pub reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

const _: () = assert!(std::mem::size_of::<Completion>() == 16);

impl Completion {
    /// Low bit of the status word.
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// Upper 15 bits of the status word.
    pub fn status_field(&self) -> u16 {
        self.status >> 1
    }

    pub fn is_error(&self) -> bool {
        self.status_field() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_decodes_phase_and_status() {
        let c = Completion { status: 0b101, ..Default::default() };
        assert!(c.phase());
        assert_eq!(c.status_field(), 0b10);
        assert!(c.is_error());
    }

    #[test]
    fn identify_command_sets_cns_and_nsid() {
        let cmd = identify_command(1, 0);
        assert_eq!(cmd.opcode, crate::nvme::regs::admin_opcode::IDENTIFY);
        assert_eq!(cmd.cdw10, 1);
        assert_eq!(cmd.nsid, 0);
    }
}
