// SPDX-License-Identifier: MPL-2.0

//! NVMe Command and Completion structures.
//!
//! Refer to NVM Express Base Specification Revision 2.0:
//! - Section 3.3 (Queue Mechanism)
//! - Section 5 (Admin Command Set)
//! - Section 6 (NVM Command Set)

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Phase Tag bit mask (Dword 3, bit 16 of the completion entry).
pub(crate) const STATUS_PHASE_TAG_MASK: u16 = 0x0001;

/// Status Code / Status Code Type / More / Do Not Retry bits, excluding Phase Tag.
/// Any of these bits set means the command did not complete successfully.
const STATUS_ERROR_MASK: u16 = 0xFFFE;

/// Status Code Type values (completion status bits 11:9).
const SCT_GENERIC: u8 = 0x0;
const SCT_PATH_RELATED: u8 = 0x3;

/// Generic status codes referenced by retry classification below.
const SC_SUCCESS: u8 = 0x00;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_ABORTED_BY_REQUEST: u8 = 0x07;
const SC_ABORTED_SQ_DELETION: u8 = 0x08;
const SC_NAMESPACE_NOT_READY: u8 = 0x82;
const SC_FORMAT_IN_PROGRESS: u8 = 0x84;

/// Phase-Submission-Descriptor-Type field values (command flags bits 7:6).
const PSDT_PRP: u8 = 0b00 << 6;
const PSDT_SGL_MPTR_CONTIGUOUS: u8 = 0b01 << 6;
const PSDT_SGL_MPTR_SGL: u8 = 0b10 << 6;

/// Admin Command Set opcodes. See NVMe Spec 2.0, Section 5.
#[repr(u8)]
#[derive(Copy, Clone)]
pub enum AdminOpcode {
    DeleteIoSq = 0x00,
    CreateIoSq = 0x01,
    DeleteIoCq = 0x04,
    CreateIoCq = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    AsyncEventRequest = 0x0C,
}

/// I/O Command Set opcodes (NVM Command Set). See NVMe Spec 2.0, Section 7.
#[repr(u8)]
#[derive(Copy, Clone)]
pub enum IoOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

/// Submission Queue Entry. 64 bytes, `repr(C)`, zerocopy `AsBytes`/`FromBytes` so it can be
/// written into a DMA ring slot by value without a `Pod`-style internal trait.
#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct NvmeCommand {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub _rsvd: u64,
    pub mptr: u64,
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    fn blank(opcode: u8, cid: u16, nsid: u32) -> Self {
        Self {
            opcode,
            flags: 0,
            cid,
            nsid,
            _rsvd: 0,
            mptr: 0,
            dptr: [0, 0],
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    /// Marks this command as using PRP data pointers (the default).
    pub fn set_psdt_prp(&mut self) {
        self.flags = (self.flags & !0b1100_0000) | PSDT_PRP;
    }

    /// Marks this command as using an SGL data pointer with a contiguous (or absent) metadata
    /// pointer. Unused by this crate's builders today — none of them attach a scattered metadata
    /// pointer — kept for a future caller that does.
    pub fn set_psdt_sgl_mptr_contiguous(&mut self) {
        self.flags = (self.flags & !0b1100_0000) | PSDT_SGL_MPTR_CONTIGUOUS;
    }

    /// Marks this command as using an SGL data pointer with an SGL metadata pointer, i.e. "SGL
    /// for data, SGL for metadata" — the encoding the hardware-SGL builder uses.
    pub fn set_psdt_sgl_mptr_sgl(&mut self) {
        self.flags = (self.flags & !0b1100_0000) | PSDT_SGL_MPTR_SGL;
    }

    pub fn create_io_cq(cid: u16, qid: u16, cq_phys: u64, num_entries_minus1: u16) -> Self {
        let mut cmd = Self::blank(AdminOpcode::CreateIoCq as u8, cid, 0);
        cmd.dptr[0] = cq_phys;
        cmd.cdw10 = ((num_entries_minus1 as u32) << 16) | qid as u32;
        cmd.cdw11 = 0x1; // physically contiguous, interrupts disabled (poll mode)
        cmd
    }

    pub fn create_io_sq(
        cid: u16,
        qid: u16,
        sq_phys: u64,
        num_entries_minus1: u16,
        cqid: u16,
        priority: u8,
    ) -> Self {
        let mut cmd = Self::blank(AdminOpcode::CreateIoSq as u8, cid, 0);
        cmd.dptr[0] = sq_phys;
        cmd.cdw10 = ((num_entries_minus1 as u32) << 16) | qid as u32;
        cmd.cdw11 = ((cqid as u32) << 16) | ((priority as u32) << 1) | 0x1;
        cmd
    }

    pub fn delete_io_sq(cid: u16, qid: u16) -> Self {
        let mut cmd = Self::blank(AdminOpcode::DeleteIoSq as u8, cid, 0);
        cmd.cdw10 = qid as u32;
        cmd
    }

    pub fn delete_io_cq(cid: u16, qid: u16) -> Self {
        let mut cmd = Self::blank(AdminOpcode::DeleteIoCq as u8, cid, 0);
        cmd.cdw10 = qid as u32;
        cmd
    }

    pub fn io_read(cid: u16, nsid: u32, lba: u64, blocks_minus1: u16) -> Self {
        let mut cmd = Self::blank(IoOpcode::Read as u8, cid, nsid);
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = blocks_minus1 as u32;
        cmd
    }

    pub fn io_write(cid: u16, nsid: u32, lba: u64, blocks_minus1: u16) -> Self {
        let mut cmd = Self::blank(IoOpcode::Write as u8, cid, nsid);
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = blocks_minus1 as u32;
        cmd
    }

    pub fn io_flush(cid: u16, nsid: u32) -> Self {
        Self::blank(IoOpcode::Flush as u8, cid, nsid)
    }
}

/// Completion Queue Entry. 16 bytes, `repr(C)`.
///
/// Status Field (Dword 3, bits 31:16):
/// - bit 0: Phase Tag
/// - bits 8:1: Status Code
/// - bits 11:9: Status Code Type
/// - bits 13:12: Command Retry Delay
/// - bit 14: More
/// - bit 15: Do Not Retry
#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct NvmeCompletion {
    pub dword0: u32,
    pub dword1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

impl NvmeCompletion {
    /// Builds a synthetic completion for manual tracker completion (abort/reset/fail paths) —
    /// there is no real device entry backing these.
    pub fn synthetic(cid: u16, sct: u8, sc: u8, dnr: bool) -> Self {
        let mut status = ((sct as u16) << 9) | ((sc as u16) << 1);
        if dnr {
            status |= 1 << 15;
        }
        Self {
            dword0: 0,
            dword1: 0,
            sq_head: 0,
            sq_id: 0,
            cid,
            status,
        }
    }

    pub fn aborted_by_request(cid: u16, dnr: bool) -> Self {
        Self::synthetic(cid, SCT_GENERIC, SC_ABORTED_BY_REQUEST, dnr)
    }

    pub fn aborted_sq_deletion(cid: u16) -> Self {
        Self::synthetic(cid, SCT_GENERIC, SC_ABORTED_SQ_DELETION, false)
    }

    pub fn invalid_field(cid: u16) -> Self {
        Self::synthetic(cid, SCT_GENERIC, SC_INVALID_FIELD, true)
    }

    pub fn phase(&self) -> bool {
        (self.status & STATUS_PHASE_TAG_MASK) != 0
    }

    pub fn status_code(&self) -> u8 {
        ((self.status >> 1) & 0xFF) as u8
    }

    pub fn status_code_type(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    pub fn dnr(&self) -> bool {
        (self.status >> 15) & 1 == 1
    }

    /// Whether this completion indicates a successful command (status code 0, no DNR/SC bits
    /// set).
    pub fn is_success(&self) -> bool {
        !self.has_error()
    }

    /// Whether the Status Code / Status Code Type / DNR bits indicate failure.
    pub fn has_error(&self) -> bool {
        (self.status & STATUS_ERROR_MASK) != 0
    }

    /// Whether this failure is worth transparently retrying, following the same
    /// status-code-type/status-code classification the original source uses.
    pub fn is_transient(&self) -> bool {
        if !self.has_error() {
            return false;
        }
        match self.status_code_type() {
            SCT_GENERIC => matches!(
                self.status_code(),
                SC_NAMESPACE_NOT_READY | SC_FORMAT_IN_PROGRESS
            ),
            SCT_PATH_RELATED => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_completion_has_no_error() {
        let cpl = NvmeCompletion::synthetic(3, SCT_GENERIC, SC_SUCCESS, false);
        assert!(!cpl.has_error());
        assert!(cpl.is_success());
    }

    #[test]
    fn namespace_not_ready_is_transient() {
        let cpl = NvmeCompletion::synthetic(1, SCT_GENERIC, SC_NAMESPACE_NOT_READY, false);
        assert!(cpl.has_error());
        assert!(cpl.is_transient());
    }

    #[test]
    fn aborted_by_request_is_not_transient() {
        let cpl = NvmeCompletion::aborted_by_request(2, true);
        assert!(cpl.has_error());
        assert!(!cpl.is_transient());
        assert!(cpl.dnr());
    }

    #[test]
    fn command_struct_is_64_bytes() {
        assert_eq!(core::mem::size_of::<NvmeCommand>(), 64);
    }

    #[test]
    fn completion_struct_is_16_bytes() {
        assert_eq!(core::mem::size_of::<NvmeCompletion>(), 16);
    }
}
