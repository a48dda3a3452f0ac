// SPDX-License-Identifier: MPL-2.0

//! NVMe Controller Register Window.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Section 3.1.

use bit_field::BitField;
use volatile::Volatile;

use crate::host::Host;

/// 32-bit Controller Registers.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
#[allow(dead_code)]
pub enum NvmeRegs32 {
    /// Version (VS): Indicates the NVMe specification version.
    Vs = 0x8,
    /// Interrupt Mask Set (INTMS): Used to set interrupt mask bits.
    Intms = 0xC,
    /// Interrupt Mask Clear (INTMC): Used to clear interrupt mask bits.
    Intmc = 0x10,
    /// Controller Configuration (CC): Used to configure the controller.
    Cc = 0x14,
    /// Controller Status (CSTS): Reports status of the controller.
    Csts = 0x1C,
    /// NVM Subsystem Reset (NSSR): Used to reset the NVM subsystem.
    Nssr = 0x20,
    /// Admin Queue Attributes (AQA): Defines the size of Admin Queues.
    Aqa = 0x24,
    /// Controller Memory Buffer Location (CMBLOC).
    Cmbloc = 0x38,
    /// Controller Memory Buffer Size (CMBSZ).
    Cmbsz = 0x3C,
}

/// 64-bit Controller Registers.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
#[allow(dead_code)]
pub enum NvmeRegs64 {
    /// Controller Capabilities (CAP): Identifies basic capabilities.
    Cap = 0x0,
    /// Admin Submission Queue Base Address (ASQ).
    Asq = 0x28,
    /// Admin Completion Queue Base Address (ACQ).
    Acq = 0x30,
    /// Controller Memory Buffer Memory Space Control (CMBMSC).
    Cmbmsc = 0x50,
}

/// Doorbell register selector.
///
/// Doorbell registers live at offset `0x1000` followed by a stride-indexed array: for queue
/// `qid`, SQ tail doorbell is at index `2*qid`, CQ head doorbell at index `2*qid + 1`.
#[derive(Copy, Clone, Debug)]
pub enum NvmeDoorbellRegs {
    Sqtdb,
    Cqhdb,
}

const DOORBELL_BASE: u32 = 0x1000;

impl NvmeDoorbellRegs {
    /// Computes the byte offset of this doorbell for queue `qid`, given the doorbell stride in
    /// `u32` units (`1 << dstrd`).
    pub fn offset(&self, qid: u16, dstrd_u32: u32) -> u32 {
        let stride = dstrd_u32 * 4;
        match self {
            NvmeDoorbellRegs::Sqtdb => DOORBELL_BASE + (2 * qid as u32) * stride,
            NvmeDoorbellRegs::Cqhdb => DOORBELL_BASE + (2 * qid as u32 + 1) * stride,
        }
    }
}

/// Fields extracted from the 64-bit CAP register.
#[derive(Debug, Copy, Clone)]
pub struct ControllerCapabilities {
    /// Maximum queue entries supported, 0's based (actual max is `mqes + 1`).
    pub mqes: u16,
    /// Doorbell stride in `u32` units (`1 << dstrd`).
    pub dstrd_u32: u32,
    /// Worst-case time (in 500ms units) to wait for CSTS.RDY after CC.EN is flipped.
    pub timeout_500ms_units: u8,
    /// Minimum host memory page size, `2^(12 + mpsmin)` bytes.
    pub mpsmin: u8,
}

impl ControllerCapabilities {
    fn from_raw(cap: u64) -> Self {
        Self {
            mqes: cap.get_bits(0..16) as u16,
            dstrd_u32: 1u32 << cap.get_bits(32..36),
            timeout_500ms_units: cap.get_bits(24..32) as u8,
            mpsmin: cap.get_bits(48..52) as u8,
        }
    }
}

/// Typed volatile window over the controller's MMIO register file (BAR0).
///
/// All accesses are bounds-checked by the caller (per spec §4.1, "callers have pre-validated the
/// ranges"); this type performs the single-instruction volatile load/store and the doorbell
/// address arithmetic.
pub struct RegisterWindow<'h, H: Host> {
    host: &'h H,
    base: *mut u8,
    regs_size: usize,
}

impl<'h, H: Host> RegisterWindow<'h, H> {
    /// # Safety
    /// `base` must point to a live MMIO mapping of at least `regs_size` bytes for the lifetime of
    /// this `RegisterWindow`.
    pub unsafe fn new(host: &'h H, base: *mut u8, regs_size: usize) -> Self {
        Self {
            host,
            base,
            regs_size,
        }
    }

    fn addr(&self, offset: u32) -> *mut u8 {
        unsafe { self.base.add(offset as usize) }
    }

    pub fn get_reg_4(&self, offset: u32) -> u32 {
        debug_assert!((offset as usize) + 4 <= self.regs_size);
        unsafe { self.host.mmio_read32(self.addr(offset)) }
    }

    pub fn set_reg_4(&self, offset: u32, value: u32) {
        debug_assert!((offset as usize) + 4 <= self.regs_size);
        unsafe { self.host.mmio_write32(self.addr(offset), value) }
    }

    pub fn get_reg_8(&self, offset: u32) -> u64 {
        debug_assert!((offset as usize) + 8 <= self.regs_size);
        unsafe { self.host.mmio_read64(self.addr(offset)) }
    }

    pub fn set_reg_8(&self, offset: u32, value: u64) {
        debug_assert!((offset as usize) + 8 <= self.regs_size);
        unsafe { self.host.mmio_write64(self.addr(offset), value) }
    }

    pub fn read32(&self, reg: NvmeRegs32) -> u32 {
        self.get_reg_4(reg as u32)
    }

    pub fn write32(&self, reg: NvmeRegs32, value: u32) {
        self.set_reg_4(reg as u32, value)
    }

    pub fn read64(&self, reg: NvmeRegs64) -> u64 {
        self.get_reg_8(reg as u32)
    }

    pub fn write64(&self, reg: NvmeRegs64, value: u64) {
        self.set_reg_8(reg as u32, value)
    }

    pub fn capabilities(&self) -> ControllerCapabilities {
        ControllerCapabilities::from_raw(self.read64(NvmeRegs64::Cap))
    }

    /// Writes `val` to the doorbell identified by `(reg, qid)`, preceded by a write-memory-barrier
    /// that orders prior host DMA writes (the SQ entry and any PRP page) before the doorbell.
    ///
    /// This is the only place callers should write a doorbell — it guarantees the ordering
    /// invariant from spec §5 holds at every call site.
    pub fn write_doorbell(&self, reg: NvmeDoorbellRegs, qid: u16, dstrd_u32: u32, val: u32) {
        self.host.wmb();
        let offset = reg.offset(qid, dstrd_u32);
        self.set_reg_4(offset, val);
    }

    /// Exposes a typed `Volatile<u32>` view for direct inspection (used by tests and by callers
    /// that want the `volatile` crate's API directly instead of the offset-based accessors).
    pub fn volatile_u32(&self, offset: u32) -> Volatile<&u32> {
        debug_assert!((offset as usize) + 4 <= self.regs_size);
        Volatile::new(unsafe { &*(self.addr(offset) as *const u32) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_follow_stride() {
        // dstrd_u32 = 1 -> stride of 1 u32 (4 bytes)
        assert_eq!(NvmeDoorbellRegs::Sqtdb.offset(0, 1), 0x1000);
        assert_eq!(NvmeDoorbellRegs::Cqhdb.offset(0, 1), 0x1004);
        assert_eq!(NvmeDoorbellRegs::Sqtdb.offset(1, 1), 0x1008);
        assert_eq!(NvmeDoorbellRegs::Cqhdb.offset(1, 1), 0x100C);

        // dstrd_u32 = 2 -> stride of 2 u32s (8 bytes)
        assert_eq!(NvmeDoorbellRegs::Sqtdb.offset(0, 2), 0x1000);
        assert_eq!(NvmeDoorbellRegs::Cqhdb.offset(0, 2), 0x1008);
        assert_eq!(NvmeDoorbellRegs::Sqtdb.offset(1, 2), 0x1010);
    }

    #[test]
    fn capabilities_decode_matches_spec_fields() {
        // mqes=63 (0-based), dstrd=1 (stride=2), timeout=20, mpsmin=0
        let raw: u64 = 63 | (1u64 << 32) | (20u64 << 24) | (0u64 << 48);
        let caps = ControllerCapabilities::from_raw(raw);
        assert_eq!(caps.mqes, 63);
        assert_eq!(caps.dstrd_u32, 2);
        assert_eq!(caps.timeout_500ms_units, 20);
        assert_eq!(caps.mpsmin, 0);
    }
}
