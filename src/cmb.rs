// SPDX-License-Identifier: MPL-2.0

//! Controller Memory Buffer (CMB) discovery and bump allocation.

use bit_field::BitField;

use crate::error::NvmeCoreError;
use crate::host::{BarMapping, Host};
use crate::nvme_regs::{NvmeRegs32, RegisterWindow};

/// Bump allocator over an optional on-controller memory buffer.
pub struct CmbManager {
    bar: u8,
    mapping: BarMapping,
    /// Offset of the CMB window within the mapped BAR.
    window_offset: usize,
    size: usize,
    cursor: usize,
    sqs_supported: bool,
    unmapped: bool,
}

fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl CmbManager {
    /// Reads CMBSZ/CMBLOC and, if the controller advertises a usable CMB, maps its BAR.
    /// Returns `None` if no CMB is present or the advertised window is unusable — per spec, this
    /// silently disables CMB use rather than failing controller construction.
    pub fn discover<H: Host>(host: &H, regs: &RegisterWindow<'_, H>) -> Option<Self> {
        let cmbsz = regs.read32(NvmeRegs32::Cmbsz) as u64;
        let sz = cmbsz.get_bits(12..32);
        if sz == 0 {
            return None;
        }
        let szu = cmbsz.get_bits(8..12);
        let sqs_supported = cmbsz.get_bit(0);

        let cmbloc = regs.read32(NvmeRegs32::Cmbloc) as u64;
        let bir = cmbloc.get_bits(0..3) as u8;
        if bir == 1 || bir > 5 {
            return None;
        }
        let ofst = cmbloc.get_bits(12..32);

        let unit_size = 1usize << (12 + 4 * szu);
        let size = unit_size * sz as usize;
        let window_offset = unit_size * ofst as usize;

        let mapping = host.map_bar(bir).ok()?;
        if window_offset + size > mapping.size {
            host.unmap_bar(bir, &mapping);
            return None;
        }

        Some(Self {
            bar: bir,
            mapping,
            window_offset,
            size,
            cursor: 0,
            sqs_supported,
            unmapped: false,
        })
    }

    pub fn sqs_supported(&self) -> bool {
        self.sqs_supported
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Rounds `self.cursor` up to `alignment` and reserves `length` bytes from it. Never
    /// deallocates; freed en masse only via `unmap_cmb` at controller teardown.
    pub fn alloc_cmb(&mut self, length: usize, alignment: usize) -> Result<usize, NvmeCoreError> {
        debug_assert!(alignment.is_power_of_two());
        let offset = align_up(self.cursor, alignment);
        if offset + length > self.size {
            return Err(NvmeCoreError::OutOfCmbSpace);
        }
        self.cursor = offset + length;
        Ok(offset)
    }

    pub fn virt_ptr(&self, offset: usize) -> *mut u8 {
        unsafe { self.mapping.virt_base.add(self.window_offset + offset) }
    }

    pub fn phys_addr(&self, offset: usize) -> u64 {
        self.mapping.phys_base + (self.window_offset + offset) as u64
    }

    /// Idempotent teardown.
    pub fn unmap_cmb<H: Host>(&mut self, host: &H) {
        if self.unmapped {
            return;
        }
        host.unmap_bar(self.bar, &self.mapping);
        self.unmapped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHost;

    #[test]
    fn alloc_respects_alignment_and_never_overlaps() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut cmb = CmbManager::discover(&host, &regs).expect("mock host advertises a CMB");

        let o1 = cmb.alloc_cmb(100, 64).unwrap();
        assert_eq!(o1 % 64, 0);
        let o2 = cmb.alloc_cmb(200, 256).unwrap();
        assert_eq!(o2 % 256, 0);
        assert!(o2 >= o1 + 100);
    }

    #[test]
    fn alloc_fails_past_cmb_end() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut cmb = CmbManager::discover(&host, &regs).unwrap();
        let size = cmb.size();
        assert_eq!(
            cmb.alloc_cmb(size + 1, 4096),
            Err(NvmeCoreError::OutOfCmbSpace)
        );
    }

    #[test]
    fn no_cmb_advertised_yields_none() {
        let host = MockHost::without_cmb();
        let regs = host.register_window();
        assert!(CmbManager::discover(&host, &regs).is_none());
    }
}
