// SPDX-License-Identifier: MPL-2.0

//! Test-only fakes: a `Host` implementation backed by heap memory, and a fixed scatter-gather
//! payload for exercising the PRP/SGL builders without a real device.

#![cfg(test)]

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::cell::RefCell;

use crate::error::NvmeCoreError;
use crate::host::{BarMapping, DmaRegion, Host, PciIdentity};
use crate::nvme_regs::RegisterWindow;
use crate::request::ScatterGatherPayload;

const BAR0_SIZE: usize = 0x2000;
const CMB_SIZE: usize = 16 * 4096;

/// `Host` implementation over plain heap memory. Registers and doorbells live in a boxed byte
/// buffer; `vtophys` is the identity function, since nothing here dereferences the "physical"
/// address — it only ever round-trips through the builder's address arithmetic.
pub struct MockHost {
    bar0: Box<[u8]>,
    cmb: Option<Box<[u8]>>,
    allocations: RefCell<Vec<(usize, Layout)>>,
}

impl MockHost {
    /// A host whose controller advertises a 64 KiB CMB at BAR 2, SQS-capable.
    pub fn new() -> Self {
        let mut bar0 = alloc::vec![0u8; BAR0_SIZE].into_boxed_slice();
        // CAP: mqes=63, dstrd=1 (stride 2 u32s), timeout=20, mpsmin=0
        let cap: u64 = 63 | (1 << 32) | (20 << 24);
        bar0[0..8].copy_from_slice(&cap.to_ne_bytes());
        // CMBLOC: bir=2, ofst=0
        bar0[0x38..0x3C].copy_from_slice(&2u32.to_ne_bytes());
        // CMBSZ: sqs=1, szu=0 (unit=4096), sz=16 (total 64 KiB)
        let cmbsz: u32 = (16 << 12) | (0 << 8) | 1;
        bar0[0x3C..0x40].copy_from_slice(&cmbsz.to_ne_bytes());

        Self {
            bar0,
            cmb: Some(alloc::vec![0u8; CMB_SIZE].into_boxed_slice()),
            allocations: RefCell::new(Vec::new()),
        }
    }

    /// A host whose controller advertises no CMB at all.
    pub fn without_cmb() -> Self {
        let mut bar0 = alloc::vec![0u8; BAR0_SIZE].into_boxed_slice();
        let cap: u64 = 63 | (1 << 32) | (20 << 24);
        bar0[0..8].copy_from_slice(&cap.to_ne_bytes());
        Self {
            bar0,
            cmb: None,
            allocations: RefCell::new(Vec::new()),
        }
    }

    /// Builds a `RegisterWindow` over BAR0.
    pub fn register_window(&self) -> RegisterWindow<'_, Self> {
        unsafe { RegisterWindow::new(self, self.bar0.as_ptr() as *mut u8, self.bar0.len()) }
    }

    /// Returns a fixture pointer whose `vtophys` translation is exactly `phys`. `len` documents
    /// the intended span at call sites; it is not separately enforced since translation here is
    /// the identity function.
    pub fn vtophys_fixture(&self, phys: u64, _len: usize) -> *const u8 {
        phys as *const u8
    }
}

impl Host for MockHost {
    fn map_bar(&self, bar: u8) -> Result<BarMapping, NvmeCoreError> {
        match bar {
            0 => Ok(BarMapping {
                virt_base: self.bar0.as_ptr() as *mut u8,
                phys_base: 0xF000_0000,
                size: self.bar0.len(),
            }),
            2 => {
                let cmb = self.cmb.as_ref().ok_or(NvmeCoreError::BadBarMapping)?;
                Ok(BarMapping {
                    virt_base: cmb.as_ptr() as *mut u8,
                    phys_base: 0xE000_0000,
                    size: cmb.len(),
                })
            }
            _ => Err(NvmeCoreError::BadBarMapping),
        }
    }

    fn unmap_bar(&self, _bar: u8, _mapping: &BarMapping) {}

    fn cfg_read32(&self, _offset: u16) -> u32 {
        0
    }

    fn cfg_write32(&self, _offset: u16, _value: u32) {}

    fn pci_identity(&self) -> PciIdentity {
        PciIdentity::default()
    }

    fn dma_zalloc(&self, size: usize, align: usize) -> Option<DmaRegion> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        self.allocations.borrow_mut().push((ptr as usize, layout));
        Some(DmaRegion {
            virt: ptr,
            phys: ptr as u64,
            len: size,
        })
    }

    fn dma_free(&self, region: &DmaRegion) {
        let mut allocations = self.allocations.borrow_mut();
        if let Some(pos) = allocations
            .iter()
            .position(|(addr, _)| *addr == region.virt as usize)
        {
            let (_, layout) = allocations.remove(pos);
            unsafe { dealloc(region.virt, layout) };
        }
    }

    fn vtophys(&self, virt: *const u8) -> Option<u64> {
        Some(virt as u64)
    }

    unsafe fn mmio_read32(&self, addr: *const u8) -> u32 {
        unsafe { core::ptr::read_unaligned(addr as *const u32) }
    }

    unsafe fn mmio_read64(&self, addr: *const u8) -> u64 {
        unsafe { core::ptr::read_unaligned(addr as *const u64) }
    }

    unsafe fn mmio_write32(&self, addr: *mut u8, value: u32) {
        unsafe { core::ptr::write_unaligned(addr as *mut u32, value) };
    }

    unsafe fn mmio_write64(&self, addr: *mut u8, value: u64) {
        unsafe { core::ptr::write_unaligned(addr as *mut u64, value) };
    }

    fn wmb(&self) {}
}

/// A scatter-gather payload with a fixed, pre-built segment list — enough to exercise the SGL and
/// scattered-PRP builders without a real payload behind it.
pub struct FixedSgl {
    segments: Vec<(u64, u32)>,
    index: usize,
}

impl FixedSgl {
    pub fn new(segments: Vec<(u64, u32)>) -> Self {
        Self { segments, index: 0 }
    }
}

impl ScatterGatherPayload for FixedSgl {
    fn reset_sgl(&mut self, _offset: u64) {
        self.index = 0;
    }

    fn next_sge(&mut self) -> Option<(u64, u32)> {
        let seg = self.segments.get(self.index).copied();
        if seg.is_some() {
            self.index += 1;
        }
        seg
    }
}
