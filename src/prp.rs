// SPDX-License-Identifier: MPL-2.0

//! PRP / SGL builders: translate a request's payload description into NVMe data pointers.

use alloc::vec::Vec;
use zerocopy::AsBytes;

use crate::cmd::NvmeCommand;
use crate::error::NvmeCoreError;
use crate::host::Host;
use crate::request::ScatterGatherPayload;
use crate::tracker::Tracker;

const PAGE_SIZE: usize = 4096;

const SGL_TYPE_DATA_BLOCK: u8 = 0x0 << 4;
const SGL_TYPE_LAST_SEGMENT: u8 = 0x3 << 4;

/// A single NVMe SGL descriptor (16 bytes).
#[repr(C)]
#[derive(Copy, Clone, zerocopy::AsBytes, zerocopy::FromZeroes, zerocopy::FromBytes)]
struct SglDescriptor {
    address: u64,
    length: u32,
    reserved: [u8; 3],
    sgl_identifier: u8,
}

impl SglDescriptor {
    fn data_block(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            reserved: [0; 3],
            sgl_identifier: SGL_TYPE_DATA_BLOCK,
        }
    }

    fn last_segment(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            reserved: [0; 3],
            sgl_identifier: SGL_TYPE_LAST_SEGMENT,
        }
    }

    fn as_dptr(&self) -> [u64; 2] {
        let bytes = self.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[0..8]);
        hi.copy_from_slice(&bytes[8..16]);
        [u64::from_ne_bytes(lo), u64::from_ne_bytes(hi)]
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Builder (a): a single virtually-contiguous buffer, encoded as PRP.
pub fn build_contig<H: Host>(
    host: &H,
    tracker: &Tracker,
    cmd: &mut NvmeCommand,
    virt: *const u8,
    len: usize,
    metadata: Option<*const u8>,
) -> Result<(), NvmeCoreError> {
    let phys_addr = host.vtophys(virt).ok_or(NvmeCoreError::BadTranslation)?;
    let unaligned = (phys_addr % PAGE_SIZE as u64) as usize;
    let nseg = ceil_div(len + unaligned, PAGE_SIZE).max(1);

    cmd.set_psdt_prp();
    cmd.dptr[0] = phys_addr;

    match nseg {
        1 => cmd.dptr[1] = 0,
        2 => {
            let next_page = unsafe { virt.add(PAGE_SIZE - unaligned) };
            cmd.dptr[1] = host.vtophys(next_page).ok_or(NvmeCoreError::BadTranslation)?;
        }
        _ => {
            if nseg - 1 > tracker.prp_list_capacity_hint() {
                return Err(NvmeCoreError::TooManySegments);
            }
            cmd.dptr[1] = tracker.prp_sgl_bus_addr;
            let list_ptr: *mut u64 = unsafe { tracker.descriptor_ptr() };
            for i in 0..(nseg - 1) {
                let page_virt = unsafe { virt.add(PAGE_SIZE - unaligned + i * PAGE_SIZE) };
                let p = host.vtophys(page_virt).ok_or(NvmeCoreError::BadTranslation)?;
                unsafe { core::ptr::write(list_ptr.add(i), p) };
            }
        }
    }

    if let Some(meta) = metadata {
        cmd.mptr = host.vtophys(meta).ok_or(NvmeCoreError::BadTranslation)?;
    }
    Ok(())
}

/// Builder (b): a scattered payload encoded as a hardware SGL (controller supports SGL).
pub fn build_sgl(
    tracker: &Tracker,
    cmd: &mut NvmeCommand,
    sgl: &mut dyn ScatterGatherPayload,
    payload_size: u32,
) -> Result<(), NvmeCoreError> {
    sgl.reset_sgl(0);
    let capacity = tracker.sgl_capacity_hint();
    let descriptors: *mut SglDescriptor = unsafe { tracker.descriptor_ptr() };

    let mut total = 0u32;
    let mut count = 0usize;
    while total < payload_size {
        let (phys, length) = sgl.next_sge().ok_or(NvmeCoreError::BadTranslation)?;
        if count >= capacity {
            return Err(NvmeCoreError::TooManySegments);
        }
        unsafe { core::ptr::write(descriptors.add(count), SglDescriptor::data_block(phys, length)) };
        total += length;
        count += 1;
    }

    cmd.set_psdt_sgl_mptr_sgl();
    if count == 1 {
        let only = unsafe { core::ptr::read(descriptors) };
        cmd.dptr = only.as_dptr();
    } else {
        let size = (count * core::mem::size_of::<SglDescriptor>()) as u32;
        let last_segment = SglDescriptor::last_segment(tracker.prp_sgl_bus_addr, size);
        cmd.dptr = last_segment.as_dptr();
    }
    Ok(())
}

/// Builder (c): a scattered payload encoded as PRP (controller does not support SGL). Each
/// segment must be PRP-compatible: 4-byte aligned, and, if not the final segment, ending exactly
/// on a page boundary. This flattens the per-segment page list before applying the same
/// prp1/prp2/prp-list assignment rule as the contiguous builder (see DESIGN.md for why this
/// differs structurally from the original's single-pass state machine while producing the same
/// encoding).
pub fn build_prp_sgl(
    tracker: &Tracker,
    cmd: &mut NvmeCommand,
    sgl: &mut dyn ScatterGatherPayload,
    payload_size: u32,
) -> Result<(), NvmeCoreError> {
    sgl.reset_sgl(0);

    let mut total = 0u32;
    let mut pages: Vec<u64> = Vec::new();
    while total < payload_size {
        let (phys, length) = sgl.next_sge().ok_or(NvmeCoreError::BadTranslation)?;
        let is_last_sge = total + length >= payload_size;

        if phys % 4 != 0 {
            return Err(NvmeCoreError::NotPrpCompatible);
        }
        if !is_last_sge && (phys + length as u64) % PAGE_SIZE as u64 != 0 {
            return Err(NvmeCoreError::NotPrpCompatible);
        }

        let unaligned = (phys % PAGE_SIZE as u64) as usize;
        let seg_nseg = ceil_div(length as usize + unaligned, PAGE_SIZE).max(1);
        for page in 0..seg_nseg {
            let page_phys = if page == 0 {
                phys
            } else {
                phys - unaligned as u64 + (page as u64) * PAGE_SIZE as u64
            };
            pages.push(page_phys);
        }
        total += length;
    }

    if pages.is_empty() {
        return Err(NvmeCoreError::BadTranslation);
    }

    cmd.set_psdt_prp();
    cmd.dptr[0] = pages[0];
    match pages.len() {
        1 => cmd.dptr[1] = 0,
        2 => cmd.dptr[1] = pages[1],
        _ => {
            if pages.len() - 1 > tracker.prp_list_capacity_hint() {
                return Err(NvmeCoreError::TooManySegments);
            }
            cmd.dptr[1] = tracker.prp_sgl_bus_addr;
            let list_ptr: *mut u64 = unsafe { tracker.descriptor_ptr() };
            for (i, p) in pages[1..].iter().enumerate() {
                unsafe { core::ptr::write(list_ptr.add(i), *p) };
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedSgl, MockHost};
    use crate::tracker::TrackerPool;

    #[test]
    fn s1_single_page_write() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_write(0, 1, 0, 0);

        let virt = host.vtophys_fixture(0x100000, 4096);
        build_contig(&host, tracker, &mut cmd, virt, 4096, None).unwrap();

        assert_eq!(cmd.dptr[0], 0x100000);
        assert_eq!(cmd.dptr[1], 0);
    }

    #[test]
    fn s2_two_page_unaligned_read() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_read(0, 1, 0, 0);

        let base_phys = 0x200000u64 + 0x800;
        let virt = host.vtophys_fixture(base_phys, 4096);
        build_contig(&host, tracker, &mut cmd, virt, 4096, None).unwrap();

        assert_eq!(cmd.dptr[0], base_phys);
        assert_eq!(cmd.dptr[1], base_phys - 0x800 + 4096);
    }

    #[test]
    fn s3_three_page_transfer() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_write(0, 1, 0, 0);

        let base_phys = 0x300000u64;
        let virt = host.vtophys_fixture(base_phys, 3 * 4096);
        build_contig(&host, tracker, &mut cmd, virt, 3 * 4096, None).unwrap();

        assert_eq!(cmd.dptr[0], base_phys);
        assert_eq!(cmd.dptr[1], tracker.prp_sgl_bus_addr);
        let list_ptr: *const u64 = unsafe { tracker.descriptor_ptr() };
        unsafe {
            assert_eq!(*list_ptr.add(0), base_phys + 4096);
            assert_eq!(*list_ptr.add(1), base_phys + 8192);
        }
    }

    #[test]
    fn sgl_single_descriptor_is_inlined() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_write(0, 1, 0, 0);
        let mut sgl = FixedSgl::new(alloc::vec![(0x500000, 4096)]);

        build_sgl(tracker, &mut cmd, &mut sgl, 4096).unwrap();
        assert_eq!(cmd.dptr[0], 0x500000);
        assert_eq!(cmd.dptr[1], 4096);
    }

    #[test]
    fn sgl_multi_descriptor_uses_last_segment() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_write(0, 1, 0, 0);
        let mut sgl = FixedSgl::new(alloc::vec![(0x600000, 4096), (0x700000, 4096)]);

        build_sgl(tracker, &mut cmd, &mut sgl, 8192).unwrap();
        assert_eq!(cmd.dptr[0], tracker.prp_sgl_bus_addr);
    }

    #[test]
    fn prp_sgl_rejects_non_final_segment_not_page_aligned_end() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 4).unwrap();
        let tracker = pool.get(0);
        let mut cmd = NvmeCommand::io_write(0, 1, 0, 0);
        let mut sgl = FixedSgl::new(alloc::vec![(0x800000, 100), (0x900000, 4096)]);

        assert_eq!(
            build_prp_sgl(tracker, &mut cmd, &mut sgl, 4196),
            Err(NvmeCoreError::NotPrpCompatible)
        );
    }
}
