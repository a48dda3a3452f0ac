// SPDX-License-Identifier: MPL-2.0

//! Tracker pool: the fixed-size array of in-flight command slots backing a queue pair.
//!
//! Per spec, `cid == array index` is the invariant that makes completion lookup O(1). The
//! host-side bookkeeping (`Tracker`) is an ordinary heap struct; only the PRP list / SGL
//! descriptor storage each tracker owns needs to be DMA-resident and non-page-straddling, so that
//! storage is split into one shared DMA region sized `count * slot_size` (see DESIGN.md).

use alloc::vec::Vec;

use crate::error::NvmeCoreError;
use crate::host::{DmaRegion, Host};
use crate::request::Request;

/// Bytes reserved per tracker for its PRP list / SGL descriptor array. A power of two dividing
/// 4096 guarantees no slot straddles a page.
pub const SLOT_SIZE: usize = 512;

/// A single in-flight (or free) command slot.
pub struct Tracker {
    pub cid: u16,
    pub active: bool,
    pub req: Option<Request>,
    /// Device-visible physical address of this tracker's descriptor slot.
    pub prp_sgl_bus_addr: u64,
    /// Host virtual address of this tracker's descriptor slot, within the pool's shared DMA
    /// region.
    descriptor_virt: *mut u8,
}

impl Tracker {
    /// Number of `u64` PRP entries that fit in this tracker's descriptor slot.
    pub fn prp_list_capacity_hint(&self) -> usize {
        SLOT_SIZE / core::mem::size_of::<u64>()
    }

    /// Number of 16-byte SGL descriptors that fit in this tracker's descriptor slot.
    pub fn sgl_capacity_hint(&self) -> usize {
        SLOT_SIZE / 16
    }

    /// # Safety
    /// `T` must fit within `SLOT_SIZE` bytes and this tracker's owning `TrackerPool` must still be
    /// alive.
    pub unsafe fn descriptor_ptr<T>(&self) -> *mut T {
        self.descriptor_virt as *mut T
    }
}

/// Owns the tracker array plus the shared DMA region backing every tracker's descriptor slot.
pub struct TrackerPool {
    trackers: Vec<Tracker>,
    free: Vec<u16>,
    descriptors: DmaRegion,
}

impl TrackerPool {
    pub fn new<H: Host>(host: &H, count: usize) -> Result<Self, NvmeCoreError> {
        let descriptors = host
            .dma_zalloc(count * SLOT_SIZE, SLOT_SIZE)
            .ok_or(NvmeCoreError::OutOfMemory)?;

        let mut trackers = Vec::with_capacity(count);
        let mut free = Vec::with_capacity(count);
        for i in 0..count {
            let cid = i as u16;
            let slot_offset = i * SLOT_SIZE;
            trackers.push(Tracker {
                cid,
                active: false,
                req: None,
                prp_sgl_bus_addr: descriptors.phys_at(slot_offset),
                descriptor_virt: unsafe { descriptors.as_mut_ptr::<u8>(slot_offset) },
            });
            free.push(cid);
        }

        Ok(Self {
            trackers,
            free,
            descriptors,
        })
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Pops a free tracker's cid, moving it conceptually onto `outstanding_tr` (tracked purely by
    /// the caller setting `active = true`).
    pub fn pop_free(&mut self) -> Option<u16> {
        self.free.pop()
    }

    /// Returns a tracker to the free pool. Caller must have already cleared `active` and `req`.
    pub fn push_free(&mut self, cid: u16) {
        debug_assert!(!self.trackers[cid as usize].active);
        self.free.push(cid);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn get(&self, cid: u16) -> &Tracker {
        &self.trackers[cid as usize]
    }

    pub fn get_mut(&mut self, cid: u16) -> &mut Tracker {
        &mut self.trackers[cid as usize]
    }

    /// Iterates every tracker currently marked active, in array order.
    pub fn outstanding(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter().filter(|t| t.active)
    }

    /// Cids of every currently active tracker, snapshotted (so callers may mutate the pool while
    /// iterating the result, matching the "restart iteration after each removal" pattern used by
    /// AER aborts).
    pub fn outstanding_cids(&self) -> Vec<u16> {
        self.trackers
            .iter()
            .filter(|t| t.active)
            .map(|t| t.cid)
            .collect()
    }

    /// Frees the shared descriptor region. Called by `QueuePair::destroy`.
    pub fn destroy<H: Host>(&self, host: &H) {
        host.dma_free(&self.descriptors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHost;

    #[test]
    fn free_list_starts_full_and_cid_equals_index() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 8).unwrap();
        assert_eq!(pool.free_count(), 8);
        for i in 0..8u16 {
            assert_eq!(pool.get(i).cid, i);
        }
    }

    #[test]
    fn pop_and_push_free_round_trips() {
        let host = MockHost::new();
        let mut pool = TrackerPool::new(&host, 4).unwrap();
        let cid = pool.pop_free().unwrap();
        assert_eq!(pool.free_count(), 3);
        pool.get_mut(cid).active = false;
        pool.push_free(cid);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn descriptor_slots_do_not_straddle_a_page() {
        let host = MockHost::new();
        let pool = TrackerPool::new(&host, 16).unwrap();
        for i in 0..16u16 {
            let addr = pool.get(i).prp_sgl_bus_addr;
            let start_page = addr / 4096;
            let end_page = (addr + SLOT_SIZE as u64 - 1) / 4096;
            assert_eq!(start_page, end_page);
        }
    }
}
