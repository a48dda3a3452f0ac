// SPDX-License-Identifier: MPL-2.0

//! Queue Pair Engine: owns the SQ/CQ rings, the tracker pool, and the queued-request backlog.

use alloc::collections::VecDeque;
use core::sync::atomic::{fence, Ordering};

use log::warn;

use crate::cmb::CmbManager;
use crate::cmd::{AdminOpcode, NvmeCommand, NvmeCompletion};
use crate::error::NvmeCoreError;
use crate::host::{DmaRegion, Host};
use crate::nvme_regs::{NvmeDoorbellRegs, RegisterWindow};
use crate::prp::{build_contig, build_prp_sgl, build_sgl};
use crate::request::{PayloadDescriptor, Request};
use crate::tracker::TrackerPool;

const NVME_CMD_SIZE: usize = core::mem::size_of::<NvmeCommand>();
const NVME_CPL_SIZE: usize = core::mem::size_of::<NvmeCompletion>();

/// Where a queue pair's SQ memory lives.
enum SqBacking {
    Dma(DmaRegion),
    Cmb,
}

/// Parameters fixed at queue pair construction.
pub struct QueuePairConfig {
    pub qid: u16,
    pub priority: u8,
    pub num_entries: u16,
    pub dstrd_u32: u32,
    pub supports_sgl: bool,
    pub tracker_count: usize,
    pub use_cmb_sqs: bool,
    pub global_retry_count: u8,
}

/// A submission/completion queue pair plus its tracker pool and backlog.
///
/// Doorbells are written through a borrowed `RegisterWindow`, since the orchestrator maps BAR0
/// once and shares it across the admin QP and every I/O QP.
pub struct QueuePair<'h, H: Host> {
    host: &'h H,
    regs: &'h RegisterWindow<'h, H>,
    qid: u16,
    priority: u8,
    num_entries: u16,
    dstrd_u32: u32,
    supports_sgl: bool,
    retry_budget: u32,

    sq_backing: SqBacking,
    sq_virt: *mut NvmeCommand,
    sq_bus_addr: u64,
    sq_tail: u16,

    cq: DmaRegion,
    cq_virt: *mut NvmeCompletion,
    cq_bus_addr: u64,
    cq_head: u16,
    phase: bool,

    trackers: TrackerPool,
    queued: VecDeque<Request>,

    enabled: bool,
    /// Set by the controller while a reset is in progress. Suppresses the auto-enable-on-submit
    /// behavior and the queued-backlog drain on tracker free, so requests stay parked until the
    /// controller finishes resetting and re-enables the QP itself.
    is_resetting: bool,
}

impl<'h, H: Host> QueuePair<'h, H> {
    /// Constructs a queue pair per §4.4.1: SQ in CMB if requested and available, CQ always in
    /// host DMA memory, tracker pool sized by the caller.
    pub fn new(
        host: &'h H,
        regs: &'h RegisterWindow<'h, H>,
        config: QueuePairConfig,
        cmb: Option<&mut CmbManager>,
    ) -> Result<Self, NvmeCoreError> {
        let sq_bytes = config.num_entries as usize * NVME_CMD_SIZE;

        let (sq_backing, sq_virt, sq_bus_addr) = if config.qid != 0 && config.use_cmb_sqs {
            if let Some(cmb) = cmb {
                let offset = cmb.alloc_cmb(sq_bytes, 4096)?;
                (
                    SqBacking::Cmb,
                    cmb.virt_ptr(offset) as *mut NvmeCommand,
                    cmb.phys_addr(offset),
                )
            } else {
                return Err(NvmeCoreError::BadBarMapping);
            }
        } else {
            let region = host
                .dma_zalloc(sq_bytes, 4096)
                .ok_or(NvmeCoreError::OutOfMemory)?;
            let virt = region.virt as *mut NvmeCommand;
            let phys = region.phys;
            (SqBacking::Dma(region), virt, phys)
        };

        let cq_bytes = config.num_entries as usize * NVME_CPL_SIZE;
        let cq = host
            .dma_zalloc(cq_bytes, 4096)
            .ok_or(NvmeCoreError::OutOfMemory)?;
        let cq_virt = cq.virt as *mut NvmeCompletion;
        let cq_bus_addr = cq.phys;

        let trackers = TrackerPool::new(host, config.tracker_count)?;

        let mut qp = Self {
            host,
            regs,
            qid: config.qid,
            priority: config.priority,
            num_entries: config.num_entries,
            dstrd_u32: config.dstrd_u32,
            supports_sgl: config.supports_sgl,
            retry_budget: config.global_retry_count as u32,
            sq_backing,
            sq_virt,
            sq_bus_addr,
            sq_tail: 0,
            cq,
            cq_virt,
            cq_bus_addr,
            cq_head: 0,
            phase: true,
            trackers,
            queued: VecDeque::new(),
            enabled: false,
            is_resetting: false,
        };
        qp.reset();
        Ok(qp)
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn num_entries(&self) -> u16 {
        self.num_entries
    }

    pub fn sq_bus_addr(&self) -> u64 {
        self.sq_bus_addr
    }

    pub fn cq_bus_addr(&self) -> u64 {
        self.cq_bus_addr
    }

    pub fn sq_tail(&self) -> u16 {
        self.sq_tail
    }

    pub fn cq_head(&self) -> u16 {
        self.cq_head
    }

    pub fn free_tracker_count(&self) -> usize {
        self.trackers.free_count()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_resetting(&self) -> bool {
        self.is_resetting
    }

    /// Marks the QP as mid-controller-reset (or clears that mark). While set, neither
    /// `submit_request` nor `process_completions` auto-enables the QP, and `complete_tracker`
    /// does not drain `queued_req`.
    pub fn set_resetting(&mut self, resetting: bool) {
        self.is_resetting = resetting;
    }

    /// §4.4.2: zero the rings, reset indices, and the expected phase.
    pub fn reset(&mut self) {
        self.sq_tail = 0;
        self.cq_head = 0;
        self.phase = true;
        unsafe {
            core::ptr::write_bytes(self.sq_virt, 0, self.num_entries as usize);
            core::ptr::write_bytes(self.cq_virt, 0, self.num_entries as usize);
        }
    }

    /// §4.4.3: submit a request, or queue it if no tracker is free or the QP is disabled.
    pub fn submit_request(&mut self, mut req: Request) -> Result<(), NvmeCoreError> {
        if !self.enabled && !self.is_resetting {
            self.enable(self.qid == 0);
        }
        if !self.enabled {
            self.queued.push_back(req);
            return Ok(());
        }

        let Some(cid) = self.trackers.pop_free() else {
            self.queued.push_back(req);
            return Ok(());
        };

        req.cmd.cid = cid;
        if req.payload_size != 0 {
            if let Err(e) = self.build_payload(cid, &mut req) {
                self.trackers.push_free(cid);
                let cpl = NvmeCompletion::invalid_field(cid);
                req.complete(&cpl);
                return Err(e);
            }
        }

        {
            let tracker = self.trackers.get_mut(cid);
            tracker.active = true;
            tracker.req = Some(req);
        }
        self.submit_tracker(cid);
        Ok(())
    }

    fn build_payload(&self, cid: u16, req: &mut Request) -> Result<(), NvmeCoreError> {
        let tracker = self.trackers.get(cid);
        match &mut req.payload {
            PayloadDescriptor::None => Ok(()),
            PayloadDescriptor::Contiguous { virt, len } => {
                build_contig(self.host, tracker, &mut req.cmd, *virt, *len, req.metadata)
            }
            PayloadDescriptor::Sgl(sgl) => {
                if self.supports_sgl {
                    build_sgl(tracker, &mut req.cmd, sgl.as_mut(), req.payload_size)
                } else {
                    build_prp_sgl(tracker, &mut req.cmd, sgl.as_mut(), req.payload_size)
                }
            }
        }
    }

    /// Writes the tracker's bound request into the SQ and rings the doorbell. Used both by fresh
    /// submissions and by retry-resubmission (which reuses the already-built PRP/SGL fields).
    fn submit_tracker(&mut self, cid: u16) {
        let cmd = self.trackers.get(cid).req.as_ref().expect("tracker bound").cmd;
        unsafe {
            core::ptr::write(self.sq_virt.add(self.sq_tail as usize), cmd);
        }
        self.sq_tail = (self.sq_tail + 1) % self.num_entries;

        fence(Ordering::SeqCst);
        self.regs.write_doorbell(
            NvmeDoorbellRegs::Sqtdb,
            self.qid,
            self.dstrd_u32,
            self.sq_tail as u32,
        );
    }

    /// §4.4.4: drain completions whose phase bit matches, up to `max_completions` (0 = as many as
    /// possible, capped at `num_entries - 1`).
    pub fn process_completions(&mut self, max_completions: u32) -> u32 {
        if !self.enabled && !self.is_resetting {
            self.enable(self.qid == 0);
        }
        if !self.enabled {
            return 0;
        }

        let cap = if max_completions == 0 {
            self.num_entries as u32 - 1
        } else {
            max_completions
        };

        let mut processed = 0u32;
        while processed < cap {
            fence(Ordering::SeqCst);
            let entry = unsafe { core::ptr::read(self.cq_virt.add(self.cq_head as usize)) };
            if entry.phase() != self.phase {
                break;
            }

            let cid = entry.cid;
            if cid as usize >= self.trackers.len() || !self.trackers.get(cid).active {
                warn!(
                    "qid={} received completion for inactive cid={}",
                    self.qid, cid
                );
            } else {
                self.complete_tracker(cid, entry, true);
            }

            self.cq_head = (self.cq_head + 1) % self.num_entries;
            if self.cq_head == 0 {
                self.phase = !self.phase;
            }
            processed += 1;
        }

        if processed > 0 {
            self.regs.write_doorbell(
                NvmeDoorbellRegs::Cqhdb,
                self.qid,
                self.dstrd_u32,
                self.cq_head as u32,
            );
        }
        processed
    }

    /// §4.4.5: retire or retry a tracker given its completion.
    fn complete_tracker(&mut self, cid: u16, cpl: NvmeCompletion, print_on_error: bool) {
        let retries = self
            .trackers
            .get(cid)
            .req
            .as_ref()
            .map(|r| r.retries)
            .unwrap_or(0);
        let retry = cpl.has_error() && cpl.is_transient() && (retries as u32) < self.retry_budget;

        if cpl.has_error() && print_on_error {
            warn!(
                "qid={} cid={} command failed: sct={} sc={} dnr={}",
                self.qid,
                cid,
                cpl.status_code_type(),
                cpl.status_code(),
                cpl.dnr()
            );
        }

        self.trackers.get_mut(cid).active = false;

        if retry {
            let tracker = self.trackers.get_mut(cid);
            tracker.req.as_mut().unwrap().retries += 1;
            tracker.active = true;
            self.submit_tracker(cid);
            return;
        }

        let mut req = self.trackers.get_mut(cid).req.take();
        if let Some(req) = req.as_mut() {
            req.complete(&cpl);
        }
        self.trackers.push_free(cid);

        if !self.is_resetting {
            if let Some(next) = self.queued.pop_front() {
                let _ = self.submit_request(next);
            }
        }
    }

    /// §4.4.6 enable: drains outstanding trackers (callers from before a reset are gone), then
    /// marks the QP enabled. `admin` controls the abort status's DNR bit.
    pub fn enable(&mut self, admin: bool) {
        for cid in self.trackers.outstanding_cids() {
            let cpl = NvmeCompletion::aborted_by_request(cid, admin);
            self.complete_tracker(cid, cpl, true);
        }
        self.enabled = true;
    }

    /// §4.4.6 disable: for the admin QP, abort outstanding AERs; other commands are left in
    /// place. Then mark the QP disabled.
    pub fn disable(&mut self, admin: bool) {
        if admin {
            loop {
                let aer_cid = self
                    .trackers
                    .outstanding()
                    .find(|t| {
                        t.req
                            .as_ref()
                            .map(|r| r.cmd.opcode == AdminOpcode::AsyncEventRequest as u8)
                            .unwrap_or(false)
                    })
                    .map(|t| t.cid);
                let Some(cid) = aer_cid else { break };
                let cpl = NvmeCompletion::aborted_sq_deletion(cid);
                self.complete_tracker(cid, cpl, false);
            }
        }
        self.enabled = false;
    }

    /// Manually completes every outstanding tracker with an aborted, non-retryable status. Used
    /// when the controller is declared lost.
    pub fn fail(&mut self) {
        for cid in self.trackers.outstanding_cids() {
            let cpl = NvmeCompletion::aborted_by_request(cid, true);
            self.trackers.get_mut(cid).active = false;
            let mut req = self.trackers.get_mut(cid).req.take();
            if let Some(req) = req.as_mut() {
                req.complete(&cpl);
            }
            self.trackers.push_free(cid);
        }
    }

    /// Frees all queue pair memory. If admin, AERs are aborted first.
    pub fn destroy(mut self) {
        if self.qid == 0 {
            self.disable(true);
        }
        if let SqBacking::Dma(region) = &self.sq_backing {
            self.host.dma_free(region);
        }
        self.host.dma_free(&self.cq);
        self.trackers.destroy(self.host);
    }

    /// Writes a completion at the current `cq_head` with the current expected phase, so the next
    /// `process_completions` call consumes it immediately. Test-only: a real device writes these
    /// entries, not the host driver.
    #[cfg(test)]
    pub(crate) fn inject_completion_for_test(&mut self, cid: u16, sct: u8, sc: u8) {
        let mut cpl = NvmeCompletion::synthetic(cid, sct, sc, false);
        if self.phase {
            cpl.status |= crate::cmd::STATUS_PHASE_TAG_MASK;
        }
        unsafe {
            core::ptr::write(self.cq_virt.add(self.cq_head as usize), cpl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::NvmeCommand;
    use crate::request::Request;
    use crate::test_support::MockHost;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    fn make_qp<'h>(
        host: &'h MockHost,
        regs: &'h RegisterWindow<'h, MockHost>,
        tracker_count: usize,
    ) -> QueuePair<'h, MockHost> {
        let config = QueuePairConfig {
            qid: 1,
            priority: 0,
            num_entries: 4,
            dstrd_u32: 1,
            supports_sgl: false,
            tracker_count,
            use_cmb_sqs: false,
            global_retry_count: 2,
        };
        let mut qp = QueuePair::new(host, regs, config, None).unwrap();
        qp.enable(false);
        qp
    }

    #[test]
    fn s4_tracker_exhaustion_queues_then_drains() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_qp(&host, &regs, 1);

        let flag = Rc::new(RefCell::new(0u32));
        let mk = |flag: Rc<RefCell<u32>>| {
            let cmd = NvmeCommand::io_flush(0, 1);
            Request::new(cmd, PayloadDescriptor::None, 0).with_callback(move |_| {
                *flag.borrow_mut() += 1;
            })
        };

        qp.submit_request(mk(flag.clone())).unwrap();
        assert_eq!(qp.sq_tail(), 1);
        qp.submit_request(mk(flag.clone())).unwrap();
        qp.submit_request(mk(flag.clone())).unwrap();
        assert_eq!(qp.queued_len(), 2);

        qp.inject_completion_for_test(0, 0, 0);
        let processed = qp.process_completions(1);
        assert_eq!(processed, 1);
        assert_eq!(qp.sq_tail(), 2);
        assert_eq!(qp.queued_len(), 1);
    }

    #[test]
    fn s5_retryable_failure_resubmits_then_succeeds() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_qp(&host, &regs, 1);

        let calls = Rc::new(RefCell::new(0u32));
        let calls2 = calls.clone();
        let cmd = NvmeCommand::io_flush(0, 1);
        let req = Request::new(cmd, PayloadDescriptor::None, 0).with_callback(move |_| {
            *calls2.borrow_mut() += 1;
        });
        qp.submit_request(req).unwrap();

        // transient failure: SCT=generic(0), SC=namespace-not-ready(0x82)
        qp.inject_completion_for_test(0, 0x0, 0x82);
        qp.process_completions(1);
        assert_eq!(*calls.borrow(), 0);
        assert_eq!(qp.sq_tail(), 2);

        qp.inject_completion_for_test(0, 0, 0);
        qp.process_completions(1);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn s6_fail_aborts_every_outstanding_tracker() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_qp(&host, &regs, 2);

        let seen = Rc::new(RefCell::new(alloc::vec::Vec::new()));
        for _ in 0..2 {
            let seen2 = seen.clone();
            let cmd = NvmeCommand::io_flush(0, 1);
            qp.submit_request(
                Request::new(cmd, PayloadDescriptor::None, 0).with_callback(move |cpl| {
                    seen2.borrow_mut().push((cpl.dnr(), cpl.status_code()));
                }),
            )
            .unwrap();
        }

        qp.fail();
        assert_eq!(qp.free_tracker_count(), 2);
        assert_eq!(seen.borrow().len(), 2);
        assert!(seen.borrow().iter().all(|(dnr, _)| *dnr));
    }

    #[test]
    fn s7_phase_wraps_after_num_entries_completions() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_qp(&host, &regs, 4);

        for i in 0..4u16 {
            let cmd = NvmeCommand::io_flush(0, 1);
            qp.submit_request(Request::new(cmd, PayloadDescriptor::None, 0))
                .unwrap();
            qp.inject_completion_for_test(i, 0, 0);
            qp.process_completions(1);
        }
        // after 4 completions cq_head wrapped to 0 and phase flipped once
        assert_eq!(qp.cq_head(), 0);
    }

    fn make_disabled_qp<'h>(
        host: &'h MockHost,
        regs: &'h RegisterWindow<'h, MockHost>,
        tracker_count: usize,
    ) -> QueuePair<'h, MockHost> {
        let config = QueuePairConfig {
            qid: 1,
            priority: 0,
            num_entries: 4,
            dstrd_u32: 1,
            supports_sgl: false,
            tracker_count,
            use_cmb_sqs: false,
            global_retry_count: 2,
        };
        QueuePair::new(host, regs, config, None).unwrap()
    }

    #[test]
    fn submit_request_auto_enables_a_disabled_qp_not_resetting() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_disabled_qp(&host, &regs, 2);
        assert!(!qp.is_enabled());

        let cmd = NvmeCommand::io_flush(0, 1);
        qp.submit_request(Request::new(cmd, PayloadDescriptor::None, 0))
            .unwrap();

        assert!(qp.is_enabled());
        assert_eq!(qp.sq_tail(), 1);
    }

    #[test]
    fn submit_request_stays_queued_while_resetting() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_disabled_qp(&host, &regs, 2);
        qp.set_resetting(true);

        let cmd = NvmeCommand::io_flush(0, 1);
        qp.submit_request(Request::new(cmd, PayloadDescriptor::None, 0))
            .unwrap();

        assert!(!qp.is_enabled());
        assert_eq!(qp.sq_tail(), 0);
        assert_eq!(qp.queued_len(), 1);
    }

    #[test]
    fn process_completions_auto_enables_a_disabled_qp_not_resetting() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_disabled_qp(&host, &regs, 2);

        assert_eq!(qp.process_completions(1), 0);
        assert!(qp.is_enabled());
    }

    #[test]
    fn process_completions_stays_disabled_while_resetting() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_disabled_qp(&host, &regs, 2);
        qp.set_resetting(true);

        assert_eq!(qp.process_completions(1), 0);
        assert!(!qp.is_enabled());
    }

    #[test]
    fn queued_backlog_does_not_drain_while_resetting() {
        let host = MockHost::new();
        let regs = host.register_window();
        let mut qp = make_qp(&host, &regs, 1);

        qp.submit_request(Request::new(NvmeCommand::io_flush(0, 1), PayloadDescriptor::None, 0))
            .unwrap();
        qp.submit_request(Request::new(NvmeCommand::io_flush(0, 1), PayloadDescriptor::None, 0))
            .unwrap();
        assert_eq!(qp.queued_len(), 1);

        qp.set_resetting(true);
        qp.inject_completion_for_test(0, 0, 0);
        qp.process_completions(1);

        // the freed tracker is not handed to the backlogged request while resetting
        assert_eq!(qp.queued_len(), 1);
        assert_eq!(qp.free_tracker_count(), 1);
    }
}
