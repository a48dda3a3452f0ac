// SPDX-License-Identifier: MPL-2.0

//! Controller-Level Queue Orchestrator: brings up the PCIe controller context and creates/deletes
//! I/O queue pairs by issuing admin commands.

use alloc::rc::Rc;
use core::cell::RefCell;

use log::{debug, info, warn};

use crate::cmb::CmbManager;
use crate::cmd::NvmeCommand;
use crate::config::NvmeCoreOptions;
use crate::error::NvmeCoreError;
use crate::host::{Host, PciIdentity};
use crate::nvme_regs::RegisterWindow;
use crate::queue_pair::{QueuePair, QueuePairConfig};
use crate::request::{PayloadDescriptor, Request};

/// PCI command register bits: bus-master enable (bit 2) and INTx disable (bit 10).
const PCI_COMMAND_OFFSET: u16 = 0x04;
const PCI_COMMAND_BUS_MASTER_ENABLE: u32 = 1 << 2;
const PCI_COMMAND_INTX_DISABLE: u32 = 1 << 10;

/// Constructs the PCIe controller context: maps BAR0, best-effort maps the CMB, enables bus
/// mastering, and derives the doorbell stride.
pub struct ControllerCore<'h, H: Host> {
    host: &'h H,
    regs: RegisterWindow<'h, H>,
    cmb: RefCell<Option<CmbManager>>,
    options: NvmeCoreOptions,
    dstrd_u32: u32,
    pci_identity: PciIdentity,
}

/// Result of a single `process_completions(0)` busy-wait poll, shared between the submitted
/// admin request's callback and the orchestrator's polling loop.
struct AdminWait {
    done: bool,
    failed: bool,
}

impl<'h, H: Host> ControllerCore<'h, H> {
    /// §4.5: map BAR0, map CMB (best-effort), fix up the PCI command register, read CAP, and
    /// derive the doorbell stride.
    pub fn construct(
        host: &'h H,
        regs_size: usize,
        options: NvmeCoreOptions,
    ) -> Result<Self, NvmeCoreError> {
        Self::enable_bus_mastering(host);

        let mapping = host.map_bar(0)?;
        let regs = unsafe { RegisterWindow::new(host, mapping.virt_base, regs_size.max(mapping.size)) };

        let caps = regs.capabilities();
        let cmb = CmbManager::discover(host, &regs);
        if let Some(cmb) = &cmb {
            debug!(
                "CMB present: {} bytes, sqs_supported={}",
                cmb.size(),
                cmb.sqs_supported()
            );
        } else {
            info!("no usable CMB advertised");
        }

        Ok(Self {
            host,
            regs,
            cmb: RefCell::new(cmb),
            options,
            dstrd_u32: caps.dstrd_u32,
            pci_identity: host.pci_identity(),
        })
    }

    /// §1.2 supplemented step: set bus-master-enable and disable legacy INTx before any other
    /// register access.
    fn enable_bus_mastering(host: &H) {
        let command = host.cfg_read32(PCI_COMMAND_OFFSET);
        host.cfg_write32(
            PCI_COMMAND_OFFSET,
            command | PCI_COMMAND_BUS_MASTER_ENABLE | PCI_COMMAND_INTX_DISABLE,
        );
    }

    pub fn pci_identity(&self) -> PciIdentity {
        self.pci_identity
    }

    pub fn doorbell_stride_u32(&self) -> u32 {
        self.dstrd_u32
    }

    pub fn register_window(&self) -> &RegisterWindow<'h, H> {
        &self.regs
    }

    /// Constructs an I/O queue pair via `QueuePair::new` — construction of the ring memory and
    /// tracker pool, not yet known to the controller.
    ///
    /// Takes `&'h self` (rather than an ordinary `&self`) because the returned `QueuePair`
    /// borrows this controller's shared `RegisterWindow` for the doorbell-stride lifetime `'h`;
    /// the controller itself must outlive every queue pair it creates.
    pub fn new_io_qpair(
        &'h self,
        qid: u16,
        priority: u8,
        num_entries: u16,
        supports_sgl: bool,
    ) -> Result<QueuePair<'h, H>, NvmeCoreError> {
        let configured_max = if qid == 0 {
            self.options.admin_tracker_count
        } else {
            self.options.io_tracker_count_max
        };
        let config = QueuePairConfig {
            qid,
            priority,
            num_entries,
            dstrd_u32: self.dstrd_u32,
            supports_sgl,
            tracker_count: configured_max.min(num_entries as usize - 1),
            use_cmb_sqs: self.options.use_cmb_sqs,
            global_retry_count: self.options.global_retry_count,
        };
        let mut cmb = self.cmb.borrow_mut();
        QueuePair::new(self.host, &self.regs, config, cmb.as_mut())
    }

    /// §4.5 `create_io_qpair`: issues CREATE_IO_CQ then CREATE_IO_SQ on `adminq`, polling each to
    /// completion. On SQ-create failure, undoes the CQ with DELETE_IO_CQ.
    pub fn create_io_qpair(
        &self,
        adminq: &mut QueuePair<'h, H>,
        qp: &mut QueuePair<'h, H>,
    ) -> Result<(), NvmeCoreError> {
        let num_entries_minus1 = qp.num_entries() - 1;

        let cq_cmd = NvmeCommand::create_io_cq(0, qp.qid(), qp.cq_bus_addr(), num_entries_minus1);
        self.submit_admin_and_wait(adminq, cq_cmd)?;

        let sq_cmd = NvmeCommand::create_io_sq(
            0,
            qp.qid(),
            qp.sq_bus_addr(),
            num_entries_minus1,
            qp.qid(),
            qp.priority(),
        );
        if let Err(e) = self.submit_admin_and_wait(adminq, sq_cmd) {
            warn!("CREATE_IO_SQ failed for qid={}, rolling back CQ", qp.qid());
            let undo = NvmeCommand::delete_io_cq(0, qp.qid());
            let _ = self.submit_admin_and_wait(adminq, undo);
            return Err(e);
        }

        qp.reset();
        qp.enable(false);
        Ok(())
    }

    /// §4.5 `delete_io_qpair`: DELETE_IO_SQ then DELETE_IO_CQ, in that order, each polled to
    /// completion.
    pub fn delete_io_qpair(
        &self,
        adminq: &mut QueuePair<'h, H>,
        qid: u16,
    ) -> Result<(), NvmeCoreError> {
        let delete_sq = NvmeCommand::delete_io_sq(0, qid);
        self.submit_admin_and_wait(adminq, delete_sq)?;

        let delete_cq = NvmeCommand::delete_io_cq(0, qid);
        self.submit_admin_and_wait(adminq, delete_cq)
    }

    /// Builds a `Request` around `cmd`, submits it to `adminq`, and busy-polls until its
    /// completion arrives. This is the orchestrator's only blocking operation, matching the
    /// single-threaded admin control-plane model.
    fn submit_admin_and_wait(
        &self,
        adminq: &mut QueuePair<'h, H>,
        cmd: NvmeCommand,
    ) -> Result<(), NvmeCoreError> {
        let wait = Rc::new(RefCell::new(AdminWait {
            done: false,
            failed: false,
        }));
        let wait2 = wait.clone();

        let req = Request::new(cmd, PayloadDescriptor::None, 0).with_callback(move |cpl| {
            let mut w = wait2.borrow_mut();
            w.done = true;
            w.failed = cpl.has_error();
        });

        adminq.submit_request(req)?;
        loop {
            adminq.process_completions(0);
            if wait.borrow().done {
                break;
            }
            core::hint::spin_loop();
        }

        if wait.borrow().failed {
            Err(NvmeCoreError::AdminCommandFailed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHost;

    #[test]
    fn construct_reads_doorbell_stride_from_cap() {
        let host = MockHost::new();
        let core = ControllerCore::construct(&host, 0x2000, NvmeCoreOptions::default()).unwrap();
        // MockHost's CAP encodes dstrd=1, i.e. a stride of 2 u32s.
        assert_eq!(core.doorbell_stride_u32(), 2);
    }

    #[test]
    fn admin_qpair_uses_configured_admin_tracker_count() {
        let host = MockHost::new();
        let mut options = NvmeCoreOptions::default();
        options.admin_tracker_count = 2;
        let core = ControllerCore::construct(&host, 0x2000, options).unwrap();

        // num_entries - 1 == 3 is above the configured admin_tracker_count, so the pool is
        // capped at 2 rather than the I/O default.
        let adminq = core
            .new_io_qpair(0, 0, 4, false)
            .expect("admin qpair construction");
        assert_eq!(adminq.free_tracker_count(), 2);
    }

    #[test]
    fn io_qpair_tracker_count_capped_by_num_entries() {
        let host = MockHost::new();
        let core = ControllerCore::construct(&host, 0x2000, NvmeCoreOptions::default()).unwrap();

        // num_entries - 1 == 3 is below io_tracker_count_max (128), so it governs instead.
        let ioq = core
            .new_io_qpair(1, 0, 4, false)
            .expect("io qpair construction");
        assert_eq!(ioq.free_tracker_count(), 3);
    }
}
