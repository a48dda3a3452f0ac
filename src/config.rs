// SPDX-License-Identifier: MPL-2.0

//! Init-time immutable configuration.
//!
//! The original source keeps the retry count as a process-wide global
//! (`spdk_nvme_retry_count`). This crate promotes it into a controller options struct read once
//! at queue-pair construction, per the open design note in spec §9.

/// Admin queue tracker count (fixed, mirrors `NVME_ADMIN_TRACKERS` in the original source).
pub const DEFAULT_ADMIN_TRACKER_COUNT: usize = 32;

/// Default cap on I/O queue tracker count (mirrors `NVME_IO_TRACKERS`).
pub const DEFAULT_IO_TRACKER_COUNT_MAX: usize = 128;

/// Controller-wide tunables read once at construction time.
#[derive(Debug, Copy, Clone)]
pub struct NvmeCoreOptions {
    /// Number of times a retryable completion is resubmitted before being delivered to the
    /// caller as a failure.
    pub global_retry_count: u8,
    /// Tracker pool size for the admin queue (qid 0).
    pub admin_tracker_count: usize,
    /// Upper bound on I/O queue tracker pool size; the effective size is
    /// `min(io_tracker_count_max, num_entries - 1)`.
    pub io_tracker_count_max: usize,
    /// Whether SQs may be placed in the controller memory buffer, subject to CMBSZ.SQS and a
    /// successful CMB allocation.
    pub use_cmb_sqs: bool,
}

impl Default for NvmeCoreOptions {
    fn default() -> Self {
        Self {
            global_retry_count: 4,
            admin_tracker_count: DEFAULT_ADMIN_TRACKER_COUNT,
            io_tracker_count_max: DEFAULT_IO_TRACKER_COUNT_MAX,
            use_cmb_sqs: false,
        }
    }
}
