// SPDX-License-Identifier: MPL-2.0

//! Error types for the NVMe PCIe transport core.
//!
//! These represent construction-time and builder-time failures only. A device-reported command
//! failure is never surfaced through this type — see `request::CompletionStatus` and
//! `queue_pair::QueuePair::complete_tracker`.

use core::fmt;

/// Failure modes surfaced at the core's boundary.
///
/// Refer to NVM Express Base Specification Revision 2.0, Section 3 and 5, for the status codes
/// referenced in variant docs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NvmeCoreError {
    /// A DMA allocation request could not be satisfied.
    OutOfMemory,
    /// `CmbManager::alloc` could not fit `length` bytes before the end of the CMB.
    OutOfCmbSpace,
    /// BAR mapping failed or the advertised CMB window does not fit inside the mapped BAR.
    BadBarMapping,
    /// `vtophys` returned no translation for a payload address.
    BadTranslation,
    /// A scattered payload produced more segments than `NVME_MAX_SGL_DESCRIPTORS`.
    TooManySegments,
    /// A scatter-gather segment was not PRP-compatible (misaligned address, or a
    /// non-final segment that does not end on a page boundary).
    NotPrpCompatible,
    /// An admin CREATE/DELETE queue command completed with an error status.
    AdminCommandFailed,
}

impl fmt::Display for NvmeCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NvmeCoreError::OutOfMemory => "DMA allocation failed",
            NvmeCoreError::OutOfCmbSpace => "controller memory buffer exhausted",
            NvmeCoreError::BadBarMapping => "BAR mapping failed or CMB window out of bounds",
            NvmeCoreError::BadTranslation => "virtual-to-physical translation failed",
            NvmeCoreError::TooManySegments => "scatter-gather payload exceeded descriptor limit",
            NvmeCoreError::NotPrpCompatible => "scatter-gather segment is not PRP compatible",
            NvmeCoreError::AdminCommandFailed => "admin queue create/delete command failed",
        };
        f.write_str(msg)
    }
}
