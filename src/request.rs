// SPDX-License-Identifier: MPL-2.0

//! Requests: the unit of work submitted to a queue pair.

use alloc::boxed::Box;

use crate::cmd::{NvmeCommand, NvmeCompletion};

/// Caller-supplied scatter-gather payload, analogous to the original source's
/// `reset_sgl`/`next_sge` callback pair.
pub trait ScatterGatherPayload {
    /// Rewinds iteration to `offset` bytes into the payload.
    fn reset_sgl(&mut self, offset: u64);

    /// Returns the next `(physical_address, length)` segment, or `None` once the payload is
    /// exhausted.
    fn next_sge(&mut self) -> Option<(u64, u32)>;
}

/// How a request's data payload is described to the PRP/SGL builder.
pub enum PayloadDescriptor {
    /// No data transfer (e.g. Flush, most admin commands).
    None,
    /// A single virtually-contiguous host buffer.
    Contiguous { virt: *const u8, len: usize },
    /// A caller-driven scatter-gather sequence.
    Sgl(Box<dyn ScatterGatherPayload>),
}

/// Completion callback invoked once a request's tracker is retired (successfully or not).
pub type CompletionCallback = Box<dyn FnMut(&NvmeCompletion)>;

/// A unit of work bound to a queue pair.
///
/// Carries the command image, the payload description, an optional metadata pointer, a
/// completion callback, and the retry counter the queue pair engine mutates in place.
pub struct Request {
    pub cmd: NvmeCommand,
    pub payload: PayloadDescriptor,
    pub payload_size: u32,
    pub metadata: Option<*const u8>,
    pub retries: u8,
    pub callback: Option<CompletionCallback>,
}

impl Request {
    pub fn new(cmd: NvmeCommand, payload: PayloadDescriptor, payload_size: u32) -> Self {
        Self {
            cmd,
            payload,
            payload_size,
            metadata: None,
            retries: 0,
            callback: None,
        }
    }

    pub fn with_metadata(mut self, metadata: *const u8) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&NvmeCompletion) + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Invokes the callback, if any, with `cpl`.
    pub(crate) fn complete(&mut self, cpl: &NvmeCompletion) {
        if let Some(cb) = self.callback.as_mut() {
            cb(cpl);
        }
    }
}
