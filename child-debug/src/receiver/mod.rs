// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The supervisor-side drain.

mod drain;

pub use drain::{drain, Drain, DrainError, DrainOutcome, DrainReport};

use crate::collector::{ContextRecord, CONTEXT_RECORD_SIZE};

/// One message read from a diagnostic channel: the raw bytes the worker wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    bytes: Vec<u8>,
}

impl DiagnosticMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the message holds exactly one context record of this build.
    pub fn is_complete(&self) -> bool {
        self.bytes.len() == CONTEXT_RECORD_SIZE
    }

    /// The context record, if the message is complete.
    /// Only meaningful when the worker runs the same build as the caller.
    pub fn to_context_record(&self) -> Option<ContextRecord> {
        if !self.is_complete() {
            return None;
        }
        // SAFETY: the length matches, the record is plain old data, and the read tolerates any
        // alignment of the byte buffer.
        Some(unsafe { std::ptr::read_unaligned(self.bytes.as_ptr() as *const ContextRecord) })
    }
}

impl From<Vec<u8>> for DiagnosticMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_message_has_no_record() {
        let message = DiagnosticMessage::new(vec![1, 2, 3]);
        assert_eq!(message.len(), 3);
        assert!(!message.is_complete());
        assert!(message.to_context_record().is_none());
    }

    #[test]
    fn test_complete_message_round_trips() {
        let message = DiagnosticMessage::new(vec![0u8; CONTEXT_RECORD_SIZE]);
        assert!(message.is_complete());
        assert!(message.to_context_record().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_mask_survives() {
        // SAFETY: ucontext_t is plain data; all-zeroes is a valid value.
        let mut context: ContextRecord = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut context.uc_sigmask);
            libc::sigaddset(&mut context.uc_sigmask, libc::SIGUSR2);
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &context as *const ContextRecord as *const u8,
                CONTEXT_RECORD_SIZE,
            )
        }
        .to_vec();

        let record = DiagnosticMessage::from(bytes).to_context_record().unwrap();
        assert_eq!(unsafe { libc::sigismember(&record.uc_sigmask, libc::SIGUSR2) }, 1);
        assert_eq!(unsafe { libc::sigismember(&record.uc_sigmask, libc::SIGUSR1) }, 0);
    }
}
