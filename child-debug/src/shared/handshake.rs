// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The handshake link is the only state the supervisor and the worker share.
//! It lives inside a memory region allocated by the harness (shared between the two processes),
//! so it is `#[repr(C)]` and only made of atomics.

use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering::SeqCst;

/// A raw OS resource identifier: a file descriptor on Unix, a `HANDLE` value on Windows.
pub type RawId = isize;

/// Sentinel stored in the signal slot while diagnostic capture is disabled.
pub const DISABLED_ID: RawId = 0;

/// An identifier that can never name a live resource (`-1` / `INVALID_HANDLE_VALUE`).
pub const INVALID_ID: RawId = -1;

/// Identifiers of the worker-facing half of a diagnostic channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerIds {
    /// Signal primitive the worker sets once its message is written.
    pub signal: RawId,
    /// Send handle the worker writes its message to.
    pub sender: RawId,
}

impl WorkerIds {
    pub fn sender_is_valid(&self) -> bool {
        self.sender != INVALID_ID && self.sender != DISABLED_ID
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct HandshakeLink {
    debug_event: AtomicIsize,
    child_debug_socket: AtomicIsize,
}

impl HandshakeLink {
    pub const fn new() -> Self {
        Self {
            debug_event: AtomicIsize::new(DISABLED_ID),
            child_debug_socket: AtomicIsize::new(DISABLED_ID),
        }
    }

    /// Reinterprets memory owned by the harness' shared region as a link.
    ///
    /// # Safety
    /// `ptr` must be non-null, aligned for `HandshakeLink`, valid for reads and writes for `'a`,
    /// and either zeroed or previously initialized as a `HandshakeLink`.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a HandshakeLink {
        &*(ptr as *const HandshakeLink)
    }

    /// Supervisor side: publishes the identifiers before the worker starts.
    /// The sender is stored first so a worker observing the signal slot also sees the sender.
    pub fn publish(&self, ids: WorkerIds) {
        self.child_debug_socket.store(ids.sender, SeqCst);
        self.debug_event.store(ids.signal, SeqCst);
    }

    /// Worker side: `None` while capture is disabled.
    pub fn load(&self) -> Option<WorkerIds> {
        let signal = self.debug_event.load(SeqCst);
        if signal == DISABLED_ID {
            return None;
        }
        Some(WorkerIds {
            signal,
            sender: self.child_debug_socket.load(SeqCst),
        })
    }

    /// Supervisor side: called once the channel behind the identifiers is gone.
    pub fn clear(&self) {
        self.debug_event.store(DISABLED_ID, SeqCst);
        self.child_debug_socket.store(DISABLED_ID, SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.debug_event.load(SeqCst) != DISABLED_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel() {
        let link = HandshakeLink::new();
        assert!(!link.is_enabled());
        assert_eq!(link.load(), None);

        let ids = WorkerIds {
            signal: 7,
            sender: 9,
        };
        link.publish(ids);
        assert!(link.is_enabled());
        assert_eq!(link.load(), Some(ids));

        link.clear();
        assert!(!link.is_enabled());
        assert_eq!(link.load(), None);
    }

    #[test]
    fn test_invalid_sender() {
        let ids = WorkerIds {
            signal: 7,
            sender: INVALID_ID,
        };
        assert!(!ids.sender_is_valid());
        let ids = WorkerIds {
            signal: 7,
            sender: 12,
        };
        assert!(ids.sender_is_valid());
    }

    #[test]
    fn test_from_zeroed_memory() {
        let mut storage = [0isize; 2];
        assert_eq!(std::mem::size_of_val(&storage), std::mem::size_of::<HandshakeLink>());
        // SAFETY: zeroed, aligned, lives for the whole test.
        let link = unsafe { HandshakeLink::from_ptr(storage.as_mut_ptr() as *mut u8) };
        assert!(!link.is_enabled());
        link.publish(WorkerIds {
            signal: 3,
            sender: 4,
        });
        assert_eq!(storage, [3, 4]);
    }
}
