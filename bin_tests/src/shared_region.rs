// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory shared between the supervisor and a forked worker, standing in for the harness'
//! shared-memory block.

use crate::WorkerInstall;
use child_debug::HandshakeLink;
use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;

#[repr(C)]
pub struct SharedState {
    pub link: HandshakeLink,
    install: AtomicU32,
}

impl SharedState {
    pub fn report_install(&self, install: WorkerInstall) {
        self.install.store(install.to_raw(), SeqCst);
    }

    pub fn install(&self) -> WorkerInstall {
        WorkerInstall::from_raw(self.install.load(SeqCst))
    }
}

/// An anonymous `MAP_SHARED` mapping: survives `fork` as the same physical memory.
pub struct SharedRegion {
    addr: *mut c_void,
    len: usize,
}

impl SharedRegion {
    pub fn new() -> anyhow::Result<Self> {
        let len = std::mem::size_of::<SharedState>();
        // SAFETY: anonymous mapping, no file involved.  The kernel zero-fills it.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        anyhow::ensure!(addr != MAP_FAILED, "failed to map the shared region");
        Ok(Self { addr, len })
    }

    pub fn state(&self) -> &SharedState {
        // SAFETY: page aligned, zeroed, mapped for as long as self lives.  All-zeroes is a valid
        // SharedState: a disabled link and an unreported install.
        unsafe { &*(self.addr as *const SharedState) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what new() mapped.
        unsafe { libc::munmap(self.addr, self.len) };
    }
}
