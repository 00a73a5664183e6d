// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-time delivery of the context record.
//!
//! Everything here runs inside a signal handler (or a vectored exception handler) of a process
//! that just faulted, so it only uses async-signal-safe calls: `send`, `write`, `pause`.
//! No allocation, no locks, no `tracing`.

use crate::channel::sys;
use crate::shared::handshake::{WorkerIds, DISABLED_ID};
use std::io;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering::SeqCst;

// Copied out of the handshake link when the interceptor is installed, so that the handler never
// touches memory it does not own.
static TARGET_SIGNAL: AtomicIsize = AtomicIsize::new(DISABLED_ID);
static TARGET_SENDER: AtomicIsize = AtomicIsize::new(DISABLED_ID);

pub(crate) fn set_targets(ids: WorkerIds) {
    TARGET_SENDER.store(ids.sender, SeqCst);
    TARGET_SIGNAL.store(ids.signal, SeqCst);
}

/// Undoes [`set_targets`] after a failed installation.
pub(crate) fn clear_targets() {
    TARGET_SIGNAL.store(DISABLED_ID, SeqCst);
    TARGET_SENDER.store(DISABLED_ID, SeqCst);
}

pub(crate) fn targets() -> WorkerIds {
    WorkerIds {
        signal: TARGET_SIGNAL.load(SeqCst),
        sender: TARGET_SENDER.load(SeqCst),
    }
}

/// Writes `record` as one message, then sets the signal.  The signal is set even if the write
/// failed, so the supervisor still learns that a fault happened.  Returns whether both succeeded.
pub(crate) fn deliver(record: &[u8], targets: WorkerIds) -> bool {
    if targets.signal == DISABLED_ID || !targets.sender_is_valid() {
        return false;
    }
    let sent = match sys::send_message(targets.sender, record) {
        Ok(()) => true,
        Err(e) => {
            log_fault(b"failed to send the context record", &e);
            false
        }
    };
    let signaled = match sys::set_signal(targets.signal) {
        Ok(()) => true,
        Err(e) => {
            log_fault(b"failed to set the diagnostic signal", &e);
            false
        }
    };
    sent && signaled
}

/// Formats `value` in decimal into the tail of `buf`, returning the digits.
fn format_decimal(value: i32, buf: &mut [u8; 12]) -> &[u8] {
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

fn log_fault(what: &[u8], error: &io::Error) {
    let mut digits = [0u8; 12];
    let code = format_decimal(error.raw_os_error().unwrap_or(-1), &mut digits);
    let parts: [&[u8]; 5] = [b"child-debug: ", what, b" (os error ", code, b")\n"];
    for part in parts {
        write_stderr(part);
    }
}

#[cfg(unix)]
fn write_stderr(bytes: &[u8]) {
    // SAFETY: bytes is valid for its length. Short or failed writes are ignored.
    let _ = unsafe {
        libc::write(
            libc::STDERR_FILENO,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        )
    };
}

#[cfg(windows)]
fn write_stderr(bytes: &[u8]) {
    use windows::Win32::Storage::FileSystem::WriteFile;
    use windows::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};

    // SAFETY: plain kernel calls on a standard handle; failures are ignored.
    unsafe {
        if let Ok(stderr) = GetStdHandle(STD_ERROR_HANDLE) {
            let mut written = 0u32;
            let _ = WriteFile(stderr, Some(bytes), Some(&mut written as *mut u32), None);
        }
    }
}

/// Parks the calling thread for good.  Used when a fault hits a thread while another fault is
/// being handled: the first one owns the channel, and the supervisor will kill us.
#[cfg(unix)]
pub(crate) fn block_forever() -> ! {
    loop {
        // SAFETY: no preconditions.
        unsafe { libc::pause() };
    }
}

#[cfg(windows)]
pub(crate) fn block_forever() -> ! {
    use windows::Win32::System::Threading::{Sleep, INFINITE};
    loop {
        // SAFETY: no preconditions.
        unsafe { Sleep(INFINITE) };
    }
}
