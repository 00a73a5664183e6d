// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::capture;
use super::guard::FAULT_GUARD;
use super::signal_handler_manager::chain_signal_handler;
use super::CONTEXT_RECORD_SIZE;
use libc::{c_void, siginfo_t};

// Async-signal-safe functions used from here on:
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - pause
// - raise
// - send
// - sigaction
// - write

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if !FAULT_GUARD.try_enter() {
        // Faulted again, here or on another thread.  The first fault owns the channel.
        capture::block_forever();
    }
    if !ucontext.is_null() {
        // SAFETY: the kernel hands SA_SIGINFO handlers a pointer to the interrupted context.
        let record =
            unsafe { std::slice::from_raw_parts(ucontext as *const u8, CONTEXT_RECORD_SIZE) };
        capture::deliver(record, capture::targets());
    }
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}
