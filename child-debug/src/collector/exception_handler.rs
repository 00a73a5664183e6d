// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::capture;
use super::guard::FAULT_GUARD;
use super::CONTEXT_RECORD_SIZE;
use crate::shared::handshake::WorkerIds;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
};

static INIT_STARTED: AtomicBool = AtomicBool::new(false);

/// NTSTATUS severity "error" with the customer bit clear: access violations, illegal
/// instructions, stack overflows.  Informational codes (debug output, thread naming) and
/// software-defined ones (C++ and Rust panics) are left alone.
fn is_fatal(code: u32) -> bool {
    code >> 28 == 0xC
}

/// Registers a first-in-line vectored exception handler.  At most once per process.
pub(crate) fn register_exception_handler(targets: WorkerIds) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register the exception handler"
    );
    capture::set_targets(targets);
    // SAFETY: the handler only uses kernel calls that are safe during exception dispatch.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(handle_exception)) };
    if handle.is_null() {
        capture::clear_targets();
        anyhow::bail!("AddVectoredExceptionHandler failed");
    }
    Ok(())
}

unsafe extern "system" fn handle_exception(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
    if exception_info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let exception_record = (*exception_info).ExceptionRecord;
    if exception_record.is_null() || !is_fatal((*exception_record).ExceptionCode.0 as u32) {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    if !FAULT_GUARD.try_enter() {
        capture::block_forever();
    }
    let context = (*exception_info).ContextRecord;
    if !context.is_null() {
        let record = std::slice::from_raw_parts(context as *const u8, CONTEXT_RECORD_SIZE);
        capture::deliver(record, capture::targets());
    }
    // Let structured exception handling and the OS take it from here.
    EXCEPTION_CONTINUE_SEARCH
}

#[cfg(test)]
mod tests {
    use super::is_fatal;

    #[test]
    fn test_fatal_codes() {
        assert!(is_fatal(0xC000_0005)); // access violation
        assert!(is_fatal(0xC000_00FD)); // stack overflow
        assert!(is_fatal(0xC000_001D)); // illegal instruction
        assert!(!is_fatal(0x4001_0006)); // debug output
        assert!(!is_fatal(0x406D_1388)); // thread naming
        assert!(!is_fatal(0xE06D_7363)); // C++ exception
        assert!(!is_fatal(0x8000_0003)); // breakpoint
    }
}
