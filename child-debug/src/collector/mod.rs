// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The worker-side fault interceptor.

mod capture;
#[cfg(unix)]
mod crash_handler;
#[cfg(windows)]
mod exception_handler;
mod guard;
#[cfg(unix)]
mod signal_handler_manager;

pub use guard::ReentrancyGuard;

use crate::shared::configuration::ChildDebugConfiguration;
use crate::shared::handshake::HandshakeLink;

/// The native processor context record carried by a diagnostic message.
#[cfg(unix)]
pub type ContextRecord = libc::ucontext_t;
#[cfg(windows)]
pub type ContextRecord = windows::Win32::System::Diagnostics::Debug::CONTEXT;

/// Size of a complete diagnostic message.
pub const CONTEXT_RECORD_SIZE: usize = std::mem::size_of::<ContextRecord>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The supervisor did not enable capture; nothing was installed.
    Disabled,
    /// Capture is enabled but the published send handle is unusable; nothing was installed.
    InvalidSender,
    Installed,
}

/// Installs the fault interceptor in the current (worker) process, if the supervisor published a
/// channel in `link`.
///
/// PRECONDITIONS:
///     The supervisor called `prepare_child` before this process started.
/// SAFETY:
///     Not reentrant.  Call once, early, from the worker's main thread.
pub fn install(
    link: &HandshakeLink,
    config: &ChildDebugConfiguration,
) -> anyhow::Result<InstallOutcome> {
    let Some(targets) = link.load() else {
        tracing::debug!("Diagnostic capture disabled");
        return Ok(InstallOutcome::Disabled);
    };
    if !targets.sender_is_valid() {
        tracing::warn!(
            sender = targets.sender,
            "Invalid diagnostic send handle, not intercepting faults"
        );
        return Ok(InstallOutcome::InvalidSender);
    }

    #[cfg(unix)]
    signal_handler_manager::register_fault_handlers(config, targets)?;
    #[cfg(windows)]
    {
        let _ = config;
        exception_handler::register_exception_handler(targets)?;
    }

    tracing::debug!(
        signal = targets.signal,
        sender = targets.sender,
        "Installed fault interceptor"
    );
    Ok(InstallOutcome::Installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::handshake::{WorkerIds, INVALID_ID};

    // Installing for real would take over this test process' signal handlers; the bin_tests
    // crate covers that path.

    #[test]
    fn test_disabled_link_installs_nothing() {
        let link = HandshakeLink::new();
        let config = ChildDebugConfiguration::from_options(None, None).unwrap();
        assert_eq!(install(&link, &config).unwrap(), InstallOutcome::Disabled);
    }

    #[test]
    fn test_invalid_sender_installs_nothing() {
        let link = HandshakeLink::new();
        link.publish(WorkerIds {
            signal: 42,
            sender: INVALID_ID,
        });
        let config = ChildDebugConfiguration::from_options(None, None).unwrap();
        assert_eq!(install(&link, &config).unwrap(), InstallOutcome::InvalidSender);
    }

    #[test]
    fn test_context_record_size() {
        assert!(CONTEXT_RECORD_SIZE > 0);
        assert_eq!(CONTEXT_RECORD_SIZE, std::mem::size_of::<ContextRecord>());
    }
}
