// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registration of the fault handlers, and chaining to whatever they replaced.
//!
//! The dispositions in place before ours are read back from the kernel and published before the
//! first of our handlers goes live, so a fault can never reach a handler that has nothing to
//! chain to.  If any signal can't be taken over, the ones already taken are handed back.

use super::capture;
use super::crash_handler::handle_posix_sigaction;
use crate::shared::configuration::ChildDebugConfiguration;
use crate::shared::handshake::WorkerIds;
use anyhow::Context;
use libc::{c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

/// Previous dispositions, indexed by signal number.  `None` for signals we never took over.
type Dispositions = [Option<libc::sigaction>; MAX_SIGNALS];

static PREVIOUS: OnceLock<Dispositions> = OnceLock::new();
static REGISTRATION_STARTED: AtomicBool = AtomicBool::new(false);

/// Takes over every signal in `config`, after recording where a captured context must go.
/// One attempt per process: a second call is an error even if the first one failed.
///
/// On failure nothing stays installed: the signals taken so far get their previous disposition
/// back and the targets are cleared.
///
/// SAFETY:
///     No other thread may change the dispositions of these signals concurrently.
pub(crate) fn register_fault_handlers(
    config: &ChildDebugConfiguration,
    targets: WorkerIds,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        REGISTRATION_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register fault handlers"
    );

    let mut previous: Dispositions = [None; MAX_SIGNALS];
    for &signum in config.signals() {
        anyhow::ensure!(
            signum > 0 && (signum as usize) < MAX_SIGNALS,
            "Unexpected signal number {signum}"
        );
        let current = current_disposition(signum)
            .with_context(|| format!("Unable to read the disposition of signal {signum}"))?;
        previous[signum as usize] = Some(current);
    }
    let previous = PREVIOUS.get_or_init(|| previous);

    if config.create_alt_stack() {
        // SAFETY: no preconditions.  The stack is never unmapped.
        unsafe { create_alt_stack()? };
    }

    // SA_NODEFER lets a fault inside the handler reach it again, where the reentrancy guard parks
    // the thread instead of leaving the signal pending forever.  SA_ONSTACK is what makes a stack
    // overflow reportable; some hosts bring their own altstack, hence the separate flag.
    let mut flags = SaFlags::SA_NODEFER;
    if config.use_alt_stack() {
        flags |= SaFlags::SA_ONSTACK;
    }
    let action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        flags,
        SigSet::empty(),
    );

    capture::set_targets(targets);
    let mut taken = Vec::with_capacity(config.signals().len());
    for &signum in config.signals() {
        // SAFETY: the handler only makes async-signal-safe calls.
        let installed = Signal::try_from(signum)
            .and_then(|sig| unsafe { signal::sigaction(sig, &action) });
        if let Err(e) = installed {
            for &signum in taken.iter().rev() {
                restore(signum, previous);
            }
            capture::clear_targets();
            anyhow::bail!("Unable to register a handler for signal {signum}: {e}");
        }
        taken.push(signum);
    }
    Ok(())
}

fn current_disposition(signum: i32) -> io::Result<libc::sigaction> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: with a null new action, sigaction only writes the current one to `current`.
    if unsafe { libc::sigaction(signum, ptr::null(), current.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: initialized by the successful call above.
    Ok(unsafe { current.assume_init() })
}

fn restore(signum: i32, previous: &Dispositions) {
    let Some(action) = &previous[signum as usize] else {
        return;
    };
    // SAFETY: reinstates a disposition the kernel handed us.
    if unsafe { libc::sigaction(signum, action, ptr::null_mut()) } != 0 {
        tracing::warn!(
            signum,
            error = %io::Error::last_os_error(),
            "Failed to restore a signal disposition"
        );
    }
}

/// Kills the program without raising an abort or calling at_exit
fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Once the context is delivered, hands the signal to the disposition we replaced.
///
/// SAFETY:
///     Only called from our own handler, with the arguments the kernel gave it.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let previous = match PREVIOUS.get() {
        Some(previous) if signum > 0 && (signum as usize) < MAX_SIGNALS => {
            previous[signum as usize]
        }
        _ => None,
    };
    let Some(previous) = previous else {
        terminate()
    };

    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    match previous.sa_sigaction {
        libc::SIG_DFL => {
            // Reinstate the default and re-raise, so the OS terminates the worker (and dumps
            // core if configured to).  A hardware fault would re-trigger on return anyway, a
            // raised one would not.
            if unsafe { libc::sigaction(signum, &previous, ptr::null_mut()) } != 0 {
                terminate()
            }
            unsafe { libc::raise(signum) };
        }
        libc::SIG_IGN => (),
        handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
            // SAFETY: SA_SIGINFO means the kernel stored a three-argument handler.
            let handler: extern "C" fn(i32, *mut siginfo_t, *mut c_void) =
                unsafe { std::mem::transmute(handler) };
            handler(signum, sig_info, ucontext)
        }
        handler => {
            // SAFETY: without SA_SIGINFO the kernel stored a one-argument handler.
            let handler: extern "C" fn(i32) = unsafe { std::mem::transmute(handler) };
            handler(signum)
        }
    }
}

/// Installs an alternate signal stack with an inaccessible guard page below it.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // Our handler needs very little stack, but whatever we chain to may not.
    let page_size = page_size::get();
    let stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size);
    let mapping = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page_size + stack_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if mapping == libc::MAP_FAILED {
        return Err(io::Error::last_os_error()).context("Failed to map the alternate stack");
    }
    if unsafe { libc::mprotect(mapping, page_size, libc::PROT_NONE) } != 0 {
        return Err(io::Error::last_os_error()).context("Failed to protect the stack guard page");
    }

    let stack = libc::stack_t {
        ss_sp: unsafe { mapping.add(page_size) },
        ss_flags: 0,
        ss_size: stack_size,
    };
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error()).context("sigaltstack failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_current_disposition() {
        let action = current_disposition(libc::SIGUSR2).unwrap();
        assert_eq!(action.sa_sigaction, libc::SIG_DFL);
        assert!(current_disposition(-1).is_err());
    }

    // The only test in this crate that registers for real; registration is once per process.
    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_failed_registration_hands_signals_back() {
        use crate::channel::ChannelNamespace;
        use crate::shared::configuration::OnCrashAction;
        use crate::shared::handshake::DISABLED_ID;

        // Sorted by number: SIGUSR1 is taken, then SIGSTOP can't be.
        let config = ChildDebugConfiguration::new(
            OnCrashAction::Context,
            None,
            Some("registration".to_string()),
            Some(ChannelNamespace::Default),
            vec![libc::SIGSTOP, libc::SIGUSR1],
            false,
            false,
        )
        .unwrap();
        let targets = WorkerIds {
            signal: 40,
            sender: 41,
        };

        let err = register_fault_handlers(&config, targets).unwrap_err();
        assert!(
            err.to_string().contains(&libc::SIGSTOP.to_string()),
            "{err}"
        );
        assert_eq!(
            current_disposition(libc::SIGUSR1).unwrap().sa_sigaction,
            libc::SIG_DFL
        );
        assert_eq!(
            capture::targets(),
            WorkerIds {
                signal: DISABLED_ID,
                sender: DISABLED_ID,
            }
        );

        let err = register_fault_handlers(&config, targets).unwrap_err();
        assert!(err.to_string().contains("double register"), "{err}");
    }
}
