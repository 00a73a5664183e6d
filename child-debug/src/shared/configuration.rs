// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::channel::ChannelNamespace;
use crate::shared::constants::{DEFAULT_CHANNEL_PREFIX, DEFAULT_ON_CRASH_ACTION};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the harness does with a worker that crashed, as given by `--on-crash`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCrashAction {
    /// Capture the processor context of the faulting worker.
    Context,
    /// Capture the context, and let the OS write a core dump as well.
    ContextAndCore,
    /// Rely on the OS only; the worker is simply reaped.
    Kill,
    /// Rely on the OS core dump only.
    CoreDump,
}

impl OnCrashAction {
    /// Whether a diagnostic channel must be created for workers.
    pub fn captures_context(&self) -> bool {
        matches!(self, OnCrashAction::Context | OnCrashAction::ContextAndCore)
    }
}

impl FromStr for OnCrashAction {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(OnCrashAction::Context),
            "context+core" | "core+context" => Ok(OnCrashAction::ContextAndCore),
            "kill" => Ok(OnCrashAction::Kill),
            "core" | "coredump" => Ok(OnCrashAction::CoreDump),
            other => Err(ConfigurationError::UnknownOnCrashAction(other.to_string())),
        }
    }
}

impl fmt::Display for OnCrashAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnCrashAction::Context => "context",
            OnCrashAction::ContextAndCore => "context+core",
            OnCrashAction::Kill => "kill",
            OnCrashAction::CoreDump => "coredump",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unknown action for --on-crash: {0}")]
    UnknownOnCrashAction(String),
    #[error("Cannot create an altstack without using it")]
    AltStackNotUsed,
    #[error("Signals contained duplicate elements")]
    DuplicateSignals,
    #[error("Unexpected signal number {0}")]
    InvalidSignal(i32),
    #[error("Invalid channel prefix {0:?}")]
    InvalidChannelPrefix(String),
}

/// Signals intercepted when the configuration does not name any.
#[cfg(unix)]
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGTRAP,
    ]
}

/// Windows has no signals to select; the exception handler filters on the exception code.
#[cfg(windows)]
pub fn default_signals() -> Vec<i32> {
    vec![]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDebugConfiguration {
    on_crash: OnCrashAction,
    // Kept verbatim for the hang hook; no hang action is implemented at this layer.
    on_hang: Option<String>,
    channel_prefix: String,
    namespace: ChannelNamespace,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl ChildDebugConfiguration {
    pub fn new(
        on_crash: OnCrashAction,
        on_hang: Option<String>,
        channel_prefix: Option<String>,
        namespace: Option<ChannelNamespace>,
        mut signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> Result<Self, ConfigurationError> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        if create_alt_stack && !use_alt_stack {
            return Err(ConfigurationError::AltStackNotUsed);
        }

        let channel_prefix = channel_prefix.unwrap_or_else(default_channel_prefix);
        if !is_valid_prefix(&channel_prefix) {
            return Err(ConfigurationError::InvalidChannelPrefix(channel_prefix));
        }

        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            if before_len != signals.len() {
                return Err(ConfigurationError::DuplicateSignals);
            }
            signals.iter().try_for_each(|signum| validate_signum(*signum))?;
        }

        Ok(Self {
            on_crash,
            on_hang,
            channel_prefix,
            namespace: namespace.unwrap_or_else(ChannelNamespace::from_env),
            signals,
            create_alt_stack,
            use_alt_stack,
        })
    }

    /// Builds the configuration from the raw `--on-hang` and `--on-crash` values.
    /// A missing `--on-crash` means [`DEFAULT_ON_CRASH_ACTION`].
    pub fn from_options(
        on_hang: Option<&str>,
        on_crash: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let on_crash = on_crash.unwrap_or(DEFAULT_ON_CRASH_ACTION).parse()?;
        Self::new(
            on_crash,
            on_hang.map(str::to_string),
            None,
            None,
            vec![],
            true,
            true,
        )
    }

    pub fn on_crash(&self) -> OnCrashAction {
        self.on_crash
    }

    pub fn on_hang(&self) -> Option<&str> {
        self.on_hang.as_deref()
    }

    pub fn channel_prefix(&self) -> &str {
        &self.channel_prefix
    }

    pub fn namespace(&self) -> &ChannelNamespace {
        &self.namespace
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn set_channel_prefix(
        &mut self,
        prefix: impl Into<String>,
    ) -> Result<(), ConfigurationError> {
        let prefix = prefix.into();
        if !is_valid_prefix(&prefix) {
            return Err(ConfigurationError::InvalidChannelPrefix(prefix));
        }
        self.channel_prefix = prefix;
        Ok(())
    }

    pub fn set_namespace(&mut self, namespace: ChannelNamespace) {
        self.namespace = namespace;
    }

    pub fn set_create_alt_stack(
        &mut self,
        create_alt_stack: bool,
    ) -> Result<(), ConfigurationError> {
        if create_alt_stack && !self.use_alt_stack {
            return Err(ConfigurationError::AltStackNotUsed);
        }
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> Result<(), ConfigurationError> {
        if self.create_alt_stack && !use_alt_stack {
            return Err(ConfigurationError::AltStackNotUsed);
        }
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }
}

#[cfg(unix)]
fn validate_signum(signum: i32) -> Result<(), ConfigurationError> {
    nix::sys::signal::Signal::try_from(signum)
        .map(|_| ())
        .map_err(|_| ConfigurationError::InvalidSignal(signum))
}

#[cfg(windows)]
fn validate_signum(signum: i32) -> Result<(), ConfigurationError> {
    Err(ConfigurationError::InvalidSignal(signum))
}

// The prefix ends up in a socket path or a mailslot path.
fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && !prefix.contains(['/', '\\', '\0'])
}

fn default_channel_prefix() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string())
}
