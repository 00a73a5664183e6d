// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::channel::{ChannelCreationError, ChannelEndpoint};
use crate::collector::{self, InstallOutcome};
use crate::receiver::{drain, DrainReport};
use crate::shared::configuration::{ChildDebugConfiguration, ConfigurationError};
use crate::shared::constants::EX_USAGE;
use crate::shared::handshake::HandshakeLink;
use std::path::Path;

/// Supervisor-side state: the resolved configuration, the handshake link shared with workers,
/// and the channel armed for the current worker, if any.
#[derive(Debug)]
pub struct ChildDebug<'link> {
    config: ChildDebugConfiguration,
    link: &'link HandshakeLink,
    endpoint: Option<ChannelEndpoint>,
}

impl<'link> ChildDebug<'link> {
    /// Does not create a channel; see [`ChildDebug::prepare_child`].
    pub fn new(config: ChildDebugConfiguration, link: &'link HandshakeLink) -> Self {
        link.clear();
        Self {
            config,
            link,
            endpoint: None,
        }
    }

    /// Resolves the raw option values and arms a channel for the first worker.
    pub fn from_options(
        on_hang: Option<&str>,
        on_crash: Option<&str>,
        link: &'link HandshakeLink,
    ) -> Result<Self, ConfigurationError> {
        let config = ChildDebugConfiguration::from_options(on_hang, on_crash)?;
        let mut child_debug = Self::new(config, link);
        child_debug.prepare_child();
        Ok(child_debug)
    }

    pub fn config(&self) -> &ChildDebugConfiguration {
        &self.config
    }

    pub fn link(&self) -> &'link HandshakeLink {
        self.link
    }

    pub fn capture_enabled(&self) -> bool {
        self.config.on_crash().captures_context()
    }

    pub fn endpoint(&self) -> Option<&ChannelEndpoint> {
        self.endpoint.as_ref()
    }

    /// Arms a fresh channel for the next worker and publishes it in the link.
    /// A channel left over from a previous worker that was never drained is released first.
    /// Returns whether capture is armed; creation failures only disable capture for that worker.
    pub fn prepare_child(&mut self) -> bool {
        if !self.capture_enabled() {
            return false;
        }
        if let Some(previous) = self.endpoint.take() {
            previous.close();
        }
        self.link.clear();

        match self.create_endpoint() {
            Ok(endpoint) => {
                self.link.publish(endpoint.worker_ids());
                tracing::debug!(channel = %endpoint.identity(), "Armed diagnostic channel");
                self.endpoint = Some(endpoint);
                true
            }
            Err(e) => {
                tracing::warn!(error = ?e, "Diagnostic capture disabled for the next worker");
                false
            }
        }
    }

    fn create_endpoint(&self) -> Result<ChannelEndpoint, ChannelCreationError> {
        ChannelEndpoint::create(self.config.channel_prefix(), self.config.namespace())
    }

    /// Drains the channel of a worker that exited abnormally.  `None` when capture is disabled
    /// or no channel is armed; no channel operation happens in that case.
    pub fn crashed_child(&mut self) -> Option<DrainReport> {
        if !self.capture_enabled() {
            return None;
        }
        let endpoint = self.endpoint.take()?;
        let report = drain(endpoint, self.link);
        tracing::info!(
            messages = report.messages.len(),
            complete = report.is_complete(),
            "Collected crash diagnostics"
        );
        Some(report)
    }

    /// Hangs are reported but no diagnostics are retrieved for them: a hung worker never
    /// faulted, so there is nothing in the channel.
    pub fn hung_child(&self, worker: u32) {
        tracing::info!(
            worker,
            on_hang = self.config.on_hang().unwrap_or_default(),
            "Worker hung, no diagnostics to collect"
        );
    }
}

fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "child-debug".to_string())
}

/// Supervisor, once at startup: resolves `--on-hang` / `--on-crash` and, when context capture is
/// requested, arms a channel for the first worker.
///
/// An unknown `--on-crash` value is a usage error: it is reported on stderr and the process exits
/// with `EX_USAGE`.
pub fn debug_init_global<'link>(
    on_hang: Option<&str>,
    on_crash: Option<&str>,
    link: &'link HandshakeLink,
) -> ChildDebug<'link> {
    match ChildDebug::from_options(on_hang, on_crash, link) {
        Ok(child_debug) => child_debug,
        Err(e) => {
            eprintln!("{}: {e}", program_name());
            std::process::exit(EX_USAGE)
        }
    }
}

/// Worker, once after it starts: installs the fault interceptor if the supervisor armed a
/// channel.
pub fn debug_init_child(
    link: &HandshakeLink,
    config: &ChildDebugConfiguration,
) -> anyhow::Result<InstallOutcome> {
    collector::install(link, config)
}

/// Supervisor, after a worker exited abnormally.
pub fn debug_crashed_child(child_debug: &mut ChildDebug<'_>) -> Option<DrainReport> {
    child_debug.crashed_child()
}

/// Supervisor, when the liveness monitor declares `worker` hung.
pub fn debug_hung_child(child_debug: &ChildDebug<'_>, worker: u32) {
    child_debug.hung_child(worker)
}
