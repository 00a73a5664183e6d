// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The named diagnostic channel.
//!
//! The supervisor owns a [`ChannelEndpoint`]: the receive side of a uniquely named, one-way,
//! message-oriented channel, a companion signal primitive, and the send handle the worker will
//! inherit.  The signal is a separate resource because the channel itself can't always be folded
//! into a generic wait (mailslots can't be passed to `WaitForMultipleObjects`).
//!
//! | Target  | Receive side                          | Signal                   |
//! |---------|---------------------------------------|--------------------------|
//! | Unix    | datagram socket bound to a unique name | non-blocking pipe        |
//! | Windows | `\\.\mailslot\<prefix>.<suffix>`      | manual-reset event       |

use crate::shared::constants::{
    CHANNEL_CREATE_MAX_RETRIES, CHANNEL_NAME_SEPARATOR, CHILD_DEBUG_CHANNEL_DIR,
};
use crate::shared::handshake::WorkerIds;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix as sys;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use self::windows as sys;

/// Where channel names live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelNamespace {
    /// The Linux abstract socket namespace, the system temporary directory on other Unixes, and
    /// the mailslot namespace on Windows.
    Default,
    /// Socket files inside the given directory (Unix only).
    Directory(PathBuf),
}

impl ChannelNamespace {
    /// [`ChannelNamespace::Directory`] if `CHILD_DEBUG_CHANNEL_DIR` is set and non-empty.
    pub fn from_env() -> Self {
        match std::env::var_os(CHILD_DEBUG_CHANNEL_DIR) {
            Some(dir) if !dir.is_empty() => ChannelNamespace::Directory(dir.into()),
            _ => ChannelNamespace::Default,
        }
    }
}

/// The name of a channel: `<prefix>.<base-36 random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelIdentity {
    name: String,
}

impl ChannelIdentity {
    pub fn new(prefix: &str, random: u32) -> Self {
        Self {
            name: format!("{prefix}{CHANNEL_NAME_SEPARATOR}{}", to_base36(random)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    // u32::MAX is "1z141z3"
    let mut buf = [0u8; 7];
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = DIGITS[(value % 36) as usize];
        value /= 36;
        if value == 0 {
            break;
        }
    }
    buf[pos..].iter().map(|&b| b as char).collect()
}

/// Source of the random suffix of channel names.
pub trait RandomSource {
    /// `None` if the source failed to produce a value.
    fn next_u32(&mut self) -> Option<u32>;
}

/// The operating system's cryptographically secure generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_u32(&mut self) -> Option<u32> {
        let mut bytes = [0u8; 4];
        rand::rngs::OsRng.try_fill_bytes(&mut bytes).ok()?;
        Some(u32::from_ne_bytes(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelCreationError {
    #[error("Failed to create a uniquely named channel after {attempts} attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last_error: Option<io::Error>,
    },
    #[error("Failed to create the {resource} for channel {name}")]
    Companion {
        resource: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Tries up to [`CHANNEL_CREATE_MAX_RETRIES`] random names, stopping at the first one for which
/// `try_create` succeeds.  A failure of the random source consumes an attempt.
pub(crate) fn create_with_retries<R, T, F>(
    prefix: &str,
    rng: &mut R,
    mut try_create: F,
) -> Result<(ChannelIdentity, T), ChannelCreationError>
where
    R: RandomSource + ?Sized,
    F: FnMut(&ChannelIdentity) -> io::Result<T>,
{
    let mut last_error = None;
    for _ in 0..CHANNEL_CREATE_MAX_RETRIES {
        let Some(random) = rng.next_u32() else {
            continue;
        };
        let identity = ChannelIdentity::new(prefix, random);
        match try_create(&identity) {
            Ok(resource) => return Ok((identity, resource)),
            Err(e) => last_error = Some(e),
        }
    }
    Err(ChannelCreationError::RetriesExhausted {
        attempts: CHANNEL_CREATE_MAX_RETRIES,
        last_error,
    })
}

/// Supervisor-owned half of a diagnostic channel, plus the worker-facing handles it hands out.
/// Every resource is released exactly once, by [`ChannelEndpoint::close`] or on drop.
pub struct ChannelEndpoint {
    identity: ChannelIdentity,
    receiver: sys::Receiver,
    signal: sys::Signal,
    sender: sys::Sender,
}

impl ChannelEndpoint {
    pub fn create(
        prefix: &str,
        namespace: &ChannelNamespace,
    ) -> Result<Self, ChannelCreationError> {
        Self::create_with(prefix, namespace, &mut OsRandom)
    }

    pub fn create_with<R: RandomSource + ?Sized>(
        prefix: &str,
        namespace: &ChannelNamespace,
        rng: &mut R,
    ) -> Result<Self, ChannelCreationError> {
        let (identity, receiver) = create_with_retries(prefix, rng, |identity| {
            sys::Receiver::create(identity, namespace)
        })?;
        Self::with_companions(
            identity,
            receiver,
            sys::Signal::create,
            sys::Receiver::open_sender,
        )
    }

    /// Completes a channel whose receive side exists.  Anything created so far is released on
    /// drop if a companion fails.
    fn with_companions<S, O>(
        identity: ChannelIdentity,
        receiver: sys::Receiver,
        create_signal: S,
        open_sender: O,
    ) -> Result<Self, ChannelCreationError>
    where
        S: FnOnce() -> io::Result<sys::Signal>,
        O: FnOnce(&sys::Receiver) -> io::Result<sys::Sender>,
    {
        let companion = |resource: &'static str| {
            let name = identity.to_string();
            move |source: io::Error| ChannelCreationError::Companion {
                resource,
                name,
                source,
            }
        };
        let signal = create_signal().map_err(companion("signal"))?;
        let sender = open_sender(&receiver).map_err(companion("send handle"))?;

        tracing::debug!(channel = %identity, "Created diagnostic channel");
        Ok(Self {
            identity,
            receiver,
            signal,
            sender,
        })
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    /// Identifiers to publish in the handshake link for the worker.
    pub fn worker_ids(&self) -> WorkerIds {
        WorkerIds {
            signal: self.signal.worker_id(),
            sender: self.sender.raw_id(),
        }
    }

    /// Clears a signal left over from a previous cycle.
    pub fn reset_signal(&self) -> io::Result<()> {
        self.signal.reset()
    }

    /// Whether the worker has set the signal, without blocking.
    pub fn is_signaled(&self) -> io::Result<bool> {
        self.signal.wait(Duration::ZERO)
    }

    /// Waits up to `timeout` for the worker to set the signal.
    pub fn wait_signaled(&self, timeout: Duration) -> io::Result<bool> {
        self.signal.wait(timeout)
    }

    pub(crate) fn next_message_size(&self) -> io::Result<Option<usize>> {
        self.receiver.next_message_size()
    }

    pub(crate) fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.receiver.read_message(buf)
    }

    /// Releases the receive side, the signal and the send handle.
    pub fn close(self) {
        tracing::debug!(channel = %self.identity, "Closing diagnostic channel");
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("identity", &self.identity)
            .field("worker_ids", &self.worker_ids())
            .finish()
    }
}
