// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Crash diagnostics for supervised worker processes.
//!
//! A supervisor spawns workers that run test content directly against hardware. When a worker
//! faults, we want its processor context (the register state at the time of the fault) to reach
//! the supervisor, even though the worker itself may be in no shape to do anything useful.
//!
//! Architecturally, it consists of three parts:
//! 1. A named channel, created by the supervisor before the worker starts.  It consists of a
//!    receive side the supervisor keeps, a send handle the worker inherits, and a companion signal
//!    primitive the worker sets once it has written.  The identifiers of the worker-facing
//!    resources are published in a small [`HandshakeLink`] that lives in memory shared between the
//!    two processes.
//! 2. A fault interceptor, installed by the worker.  On the first fault it copies the raw context
//!    record into the channel, sets the signal, and then lets the default OS handling proceed
//!    (core dump, termination).  It runs under a constrained environment where many standard
//!    operations are illegal: <https://man7.org/linux/man-pages/man7/signal-safety.7.html>.
//!    A second fault while the first is being handled blocks the faulting thread forever.
//! 3. A drain, run by the supervisor once it knows the worker died or hung.  It reads whatever
//!    messages are pending, then releases every channel resource and clears the handshake link.
//!
//! The captured message is the native context record (`ucontext_t` on Unix, `CONTEXT` on
//! Windows) with no header.  Supervisor and worker must be the same build.

mod api;
pub mod channel;
pub mod collector;
pub mod receiver;
mod shared;

pub use api::*;
pub use channel::{
    ChannelCreationError, ChannelEndpoint, ChannelIdentity, ChannelNamespace, OsRandom,
    RandomSource,
};
pub use collector::{install, ContextRecord, InstallOutcome, ReentrancyGuard, CONTEXT_RECORD_SIZE};
pub use receiver::{drain, DiagnosticMessage, Drain, DrainError, DrainOutcome, DrainReport};
pub use shared::configuration::{
    default_signals, ChildDebugConfiguration, ConfigurationError, OnCrashAction,
};
pub use shared::constants::*;
pub use shared::handshake::{HandshakeLink, RawId, WorkerIds, DISABLED_ID, INVALID_ID};
