// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants shared by the supervisor and the worker side of the diagnostic channel.

/// Number of randomized names tried before channel creation gives up.
pub const CHANNEL_CREATE_MAX_RETRIES: usize = 16;

/// Separator between the channel prefix and its random suffix.
pub const CHANNEL_NAME_SEPARATOR: char = '.';

/// Prefix used when the executable name cannot be determined.
pub const DEFAULT_CHANNEL_PREFIX: &str = "child-debug";

/// Overrides the directory in which Unix channel sockets are bound.
pub const CHILD_DEBUG_CHANNEL_DIR: &str = "CHILD_DEBUG_CHANNEL_DIR";

/// Value assumed for `--on-crash` when the harness does not provide one.
pub const DEFAULT_ON_CRASH_ACTION: &str = "context";

/// Exit status for an invalid command line, as in `sysexits.h`.
pub const EX_USAGE: i32 = 64;
