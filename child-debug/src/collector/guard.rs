// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// Process-wide guard taken by the first fault.  It is never released: a process that faulted
/// once is on its way out.
pub(crate) static FAULT_GUARD: ReentrancyGuard = ReentrancyGuard::new();

/// A one-shot flag.  Exactly one caller of [`ReentrancyGuard::try_enter`] ever wins.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    held: AtomicBool,
}

impl ReentrancyGuard {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// `true` for the first caller only.  Async-signal-safe.
    pub fn try_enter(&self) -> bool {
        !self.held.swap(true, SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(SeqCst)
    }
}
