// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Support code for end-to-end tests of the diagnostic channel.
//!
//! The `child_debug_bin_test` binary plays the supervisor: it resolves `--on-crash`, forks a
//! worker that misbehaves in the requested way, waits for it (killing it past a timeout), drains
//! the channel and prints a [`ScenarioReport`] as JSON on stdout.  The tests in `tests/` run it
//! and check the report.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[cfg(unix)]
pub mod shared_region;

/// How the worker misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Null pointer write.
    Crash,
    /// `abort()`.
    Abort,
    /// Exits cleanly without faulting.
    Exit,
    /// Faults, and faults again while the first fault is being handled.
    Nested,
    /// Never finishes.
    Hang,
}

impl Scenario {
    /// Whether the worker blocks a marker signal before faulting, so the captured signal mask can
    /// be checked.
    pub fn sets_echo(&self) -> bool {
        matches!(self, Scenario::Crash | Scenario::Abort | Scenario::Nested)
    }
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Scenario::Crash),
            "abort" => Ok(Scenario::Abort),
            "exit" => Ok(Scenario::Exit),
            "nested" => Ok(Scenario::Nested),
            "hang" => Ok(Scenario::Hang),
            other => anyhow::bail!("Unknown scenario {other}"),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scenario::Crash => "crash",
            Scenario::Abort => "abort",
            Scenario::Exit => "exit",
            Scenario::Nested => "nested",
            Scenario::Hang => "hang",
        };
        f.write_str(s)
    }
}

/// What the worker reported about installing the interceptor, through the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerInstall {
    NotReported,
    Disabled,
    InvalidSender,
    Installed,
    Failed,
}

impl WorkerInstall {
    pub fn to_raw(self) -> u32 {
        match self {
            WorkerInstall::NotReported => 0,
            WorkerInstall::Disabled => 1,
            WorkerInstall::InvalidSender => 2,
            WorkerInstall::Installed => 3,
            WorkerInstall::Failed => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => WorkerInstall::Disabled,
            2 => WorkerInstall::InvalidSender,
            3 => WorkerInstall::Installed,
            4 => WorkerInstall::Failed,
            _ => WorkerInstall::NotReported,
        }
    }
}

impl From<child_debug::InstallOutcome> for WorkerInstall {
    fn from(outcome: child_debug::InstallOutcome) -> Self {
        match outcome {
            child_debug::InstallOutcome::Disabled => WorkerInstall::Disabled,
            child_debug::InstallOutcome::InvalidSender => WorkerInstall::InvalidSender,
            child_debug::InstallOutcome::Installed => WorkerInstall::Installed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFate {
    Exited { code: i32 },
    Signaled { signal: i32 },
    /// Still running at the deadline; the supervisor killed it.
    Hung,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub on_crash: String,
    /// Whether a channel was armed for the worker.
    pub capture_armed: bool,
    pub install: WorkerInstall,
    pub fate: WorkerFate,
    /// Whether the worker set the signal before the supervisor drained.
    pub signaled: bool,
    /// Whether a drain ran at all.
    pub drained: bool,
    pub drain_complete: bool,
    pub message_sizes: Vec<usize>,
    pub context_record_size: usize,
    /// Whether the marker signal blocked by the worker is in the captured signal mask.
    pub echo_matched: bool,
    pub link_cleared: bool,
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names() {
        for scenario in [
            Scenario::Crash,
            Scenario::Abort,
            Scenario::Exit,
            Scenario::Nested,
            Scenario::Hang,
        ] {
            assert_eq!(scenario.to_string().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("segv".parse::<Scenario>().is_err());
    }

    #[test]
    fn test_report_format() {
        let report = ScenarioReport {
            scenario: Scenario::Hang,
            on_crash: "context".to_string(),
            capture_armed: true,
            install: WorkerInstall::Installed,
            fate: WorkerFate::Hung,
            signaled: false,
            drained: true,
            drain_complete: true,
            message_sizes: vec![],
            context_record_size: 936,
            echo_matched: false,
            link_cleared: true,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "hang");
        assert_eq!(json["install"], "installed");
        assert_eq!(json["fate"]["kind"], "hung");
        let back: ScenarioReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_install_raw_values() {
        for install in [
            WorkerInstall::NotReported,
            WorkerInstall::Disabled,
            WorkerInstall::InvalidSender,
            WorkerInstall::Installed,
            WorkerInstall::Failed,
        ] {
            assert_eq!(WorkerInstall::from_raw(install.to_raw()), install);
        }
    }
}
