// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Expose the update cycle orchestrator components.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! End-to-end orchestrator for a trust-based software update cycle.
//!
//! A run builds and publishes two releases of a sample application,
//! installs the first, serves the repository over HTTP, lets the installed
//! client update itself and checks the version it reports afterwards.

/// Installed client invocations.
pub mod client;
/// Run configuration and platform defaults.
pub mod config;
/// Working directory creation and guarded removal.
pub mod environment;
/// Error taxonomy.
pub mod error;
/// Timestamped stage journal.
pub mod journal;
/// Operator prompt policies.
pub mod operator;
/// Stage sequencing and run report.
pub mod pipeline;
/// Host checks run before a cycle.
pub mod preflight;
/// External process execution.
pub mod process;
/// Bundler, publisher and installer steps.
pub mod release;
/// Update server supervision.
pub mod server;
/// Static repository file server.
pub mod serve;
/// Outcome verification.
pub mod verify;
/// Scoped version marker mutation.
pub mod version;

pub use config::RunConfig;
pub use error::{HarnessError, HarnessResult};
pub use operator::{Confirmation, ConsoleOperator, KeepWorkingDirs, Operator, ScriptedOperator};
pub use pipeline::{Pipeline, RunReport, Stage, StageStatus};
