// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the error taxonomy for update cycle runs.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors produced while driving an update cycle.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An external collaborator exited with a non-zero status.
    #[error("stage {stage}: {tool} exited with {}", render_code(.code))]
    ExternalProcess {
        /// Stage that invoked the tool.
        stage: Stage,
        /// Program name of the tool.
        tool: String,
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
    /// An external collaborator could not be started.
    #[error("stage {stage}: failed to spawn {tool}: {source}")]
    Spawn {
        /// Stage that invoked the tool.
        stage: Stage,
        /// Program name of the tool.
        tool: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },
    /// An external collaborator did not finish within its deadline.
    #[error("stage {stage}: {tool} timed out after {limit:?}")]
    Timeout {
        /// Stage that invoked the tool.
        stage: Stage,
        /// Program name of the tool.
        tool: String,
        /// Deadline that was exceeded.
        limit: Duration,
    },
    /// The operator interrupted the run.
    #[error("stage {stage}: interrupted by operator")]
    Interrupted {
        /// Stage that was running or about to start.
        stage: Stage,
    },
    /// The host operating system has no platform defaults.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    /// A filesystem operation failed.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
    /// The update server never answered a readiness probe.
    #[error("update server at {url} not ready after {}s", .waited.as_secs())]
    ServerNotReady {
        /// URL that was probed.
        url: String,
        /// Total time spent probing.
        waited: Duration,
    },
    /// The update server process exited before it became ready.
    #[error("update server exited early with {}", render_code(.code))]
    ServerExited {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
    /// The settings source does not contain the expected version marker.
    #[error("version marker {marker:?} not found in {}", .path.display())]
    VersionMarkerMissing {
        /// Settings source file.
        path: PathBuf,
        /// Marker that was searched for.
        marker: String,
    },
    /// The installed client did not report the expected version.
    #[error("client output does not contain {expected:?}")]
    VerificationFailed {
        /// Marker that was expected in the client output.
        expected: String,
    },
    /// Reading operator input failed.
    #[error("operator prompt failed: {0}")]
    Prompt(#[source] std::io::Error),
}

impl HarnessError {
    /// Wrap an I/O error with the operation and path it applied to.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Process exit code this error maps to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnsupportedPlatform(_) | Self::Config(_) => 2,
            Self::Interrupted { .. } => 130,
            _ => 1,
        }
    }
}

fn render_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_owned(),
    }
}

/// Result alias used across the crate.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_process_names_stage_and_tool() {
        let err = HarnessError::ExternalProcess {
            stage: Stage::BuildV2,
            tool: "pyinstaller".to_owned(),
            code: Some(3),
        };
        let text = err.to_string();
        assert!(text.contains("BUILD_V2"));
        assert!(text.contains("pyinstaller"));
        assert!(text.contains("code 3"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn timeout_keeps_sub_second_precision() {
        let err = HarnessError::Timeout {
            stage: Stage::ClientVerifyRun,
            tool: "main".to_owned(),
            limit: Duration::from_millis(500),
        };
        assert!(err.to_string().ends_with("timed out after 500ms"), "{err}");
    }

    #[test]
    fn interruption_maps_to_sigint_exit() {
        let err = HarnessError::Interrupted {
            stage: Stage::BuildV2,
        };
        assert_eq!(err.exit_code(), 130);
        assert_eq!(err.to_string(), "stage BUILD_V2: interrupted by operator");
    }

    #[test]
    fn startup_errors_map_to_exit_two() {
        assert_eq!(HarnessError::UnsupportedPlatform("linux".into()).exit_code(), 2);
        assert_eq!(HarnessError::Config("bad".into()).exit_code(), 2);
    }
}
