// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decide whether the client reported the updated version.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use serde::Serialize;

/// Captured client output and the verdict derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    /// Marker that had to appear in the output.
    pub expected: String,
    /// Standard output of the verification run.
    pub output: String,
    /// Whether `expected` was found in `output`.
    pub passed: bool,
}

/// Check `output` for `"<app_name> <version>"`.
#[must_use]
pub fn verify(output: &str, app_name: &str, version: &str) -> UpdateOutcome {
    let expected = format!("{app_name} {version}");
    UpdateOutcome {
        passed: output.contains(&expected),
        output: output.to_owned(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updated_version_passes() {
        assert!(verify("starting...\nmy_app 2.0\nbye\n", "my_app", "2.0").passed);
    }

    #[test]
    fn old_version_or_empty_fails() {
        assert!(!verify("my_app 1.0\n", "my_app", "2.0").passed);
        assert!(!verify("", "my_app", "2.0").passed);
        assert!(!verify("other_app 2.0", "my_app", "2.0").passed);
    }
}
