// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Create and remove the working directories of an update cycle run.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Working directory management.
//!
//! Removal is only ever applied to paths whose final segment ends with the
//! application name. Anything else is skipped with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::operator::{Confirmation, Operator};

/// The fixed set of directories a run creates and may delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirs {
    app_name: String,
    scratch: PathBuf,
    install: PathBuf,
    data: PathBuf,
}

/// Result of a removal pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalSummary {
    /// Directories that were deleted.
    pub removed: Vec<PathBuf>,
    /// Directories left in place because they failed the name check.
    pub skipped: Vec<PathBuf>,
    /// The operator declined the removal.
    pub declined: bool,
}

impl WorkingDirs {
    /// Describe the working directories for `app_name`.
    pub fn new(app_name: &str, scratch: PathBuf, install: PathBuf, data: PathBuf) -> Self {
        Self {
            app_name: app_name.to_owned(),
            scratch,
            install,
            data,
        }
    }

    /// Scratch, install and data directories, in that order.
    #[must_use]
    pub fn paths(&self) -> [&Path; 3] {
        [self.scratch.as_path(), self.install.as_path(), self.data.as_path()]
    }

    /// Targets cache nested inside the data directory.
    #[must_use]
    pub fn targets_cache(&self) -> PathBuf {
        self.data.join("update_cache").join("targets")
    }

    /// Whether `path` carries the application name as its final segment suffix.
    #[must_use]
    pub fn is_removable(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(self.app_name.as_str()))
    }

    /// Directories of the set that currently exist.
    #[must_use]
    pub fn existing(&self) -> Vec<PathBuf> {
        self.paths()
            .into_iter()
            .filter(|path| path.exists())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Remove every existing directory after asking the operator once.
    pub fn reset_all(&self, operator: &mut dyn Operator) -> HarnessResult<RemovalSummary> {
        let existing = self.existing();
        if existing.is_empty() {
            return Ok(RemovalSummary::default());
        }
        for path in &existing {
            info!("found {}", path.display());
        }
        let request = Confirmation::ResetWorkingDirs {
            app: &self.app_name,
            count: existing.len(),
        };
        if !operator.confirm(&request)? {
            info!("operator kept existing directories");
            return Ok(RemovalSummary {
                declined: true,
                ..RemovalSummary::default()
            });
        }
        self.remove_all()
    }

    /// Remove every existing directory that passes the name check.
    pub fn remove_all(&self) -> HarnessResult<RemovalSummary> {
        let mut summary = RemovalSummary::default();
        for path in self.paths() {
            if !path.exists() {
                continue;
            }
            if !self.is_removable(path) {
                warn!(
                    "refusing to remove {}: final segment does not end with {}",
                    path.display(),
                    self.app_name
                );
                summary.skipped.push(path.to_path_buf());
                continue;
            }
            fs::remove_dir_all(path).map_err(|err| HarnessError::io("remove", path, err))?;
            info!("removed {}", path.display());
            summary.removed.push(path.to_path_buf());
        }
        Ok(summary)
    }

    /// Create every directory plus the targets cache. Idempotent.
    pub fn ensure_all(&self) -> HarnessResult<()> {
        let cache = self.targets_cache();
        for path in self.paths().into_iter().chain([cache.as_path()]) {
            fs::create_dir_all(path).map_err(|err| HarnessError::io("create", path, err))?;
        }
        Ok(())
    }
}
