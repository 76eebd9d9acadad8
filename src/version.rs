// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Scoped bump and rollback of the application version marker.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Version marker mutation.
//!
//! The settings source lives in the project tree, outside every working
//! directory, so a bump must never outlive the scope that made it.
//! [`VersionBump`] restores the original bytes on [`VersionBump::rollback`]
//! or, failing that, when dropped.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Replace every occurrence of `from` with `to`; `None` when `from` is absent.
#[must_use]
pub fn substitute(text: &str, from: &str, to: &str) -> Option<String> {
    text.contains(from).then(|| text.replace(from, to))
}

/// Active version bump of a settings source file.
#[derive(Debug)]
pub struct VersionBump {
    path: PathBuf,
    original: String,
    to_marker: String,
    restored: bool,
}

impl VersionBump {
    /// Rewrite `from_marker` to `to_marker` in `path`.
    pub fn apply(path: &Path, from_marker: &str, to_marker: &str) -> HarnessResult<Self> {
        let original =
            fs::read_to_string(path).map_err(|err| HarnessError::io("read", path, err))?;
        let bumped = substitute(&original, from_marker, to_marker).ok_or_else(|| {
            HarnessError::VersionMarkerMissing {
                path: path.to_path_buf(),
                marker: from_marker.to_owned(),
            }
        })?;
        fs::write(path, bumped).map_err(|err| HarnessError::io("write", path, err))?;
        info!("bumped {} to {to_marker:?}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            original,
            to_marker: to_marker.to_owned(),
            restored: false,
        })
    }

    /// Settings file under mutation.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restore the original contents.
    pub fn rollback(mut self) -> HarnessResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> HarnessResult<()> {
        if self.restored {
            return Ok(());
        }
        fs::write(&self.path, &self.original)
            .map_err(|err| HarnessError::io("restore", &self.path, err))?;
        self.restored = true;
        info!("rolled back {} from {:?}", self.path.display(), self.to_marker);
        Ok(())
    }
}

impl Drop for VersionBump {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        warn!("rolling back {} on early exit", self.path.display());
        if let Err(err) = self.restore() {
            error!("version rollback failed, source left bumped: {err}");
        }
    }
}
