// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Append timestamped stage transitions to the run journal.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::warn;

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::Stage;

/// Line-per-event journal of a run. Write failures are logged, never fatal.
#[derive(Debug, Default)]
pub struct Journal {
    path: Option<PathBuf>,
}

impl Journal {
    /// Start a fresh journal at `path`, truncating any previous run.
    pub fn create(path: &Path) -> HarnessResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| HarnessError::io("create", parent, err))?;
        }
        File::create(path).map_err(|err| HarnessError::io("create", path, err))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
        })
    }

    /// A journal that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Location of the journal, if enabled.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `stage=<stage> status=<status>` with an optional detail.
    pub fn record(&self, stage: Stage, status: &str, detail: Option<&str>) {
        let Some(path) = &self.path else {
            return;
        };
        let mut line = format!("{} stage={stage} status={status}", Utc::now().to_rfc3339());
        if let Some(detail) = detail {
            line.push_str(" detail=");
            line.push_str(&detail.replace('\n', " "));
        }
        if let Err(err) = append(path, &line) {
            warn!("journal {}: {err}", path.display());
        }
    }
}

fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.flush()
}
