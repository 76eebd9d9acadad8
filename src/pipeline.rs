// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Sequence the update cycle stages and collect the run report.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Update cycle pipeline.
//!
//! Stages run strictly in order and the first failure aborts the rest.
//! Once the run is interrupted no further stage starts except the must-run
//! ones.
//! `ROLLBACK_V1`, `SERVER_STOP` and `CLEANUP_OFFER` run on every path that
//! reached the stage guarding them: the version bump and the server are
//! scoped resources, and the cleanup offer follows every run.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use log::{error, info};
use serde::Serialize;

use crate::client::ClientDriver;
use crate::config::RunConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::journal::Journal;
use crate::operator::{Confirmation, Operator};
use crate::release::ReleasePipeline;
use crate::server::ServerSupervisor;
use crate::verify::{verify, UpdateOutcome};
use crate::version::VersionBump;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Configuration resolved.
    Init,
    /// Stale working directories removed.
    EnvReset,
    /// Working directories created.
    EnvCreate,
    /// Update repository initialised.
    RepoInit,
    /// First release built.
    BuildV1,
    /// First release published.
    PublishV1,
    /// First release extracted into the install directory.
    SimulateInstallV1,
    /// First release archive copied into the targets cache.
    PatchCacheSeed,
    /// Version marker bumped.
    BumpV2,
    /// Second release built.
    BuildV2,
    /// Second release published.
    PublishV2,
    /// Version marker restored.
    RollbackV1,
    /// Update server started and ready.
    ServerStart,
    /// Client launched to apply the update.
    ClientUpdate,
    /// Operator closed the client session.
    OperatorConfirm,
    /// Client launched again with output captured.
    ClientVerifyRun,
    /// Update server stopped.
    ServerStop,
    /// Captured output checked for the new version.
    OutcomeCheck,
    /// Operator offered removal of the working directories.
    CleanupOffer,
    /// Run finished.
    Done,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 20] = [
        Stage::Init,
        Stage::EnvReset,
        Stage::EnvCreate,
        Stage::RepoInit,
        Stage::BuildV1,
        Stage::PublishV1,
        Stage::SimulateInstallV1,
        Stage::PatchCacheSeed,
        Stage::BumpV2,
        Stage::BuildV2,
        Stage::PublishV2,
        Stage::RollbackV1,
        Stage::ServerStart,
        Stage::ClientUpdate,
        Stage::OperatorConfirm,
        Stage::ClientVerifyRun,
        Stage::ServerStop,
        Stage::OutcomeCheck,
        Stage::CleanupOffer,
        Stage::Done,
    ];

    /// Stable upper-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::EnvReset => "ENV_RESET",
            Stage::EnvCreate => "ENV_CREATE",
            Stage::RepoInit => "REPO_INIT",
            Stage::BuildV1 => "BUILD_V1",
            Stage::PublishV1 => "PUBLISH_V1",
            Stage::SimulateInstallV1 => "SIMULATE_INSTALL_V1",
            Stage::PatchCacheSeed => "PATCH_CACHE_SEED",
            Stage::BumpV2 => "BUMP_V2",
            Stage::BuildV2 => "BUILD_V2",
            Stage::PublishV2 => "PUBLISH_V2",
            Stage::RollbackV1 => "ROLLBACK_V1",
            Stage::ServerStart => "SERVER_START",
            Stage::ClientUpdate => "CLIENT_UPDATE",
            Stage::OperatorConfirm => "OPERATOR_CONFIRM",
            Stage::ClientVerifyRun => "CLIENT_VERIFY_RUN",
            Stage::ServerStop => "SERVER_STOP",
            Stage::OutcomeCheck => "OUTCOME_CHECK",
            Stage::CleanupOffer => "CLEANUP_OFFER",
            Stage::Done => "DONE",
        }
    }

    /// Stages that run regardless of upstream failure.
    #[must_use]
    pub const fn must_run(self) -> bool {
        matches!(self, Stage::RollbackV1 | Stage::ServerStop | Stage::CleanupOffer)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Final state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Stage completed.
    Passed,
    /// Stage failed.
    Failed,
    /// Stage never ran.
    Skipped,
}

impl StageStatus {
    fn label(self) -> &'static str {
        match self {
            StageStatus::Passed => "ok",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// One entry of the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    /// Stage the entry describes.
    pub stage: Stage,
    /// How the stage ended.
    pub status: StageStatus,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything observed during one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// RFC 3339 start time.
    pub started_at: String,
    /// RFC 3339 finish time.
    pub finished_at: String,
    /// Stage records in execution order, including skipped stages.
    pub stages: Vec<StageRecord>,
    /// Verification verdict, when the client output was captured.
    pub outcome: Option<UpdateOutcome>,
    /// Working directories still present after the cleanup offer.
    pub remaining_dirs: Vec<PathBuf>,
    /// Rendered error that ended the run.
    pub error_message: Option<String>,
    #[serde(skip)]
    error: Option<HarnessError>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now().to_rfc3339(),
            finished_at: String::new(),
            stages: Vec::new(),
            outcome: None,
            remaining_dirs: Vec::new(),
            error_message: None,
            error: None,
        }
    }

    /// Whether the run verified the update.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.outcome.as_ref().is_some_and(|o| o.passed)
    }

    /// Error that ended the run, if any.
    #[must_use]
    pub fn error(&self) -> Option<&HarnessError> {
        self.error.as_ref()
    }

    /// Status recorded for `stage`.
    #[must_use]
    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| record.status)
    }

    /// Process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match &self.error {
            None if self.passed() => 0,
            None => 1,
            Some(err) => err.exit_code(),
        }
    }
}

/// Drives one update cycle.
pub struct Pipeline<'a> {
    config: &'a RunConfig,
    operator: &'a mut dyn Operator,
    journal: Journal,
    report: RunReport,
}

impl<'a> Pipeline<'a> {
    /// Prepare a run with the given operator policy and journal.
    pub fn new(config: &'a RunConfig, operator: &'a mut dyn Operator, journal: Journal) -> Self {
        Self {
            config,
            operator,
            journal,
            report: RunReport::new(),
        }
    }

    /// Execute every stage and return the report.
    pub fn run(mut self) -> RunReport {
        self.mark(Stage::Init, StageStatus::Passed, None);
        let cycle = self.run_cycle();
        let cleanup = self.stage(Stage::CleanupOffer, |p| p.offer_cleanup());
        let error = cycle.err().or(cleanup.err());
        if error.is_none() {
            self.mark(Stage::Done, StageStatus::Passed, None);
        }
        self.finish(error)
    }

    fn run_cycle(&mut self) -> HarnessResult<()> {
        let config = self.config;
        let dirs = config.working_dirs();
        let release = ReleasePipeline::new(config);

        self.stage(Stage::EnvReset, |p| dirs.reset_all(&mut *p.operator).map(drop))?;
        self.stage(Stage::EnvCreate, |_| dirs.ensure_all())?;
        self.stage(Stage::RepoInit, |_| release.init_repository())?;
        self.stage(Stage::BuildV1, |_| {
            release.build_bundle(Stage::BuildV1, &config.from_version)
        })?;
        self.stage(Stage::PublishV1, |_| {
            release.publish_bundle(Stage::PublishV1, &config.from_version)
        })?;
        self.stage(Stage::SimulateInstallV1, |_| release.install_first_release())?;
        if config.patch_updates {
            self.stage(Stage::PatchCacheSeed, |p| {
                let digest = release.seed_patch_cache()?;
                p.journal
                    .record(Stage::PatchCacheSeed, "seeded", Some(&format!("sha256={digest}")));
                Ok(())
            })?;
        } else {
            self.mark(
                Stage::PatchCacheSeed,
                StageStatus::Skipped,
                Some("patch updates disabled".into()),
            );
        }
        self.release_second(&release)?;

        let server = match self.stage(Stage::ServerStart, |_| ServerSupervisor::new(config).start())
        {
            Ok(server) => server,
            Err(err) => {
                // Readiness failures happen after the spawn; start() has
                // already reaped the process.
                if matches!(
                    err,
                    HarnessError::ServerNotReady { .. } | HarnessError::ServerExited { .. }
                ) {
                    self.mark(
                        Stage::ServerStop,
                        StageStatus::Passed,
                        Some("server process reaped after failed start".into()),
                    );
                }
                return Err(err);
            }
        };
        let captured = self.drive_client();
        let stopped = self.stage(Stage::ServerStop, |_| server.stop());
        let output = captured?;
        stopped?;

        let outcome = verify(&output, &config.app_name, &config.to_version);
        self.report.outcome = Some(outcome.clone());
        self.stage(Stage::OutcomeCheck, |_| {
            if outcome.passed {
                info!("update verified: client reports {:?}", outcome.expected);
                Ok(())
            } else {
                Err(HarnessError::VerificationFailed {
                    expected: outcome.expected,
                })
            }
        })
    }

    /// Bump, build and publish the second release; the bump is rolled back
    /// whatever happens in between.
    fn release_second(&mut self, release: &ReleasePipeline<'_>) -> HarnessResult<()> {
        let config = self.config;
        let from = config.marker_for(&config.from_version);
        let to = config.marker_for(&config.to_version);
        let bump = self.stage(Stage::BumpV2, |_| {
            VersionBump::apply(&config.settings_file, &from, &to)
        })?;
        let published = self
            .stage(Stage::BuildV2, |_| {
                release.build_bundle(Stage::BuildV2, &config.to_version)
            })
            .and_then(|()| {
                self.stage(Stage::PublishV2, |_| {
                    release.publish_bundle(Stage::PublishV2, &config.to_version)
                })
            });
        let rolled_back = self.stage(Stage::RollbackV1, |_| bump.rollback());
        published?;
        rolled_back
    }

    fn drive_client(&mut self) -> HarnessResult<String> {
        let client = ClientDriver::new(self.config);
        self.stage(Stage::ClientUpdate, |_| client.run_once())?;
        self.stage(Stage::OperatorConfirm, |p| {
            client.await_operator(&mut *p.operator)
        })?;
        self.stage(Stage::ClientVerifyRun, |_| client.run_and_capture())
    }

    fn offer_cleanup(&mut self) -> HarnessResult<()> {
        let dirs = self.config.working_dirs();
        let remaining = dirs.existing();
        if remaining.is_empty() {
            info!("no working directories left");
            return Ok(());
        }
        for path in &remaining {
            info!("working directory present: {}", path.display());
        }
        let request = Confirmation::CleanupWorkingDirs {
            count: remaining.len(),
        };
        if self.operator.confirm(&request)? {
            let summary = dirs.remove_all()?;
            info!("removed {} working directories", summary.removed.len());
        } else {
            info!("leaving working directories in place");
        }
        self.report.remaining_dirs = dirs.existing();
        Ok(())
    }

    fn stage<T>(
        &mut self,
        stage: Stage,
        body: impl FnOnce(&mut Self) -> HarnessResult<T>,
    ) -> HarnessResult<T> {
        info!("==> {stage}");
        self.journal.record(stage, "start", None);
        let result = if !stage.must_run() && self.config.interrupt.is_tripped() {
            Err(HarnessError::Interrupted { stage })
        } else {
            body(self)
        };
        match &result {
            Ok(_) => self.mark(stage, StageStatus::Passed, None),
            Err(err) => {
                error!("stage {stage} failed: {err}");
                self.mark(stage, StageStatus::Failed, Some(err.to_string()));
            }
        }
        result
    }

    fn mark(&mut self, stage: Stage, status: StageStatus, detail: Option<String>) {
        self.journal.record(stage, status.label(), detail.as_deref());
        self.report.stages.push(StageRecord {
            stage,
            status,
            detail,
        });
    }

    fn finish(mut self, error: Option<HarnessError>) -> RunReport {
        for stage in Stage::ALL {
            if self.report.status(stage).is_none() {
                self.journal.record(stage, StageStatus::Skipped.label(), None);
                self.report.stages.push(StageRecord {
                    stage,
                    status: StageStatus::Skipped,
                    detail: None,
                });
            }
        }
        self.report.stages.sort_by_key(|record| record.stage);
        self.report.finished_at = Utc::now().to_rfc3339();
        self.report.error_message = error.as_ref().map(ToString::to_string);
        self.report.error = error;
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_all() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert_eq!(Stage::ALL.first(), Some(&Stage::Init));
        assert_eq!(Stage::ALL.last(), Some(&Stage::Done));
    }

    #[test]
    fn only_guarded_stages_must_run() {
        let must: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.must_run()).collect();
        assert_eq!(must, [Stage::RollbackV1, Stage::ServerStop, Stage::CleanupOffer]);
    }

    #[test]
    fn names_serialize_upper_snake() {
        let json = serde_json::to_string(&Stage::SimulateInstallV1).unwrap();
        assert_eq!(json, "\"SIMULATE_INSTALL_V1\"");
        assert_eq!(Stage::SimulateInstallV1.to_string(), "SIMULATE_INSTALL_V1");
    }
}
