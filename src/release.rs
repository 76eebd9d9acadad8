// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the bundler, repository tools and archive extractor for each release.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use log::info;
use sha2::{Digest, Sha256};

use crate::config::RunConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::Stage;
use crate::process::{ToolCommand, Vars};

/// Release steps backed by the external bundler and repository tools.
pub struct ReleasePipeline<'a> {
    config: &'a RunConfig,
}

impl<'a> ReleasePipeline<'a> {
    /// Bind the pipeline to a configuration.
    #[must_use]
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    /// Placeholder bindings for a release of `version`.
    #[must_use]
    pub fn vars(&self, version: &str) -> Vars {
        let config = self.config;
        Vars::new()
            .with("app", &config.app_name)
            .with("version", version)
            .with("port", config.port)
            .with_path("root", &config.root)
            .with_path("dist", &config.dist_dir(version))
            .with_path("work", &config.work_dir(version))
            .with_path("repository", &config.repository_dir())
            .with_path("archive", &config.published_archive(version))
            .with_path("dest", &config.install_dir)
    }

    fn tool(&self, stage: Stage, template: &[String], version: &str) -> HarnessResult<ToolCommand> {
        let command =
            ToolCommand::from_template(stage, template, &self.vars(version), &self.config.root)?;
        Ok(command.interruptible(&self.config.interrupt))
    }

    /// Create the update repository.
    pub fn init_repository(&self) -> HarnessResult<()> {
        let version = &self.config.from_version;
        self.tool(Stage::RepoInit, &self.config.tools.repo_init, version)?
            .run(self.config.timeouts.tool)
    }

    /// Build the application bundle for `version`.
    pub fn build_bundle(&self, stage: Stage, version: &str) -> HarnessResult<()> {
        info!("building {} {version}", self.config.app_name);
        self.tool(stage, &self.config.tools.bundler, version)?
            .run(self.config.timeouts.tool)
    }

    /// Add the most recently built bundle to the repository.
    pub fn publish_bundle(&self, stage: Stage, version: &str) -> HarnessResult<()> {
        info!("publishing {} {version}", self.config.app_name);
        self.tool(stage, &self.config.tools.publisher, version)?
            .run(self.config.timeouts.tool)
    }

    /// Extract the first release archive into the install directory.
    pub fn install_first_release(&self) -> HarnessResult<()> {
        let version = &self.config.from_version;
        info!(
            "installing {} into {}",
            self.config.archive_name(version),
            self.config.install_dir.display()
        );
        self.tool(Stage::SimulateInstallV1, &self.config.tools.extractor, version)?
            .run(self.config.timeouts.tool)
    }

    /// Copy the first release archive into the targets cache so the next
    /// publish can compute a patch against it. Returns the archive digest.
    pub fn seed_patch_cache(&self) -> HarnessResult<String> {
        let version = &self.config.from_version;
        let source = self.config.published_archive(version);
        let dest: PathBuf = self
            .config
            .targets_cache_dir()
            .join(self.config.archive_name(version));
        fs::copy(&source, &dest).map_err(|err| HarnessError::io("copy", &source, err))?;
        let expected = sha256_file(&source)?;
        let copied = sha256_file(&dest)?;
        if expected != copied {
            return Err(HarnessError::Config(format!(
                "targets cache copy {} does not match {} ({copied} != {expected})",
                dest.display(),
                source.display()
            )));
        }
        info!("seeded {} sha256={expected}", dest.display());
        Ok(expected)
    }
}

/// Hex SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> HarnessResult<String> {
    let mut file = File::open(path).map_err(|err| HarnessError::io("open", path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|err| HarnessError::io("read", path, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &Path) -> RunConfig {
        RunConfig::with_dirs(
            "my_app",
            base,
            base.join("programs").join("my_app"),
            base.join("data").join("my_app"),
        )
    }

    #[test]
    fn vars_scope_outputs_by_version() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let pipeline = ReleasePipeline::new(&config);
        let vars = pipeline.vars("2.0");
        assert_eq!(
            vars.render("{dist}"),
            config.scratch_dir.join("dist").join("2.0").display().to_string()
        );
        assert_eq!(vars.render("{app}-{version}"), "my_app-2.0");
    }

    #[test]
    fn seed_patch_cache_copies_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        config.working_dirs().ensure_all().unwrap();
        let archive = config.published_archive("1.0");
        fs::create_dir_all(archive.parent().unwrap()).unwrap();
        fs::write(&archive, b"v1 archive bytes").unwrap();

        let digest = ReleasePipeline::new(&config).seed_patch_cache().unwrap();
        let cached = config.targets_cache_dir().join("my_app-1.0.tar.gz");
        assert_eq!(fs::read(&cached).unwrap(), b"v1 archive bytes");
        assert_eq!(digest, sha256_file(&archive).unwrap());
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn seed_patch_cache_without_archive_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        config.working_dirs().ensure_all().unwrap();
        let err = ReleasePipeline::new(&config).seed_patch_cache().unwrap_err();
        assert!(matches!(err, HarnessError::Io { op: "copy", .. }));
    }
}
