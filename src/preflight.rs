// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide deterministic host checks before an update cycle run.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::RunConfig;

/// Outcome of a single preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Short check identifier, for example `tool=bundler`.
    pub name: String,
    /// Whether the check passed.
    pub ok: bool,
    /// Resolved value or failure reason.
    pub detail: String,
}

impl Check {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Run every preflight check for `config` and log each result.
pub fn run(config: &RunConfig) -> Vec<Check> {
    let tools = [
        ("repo_init", &config.tools.repo_init),
        ("bundler", &config.tools.bundler),
        ("publisher", &config.tools.publisher),
        ("extractor", &config.tools.extractor),
        ("server", &config.tools.server),
    ];
    let mut checks: Vec<Check> = tools
        .into_iter()
        .map(|(name, argv)| check_tool(name, argv, &config.root))
        .collect();
    checks.push(check_settings(config));
    checks.push(check_port(config.port));
    for check in &checks {
        if check.ok {
            info!("check={} status=ok {}", check.name, check.detail);
        } else {
            warn!("check={} status=err reason={}", check.name, check.detail);
        }
    }
    checks
}

fn check_tool(name: &str, argv: &[String], root: &Path) -> Check {
    let label = format!("tool={name}");
    let Some(program) = argv.first() else {
        return Check::fail(label, "no program configured");
    };
    match resolve_program(program, root) {
        Some(path) => Check::pass(label, path.display().to_string()),
        None => Check::fail(label, format!("{program} not found")),
    }
}

/// Resolve a program as the process spawner would: relative paths against
/// `root`, bare names through `PATH`.
#[must_use]
pub fn resolve_program(program: &str, root: &Path) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let path = root.join(candidate);
        return path.is_file().then_some(path);
    }
    which::which(program).ok()
}

fn check_settings(config: &RunConfig) -> Check {
    let label = "settings";
    let marker = config.marker_for(&config.from_version);
    match fs::read_to_string(&config.settings_file) {
        Ok(text) if text.contains(&marker) => {
            Check::pass(label, config.settings_file.display().to_string())
        }
        Ok(_) => Check::fail(
            label,
            format!("{} lacks {marker}", config.settings_file.display()),
        ),
        Err(err) => Check::fail(label, format!("{}: {err}", config.settings_file.display())),
    }
}

fn check_port(port: u16) -> Check {
    let label = "port";
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => Check::pass(label, format!("{port} free")),
        Err(err) => Check::fail(label, format!("{port}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_programs_resolve_against_root() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("tools")).unwrap();
        fs::write(tmp.path().join("tools").join("bundle"), b"").unwrap();
        assert_eq!(
            resolve_program("tools/bundle", tmp.path()),
            Some(tmp.path().join("tools").join("bundle"))
        );
        assert_eq!(resolve_program("tools/missing", tmp.path()), None);
    }

    #[test]
    fn settings_check_requires_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RunConfig::with_dirs(
            "my_app",
            tmp.path(),
            tmp.path().join("my_app"),
            tmp.path().join("data_my_app"),
        );
        config.settings_file = tmp.path().join("settings.py");
        assert!(!check_settings(&config).ok);
        fs::write(&config.settings_file, "APP_VERSION = '2.0'\n").unwrap();
        assert!(!check_settings(&config).ok);
        fs::write(&config.settings_file, "APP_VERSION = '1.0'\n").unwrap();
        assert!(check_settings(&config).ok);
    }

    #[test]
    fn occupied_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!check_port(port).ok);
    }

    #[test]
    fn empty_tool_fails() {
        assert!(!check_tool("bundler", &[], Path::new("/")).ok);
    }
}
