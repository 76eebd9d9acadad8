// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Build the run configuration from platform defaults and an optional TOML file.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Run configuration.
//!
//! A [`RunConfig`] is assembled once at startup and handed to every
//! component by reference. Only [`Platform::default_dirs`] consults the
//! process environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::environment::WorkingDirs;
use crate::error::{HarnessError, HarnessResult};
use crate::process::Interrupt;

/// Application exercised by the update cycle.
pub const DEFAULT_APP_NAME: &str = "my_app";
/// Settings source holding the version marker, relative to the project root.
pub const DEFAULT_SETTINGS_FILE: &str = "src/myapp/settings.py";
/// Version marker template; `{version}` is replaced by the version literal.
pub const DEFAULT_VERSION_MARKER: &str = "APP_VERSION = '{version}'";
/// Port the update server listens on.
pub const DEFAULT_PORT: u16 = 8000;

const DEFAULT_TOOL_SECS: u64 = 900;
const DEFAULT_CLIENT_SECS: u64 = 600;
const DEFAULT_READY_SECS: u64 = 10;
const PROBE_BACKOFF_MS: u64 = 100;
const PROBE_CEILING_MS: u64 = 1_000;

/// Host platforms with known install and data locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Microsoft Windows.
    Windows,
    /// Apple macOS.
    MacOs,
}

impl Platform {
    /// Detect the host platform.
    pub fn detect() -> HarnessResult<Self> {
        Self::from_os(std::env::consts::OS)
    }

    /// Map an OS identifier (as in `std::env::consts::OS`) to a platform.
    pub fn from_os(os: &str) -> HarnessResult<Self> {
        match os {
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::MacOs),
            other => Err(HarnessError::UnsupportedPlatform(other.to_owned())),
        }
    }

    /// Derive `(install_dir, data_dir)` for `app` from the host environment.
    pub fn default_dirs(self, app: &str) -> HarnessResult<(PathBuf, PathBuf)> {
        match self {
            Self::Windows => {
                let local = std::env::var_os("LOCALAPPDATA")
                    .map(PathBuf::from)
                    .ok_or_else(|| HarnessError::Config("LOCALAPPDATA is not set".into()))?;
                Ok((local.join("Programs").join(app), local.join(app)))
            }
            Self::MacOs => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .ok_or_else(|| HarnessError::Config("HOME is not set".into()))?;
                Ok((
                    home.join("Applications").join(app),
                    home.join("Library").join(app),
                ))
            }
        }
    }
}

/// Argv templates for the external collaborators.
///
/// Each entry may contain the placeholders `{app}`, `{version}`, `{dist}`,
/// `{work}`, `{repository}`, `{archive}`, `{dest}`, `{port}` and `{root}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommands {
    /// Update repository initializer.
    pub repo_init: Vec<String>,
    /// Release bundler.
    pub bundler: Vec<String>,
    /// Repository publisher.
    pub publisher: Vec<String>,
    /// Archive extractor used for the simulated install.
    pub extractor: Vec<String>,
    /// HTTP file server rooted at the repository.
    pub server: Vec<String>,
}

impl Default for ToolCommands {
    fn default() -> Self {
        let python = if cfg!(windows) { "python" } else { "python3" };
        Self {
            repo_init: argv(&[python, "repo_init.py"]),
            bundler: argv(&[
                "pyinstaller",
                "main.spec",
                "--clean",
                "-y",
                "--distpath",
                "{dist}",
                "--workpath",
                "{work}",
            ]),
            publisher: argv(&[python, "repo_add_bundle.py"]),
            extractor: argv(&["tar", "-xf", "{archive}", "-C", "{dest}"]),
            server: argv(&[
                python,
                "-m",
                "http.server",
                "{port}",
                "--directory",
                "{repository}",
            ]),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}

/// Deadlines applied to subprocess waits and the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for each bundler, publisher, initializer and extractor run.
    pub tool: Duration,
    /// Deadline for each client invocation.
    pub client: Duration,
    /// Total time allowed for the server to answer a probe.
    pub ready: Duration,
    /// Initial delay between readiness probes.
    pub probe_backoff: Duration,
    /// Upper bound for the delay between readiness probes.
    pub probe_ceiling: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tool: Duration::from_secs(DEFAULT_TOOL_SECS),
            client: Duration::from_secs(DEFAULT_CLIENT_SECS),
            ready: Duration::from_secs(DEFAULT_READY_SECS),
            probe_backoff: Duration::from_millis(PROBE_BACKOFF_MS),
            probe_ceiling: Duration::from_millis(PROBE_CEILING_MS),
        }
    }
}

/// Resolved configuration for one update cycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Application name; also the suffix every working directory must carry.
    pub app_name: String,
    /// Seed the targets cache so the publisher can compute a patch.
    pub patch_updates: bool,
    /// Project root; tools run with this as their working directory.
    pub root: PathBuf,
    /// Scratch directory holding builds and the repository.
    pub scratch_dir: PathBuf,
    /// Directory the client is installed into.
    pub install_dir: PathBuf,
    /// Per-user data directory of the client.
    pub data_dir: PathBuf,
    /// Settings source holding the version marker.
    pub settings_file: PathBuf,
    /// Version marker template.
    pub version_marker: String,
    /// Version of the first release.
    pub from_version: String,
    /// Version of the second release.
    pub to_version: String,
    /// File name of the installed client executable.
    pub client_executable: String,
    /// Port the update server listens on.
    pub port: u16,
    /// External collaborator commands.
    pub tools: ToolCommands,
    /// Subprocess and probe deadlines.
    pub timeouts: Timeouts,
    /// Tripped when the operator interrupts the run.
    pub interrupt: Interrupt,
}

impl RunConfig {
    /// Build a configuration with explicit install and data directories.
    ///
    /// Everything else takes the sample application defaults relative to
    /// `root`.
    pub fn with_dirs(
        app_name: &str,
        root: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let root = root.into();
        let client_executable = if cfg!(windows) { "main.exe" } else { "main" };
        Self {
            app_name: app_name.to_owned(),
            patch_updates: true,
            scratch_dir: root.join(format!("temp_{app_name}")),
            install_dir: install_dir.into(),
            data_dir: data_dir.into(),
            settings_file: root.join(DEFAULT_SETTINGS_FILE),
            version_marker: DEFAULT_VERSION_MARKER.to_owned(),
            from_version: "1.0".to_owned(),
            to_version: "2.0".to_owned(),
            client_executable: client_executable.to_owned(),
            port: DEFAULT_PORT,
            tools: ToolCommands::default(),
            timeouts: Timeouts::default(),
            interrupt: Interrupt::new(),
            root,
        }
    }

    /// Build the configuration for this host.
    ///
    /// Directories come from the configuration file when it names both the
    /// install and data directory; otherwise they are derived from the
    /// detected platform, which fails on unsupported hosts.
    pub fn from_host(root: impl Into<PathBuf>, config_file: Option<&Path>) -> HarnessResult<Self> {
        let root = root.into();
        let file = match config_file {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        let app_name = file
            .app_name
            .clone()
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_owned());
        let (install_dir, data_dir) = match (&file.dirs.install, &file.dirs.data) {
            (Some(install), Some(data)) => (resolve(&root, install), resolve(&root, data)),
            _ => {
                let platform = Platform::detect()?;
                let (install, data) = platform.default_dirs(&app_name)?;
                (
                    file.dirs.install.as_ref().map_or(install, |p| resolve(&root, p)),
                    file.dirs.data.as_ref().map_or(data, |p| resolve(&root, p)),
                )
            }
        };
        let mut config = Self::with_dirs(&app_name, root, install_dir, data_dir);
        file.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot drive a run.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(HarnessError::Config("app_name must not be empty".into()));
        }
        if self.from_version == self.to_version {
            return Err(HarnessError::Config(format!(
                "from_version and to_version must differ (both {})",
                self.from_version
            )));
        }
        if !self.version_marker.contains("{version}") {
            return Err(HarnessError::Config(
                "version_marker must contain {version}".into(),
            ));
        }
        let tools = [
            ("repo_init", &self.tools.repo_init),
            ("bundler", &self.tools.bundler),
            ("publisher", &self.tools.publisher),
            ("extractor", &self.tools.extractor),
            ("server", &self.tools.server),
        ];
        for (name, command) in tools {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(HarnessError::Config(format!("tools.{name} must name a program")));
            }
        }
        Ok(())
    }

    /// Working directories owned by the run.
    #[must_use]
    pub fn working_dirs(&self) -> WorkingDirs {
        WorkingDirs::new(
            &self.app_name,
            self.scratch_dir.clone(),
            self.install_dir.clone(),
            self.data_dir.clone(),
        )
    }

    /// Update repository published by the publisher.
    #[must_use]
    pub fn repository_dir(&self) -> PathBuf {
        self.scratch_dir.join("repository")
    }

    /// Bundler output directory for `version`.
    #[must_use]
    pub fn dist_dir(&self, version: &str) -> PathBuf {
        self.scratch_dir.join("dist").join(version)
    }

    /// Bundler work directory for `version`.
    #[must_use]
    pub fn work_dir(&self, version: &str) -> PathBuf {
        self.scratch_dir.join("build").join(version)
    }

    /// Client-side cache of previously installed archives.
    #[must_use]
    pub fn targets_cache_dir(&self) -> PathBuf {
        self.data_dir.join("update_cache").join("targets")
    }

    /// File name of the archive for `version`.
    #[must_use]
    pub fn archive_name(&self, version: &str) -> String {
        format!("{}-{version}.tar.gz", self.app_name)
    }

    /// Location of the published archive for `version`.
    #[must_use]
    pub fn published_archive(&self, version: &str) -> PathBuf {
        self.repository_dir()
            .join("targets")
            .join(self.archive_name(version))
    }

    /// Installed client executable.
    #[must_use]
    pub fn client_path(&self) -> PathBuf {
        self.install_dir.join(&self.client_executable)
    }

    /// Version marker rendered for `version`.
    #[must_use]
    pub fn marker_for(&self, version: &str) -> String {
        self.version_marker.replace("{version}", version)
    }

    /// Text the client must print after a successful update.
    #[must_use]
    pub fn expected_output(&self) -> String {
        format!("{} {}", self.app_name, self.to_version)
    }

    /// Base URL of the update server.
    #[must_use]
    pub fn server_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Stage journal written during the run; kept outside the working
    /// directories so it survives cleanup.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.root.join(format!("{}_update_cycle.log", self.app_name))
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    app_name: Option<String>,
    patch_updates: Option<bool>,
    #[serde(default)]
    dirs: DirsSection,
    #[serde(default)]
    source: SourceSection,
    #[serde(default)]
    client: ClientSection,
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    tools: ToolsSection,
    #[serde(default)]
    timeouts: TimeoutsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirsSection {
    scratch: Option<PathBuf>,
    install: Option<PathBuf>,
    data: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceSection {
    settings_file: Option<PathBuf>,
    version_marker: Option<String>,
    from_version: Option<String>,
    to_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientSection {
    executable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolsSection {
    repo_init: Option<Vec<String>>,
    bundler: Option<Vec<String>>,
    publisher: Option<Vec<String>>,
    extractor: Option<Vec<String>>,
    server: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsSection {
    tool_secs: Option<u64>,
    client_secs: Option<u64>,
    ready_secs: Option<u64>,
}

impl ConfigFile {
    fn load(path: &Path) -> HarnessResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| HarnessError::io("read", path, err))?;
        Self::parse(&text)
            .map_err(|err| HarnessError::Config(format!("{}: {err}", path.display())))
    }

    fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply(self, config: &mut RunConfig) {
        let root = config.root.clone();
        if let Some(flag) = self.patch_updates {
            config.patch_updates = flag;
        }
        if let Some(scratch) = self.dirs.scratch {
            config.scratch_dir = resolve(&root, &scratch);
        }
        if let Some(settings) = self.source.settings_file {
            config.settings_file = resolve(&root, &settings);
        }
        if let Some(marker) = self.source.version_marker {
            config.version_marker = marker;
        }
        if let Some(version) = self.source.from_version {
            config.from_version = version;
        }
        if let Some(version) = self.source.to_version {
            config.to_version = version;
        }
        if let Some(executable) = self.client.executable {
            config.client_executable = executable;
        }
        if let Some(port) = self.server.port {
            config.port = port;
        }
        let tools = &mut config.tools;
        for (slot, value) in [
            (&mut tools.repo_init, self.tools.repo_init),
            (&mut tools.bundler, self.tools.bundler),
            (&mut tools.publisher, self.tools.publisher),
            (&mut tools.extractor, self.tools.extractor),
            (&mut tools.server, self.tools.server),
        ] {
            if let Some(value) = value {
                *slot = value;
            }
        }
        if let Some(secs) = self.timeouts.tool_secs {
            config.timeouts.tool = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeouts.client_secs {
            config.timeouts.client = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeouts.ready_secs {
            config.timeouts.ready = Duration::from_secs(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunConfig {
        RunConfig::with_dirs("my_app", "/work", "/opt/my_app", "/data/my_app")
    }

    #[test]
    fn derived_paths_follow_layout() {
        let config = sample();
        assert_eq!(config.scratch_dir, Path::new("/work/temp_my_app"));
        assert_eq!(config.repository_dir(), Path::new("/work/temp_my_app/repository"));
        assert_eq!(config.dist_dir("2.0"), Path::new("/work/temp_my_app/dist/2.0"));
        assert_eq!(
            config.targets_cache_dir(),
            Path::new("/data/my_app/update_cache/targets")
        );
        assert_eq!(
            config.published_archive("1.0"),
            Path::new("/work/temp_my_app/repository/targets/my_app-1.0.tar.gz")
        );
        assert_eq!(config.expected_output(), "my_app 2.0");
        assert_eq!(config.marker_for("1.0"), "APP_VERSION = '1.0'");
    }

    #[test]
    fn platform_mapping_accepts_two_hosts() {
        assert_eq!(Platform::from_os("windows").unwrap(), Platform::Windows);
        assert_eq!(Platform::from_os("macos").unwrap(), Platform::MacOs);
        let err = Platform::from_os("freebsd").unwrap_err();
        assert!(matches!(err, HarnessError::UnsupportedPlatform(ref os) if os == "freebsd"));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let file = ConfigFile::parse(
            r#"
app_name = "ignored_here"
patch_updates = false

[server]
port = 8123

[tools]
bundler = ["sh", "build.sh", "{version}"]

[timeouts]
ready_secs = 3
"#,
        )
        .unwrap();
        let mut config = sample();
        file.apply(&mut config);
        assert!(!config.patch_updates);
        assert_eq!(config.port, 8123);
        assert_eq!(config.tools.bundler, vec!["sh", "build.sh", "{version}"]);
        assert_eq!(config.timeouts.ready, Duration::from_secs(3));
        assert_eq!(config.tools.publisher, ToolCommands::default().publisher);
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        assert!(ConfigFile::parse("colour = \"blue\"\n").is_err());
    }

    #[test]
    fn from_host_uses_explicit_dirs_on_any_platform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.toml");
        fs::write(
            &path,
            "[dirs]\ninstall = \"inst/my_app\"\ndata = \"/tmp/data/my_app\"\n",
        )
        .unwrap();
        let config = RunConfig::from_host(dir.path(), Some(&path)).unwrap();
        assert_eq!(config.install_dir, dir.path().join("inst/my_app"));
        assert_eq!(config.data_dir, Path::new("/tmp/data/my_app"));
    }

    #[test]
    fn validate_rejects_empty_tool() {
        let mut config = sample();
        config.tools.server.clear();
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }
}
