// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Render collaborator command templates and run them under deadlines.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::Stage;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long captured output may keep arriving after the child exited.
const READER_GRACE: Duration = Duration::from_millis(200);

/// Shared flag tripped when the operator interrupts the run.
///
/// Clones observe the same flag. Two tokens compare equal when they share it.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// A fresh, untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that running and pending work stops.
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Interrupt::trip`] was called on any clone.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl PartialEq for Interrupt {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Interrupt {}

/// Placeholder values substituted into command templates.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: BTreeMap<&'static str, String>,
}

impl Vars {
    /// Start with no placeholders bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `{key}` to `value`.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.values.insert(key, value.to_string());
        self
    }

    /// Bind `{key}` to a filesystem path.
    #[must_use]
    pub fn with_path(self, key: &'static str, path: &Path) -> Self {
        self.with(key, path.display())
    }

    /// Substitute every bound placeholder in `template`.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        self.values
            .iter()
            .fold(template.to_owned(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
    }
}

/// A fully rendered invocation of an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    stage: Stage,
    argv: Vec<String>,
    cwd: PathBuf,
    interrupt: Option<Interrupt>,
}

impl ToolCommand {
    /// Render `template` with `vars`; the command runs inside `cwd`.
    pub fn from_template(
        stage: Stage,
        template: &[String],
        vars: &Vars,
        cwd: &Path,
    ) -> HarnessResult<Self> {
        let argv: Vec<String> = template.iter().map(|part| vars.render(part)).collect();
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(HarnessError::Config(format!(
                "stage {stage}: empty command template"
            )));
        }
        Ok(Self {
            stage,
            argv,
            cwd: cwd.to_path_buf(),
            interrupt: None,
        })
    }

    /// Invoke `program` directly with no arguments.
    #[must_use]
    pub fn program(stage: Stage, program: &Path, cwd: &Path) -> Self {
        Self {
            stage,
            argv: vec![program.display().to_string()],
            cwd: cwd.to_path_buf(),
            interrupt: None,
        }
    }

    /// Abort the command, killing the child, once `interrupt` trips.
    #[must_use]
    pub fn interruptible(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_tripped)
    }

    /// Stage this command belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Rendered argument vector, program first.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Program name used in diagnostics.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.argv[0]
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).current_dir(&self.cwd);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> HarnessResult<Child> {
        if self.interrupted() {
            return Err(HarnessError::Interrupted { stage: self.stage });
        }
        debug!("stage {}: exec {}", self.stage, self.argv.join(" "));
        cmd.spawn().map_err(|source| HarnessError::Spawn {
            stage: self.stage,
            tool: self.tool().to_owned(),
            source,
        })
    }

    /// Run in the foreground with inherited stdio and require exit code 0.
    pub fn run(&self, timeout: Duration) -> HarnessResult<()> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = self.spawn(cmd)?;
        let status = self.wait(&mut child, timeout)?;
        self.check(status)
    }

    /// Run with stdout captured and require exit code 0.
    pub fn capture(&self, timeout: Duration) -> HarnessResult<String> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = self.spawn(cmd)?;
        let chunks = child.stdout.take().map(spawn_reader);
        // On timeout or interrupt the reader is abandoned, not joined.
        let status = self.wait(&mut child, timeout)?;
        let bytes = chunks.map(|rx| self.drain(&rx)).unwrap_or_default();
        self.check(status)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Collect output until the pipe closes or the grace period runs out.
    /// A descendant that inherited stdout can hold the pipe open forever.
    fn drain(&self, rx: &Receiver<Vec<u8>>) -> Vec<u8> {
        let deadline = Instant::now() + READER_GRACE;
        let mut bytes = Vec::new();
        loop {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Disconnected) => return bytes,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "stage {}: stdout of {} still held open by a descendant",
                        self.stage,
                        self.tool()
                    );
                    return bytes;
                }
            }
        }
    }

    /// Start in the background with stdin detached.
    pub fn spawn_background(&self) -> HarnessResult<Child> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let child = self.spawn(cmd)?;
        info!("stage {}: started {} (pid {})", self.stage, self.tool(), child.id());
        Ok(child)
    }

    fn wait(&self, child: &mut Child, timeout: Duration) -> HarnessResult<ExitStatus> {
        let start = Instant::now();
        loop {
            if self.interrupted() {
                warn!("stage {}: interrupted, killing {}", self.stage, self.tool());
                let _ = child.kill();
                let _ = child.wait();
                return Err(HarnessError::Interrupted { stage: self.stage });
            }
            if let Some(status) = child
                .try_wait()
                .map_err(|err| HarnessError::io("wait", &self.argv[0], err))?
            {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                warn!(
                    "stage {}: {} exceeded {timeout:?}, killing",
                    self.stage,
                    self.tool()
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(self.timeout_error(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn timeout_error(&self, limit: Duration) -> HarnessError {
        HarnessError::Timeout {
            stage: self.stage,
            tool: self.tool().to_owned(),
            limit,
        }
    }

    fn check(&self, status: ExitStatus) -> HarnessResult<()> {
        if status.success() {
            return Ok(());
        }
        // Terminal interrupts reach the child's process group as well.
        if self.interrupted() {
            return Err(HarnessError::Interrupted { stage: self.stage });
        }
        Err(HarnessError::ExternalProcess {
            stage: self.stage,
            tool: self.tool().to_owned(),
            code: status.code(),
        })
    }
}

fn spawn_reader(mut stdout: ChildStdout) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(stage: Stage, script: &str) -> ToolCommand {
        let template = vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()];
        ToolCommand::from_template(stage, &template, &Vars::new(), Path::new(".")).unwrap()
    }

    #[test]
    fn render_substitutes_bound_placeholders_only() {
        let vars = Vars::new()
            .with("version", "2.0")
            .with_path("dist", Path::new("/tmp/dist"));
        assert_eq!(
            vars.render("--distpath={dist}/{version}/{unknown}"),
            "--distpath=/tmp/dist/2.0/{unknown}"
        );
    }

    #[test]
    fn empty_template_is_rejected() {
        let err = ToolCommand::from_template(Stage::BuildV1, &[], &Vars::new(), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_names_stage() {
        let err = sh(Stage::PublishV1, "exit 4").run(Duration::from_secs(5)).unwrap_err();
        match err {
            HarnessError::ExternalProcess { stage, code, .. } => {
                assert_eq!(stage, Stage::PublishV1);
                assert_eq!(code, Some(4));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn capture_returns_stdout() {
        let out = sh(Stage::ClientVerifyRun, "echo my_app 2.0")
            .capture(Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.trim(), "my_app 2.0");
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_slow_process() {
        let err = sh(Stage::BuildV1, "sleep 5")
            .run(Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn capture_deadline_ignores_inherited_stdout() {
        let started = Instant::now();
        let err = sh(Stage::ClientVerifyRun, "sleep 8 & sleep 8")
            .capture(Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn capture_keeps_output_when_descendant_holds_stdout() {
        let started = Instant::now();
        let out = sh(Stage::ClientVerifyRun, "echo my_app 2.0; sleep 8 &")
            .capture(Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.trim(), "my_app 2.0");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn tripped_interrupt_kills_running_tool() {
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        let tripper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.trip();
        });
        let started = Instant::now();
        let err = sh(Stage::BuildV2, "exec sleep 8")
            .interruptible(&interrupt)
            .run(Duration::from_secs(30))
            .unwrap_err();
        tripper.join().unwrap();
        assert!(matches!(err, HarnessError::Interrupted { stage: Stage::BuildV2 }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn tripped_interrupt_prevents_spawn() {
        let interrupt = Interrupt::new();
        interrupt.trip();
        let program = Path::new("/nonexistent/main");
        let err = ToolCommand::program(Stage::ClientUpdate, program, Path::new("."))
            .interruptible(&interrupt)
            .run(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Interrupted { stage: Stage::ClientUpdate }));
    }

    #[test]
    fn interrupt_clones_share_state() {
        let a = Interrupt::new();
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Interrupt::new());
        b.trip();
        assert!(a.is_tripped());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let cmd = ToolCommand::program(
            Stage::ClientUpdate,
            Path::new("/nonexistent/update-cycle/main"),
            Path::new("."),
        );
        let err = cmd.run(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }));
    }
}
