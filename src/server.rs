// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Supervise the background update server and probe it for readiness.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Update server supervision.
//!
//! [`ServerSupervisor::start`] launches the file server, then probes it
//! over HTTP with bounded exponential backoff until it answers. The
//! returned [`ServerHandle`] must be passed to [`ServerHandle::stop`];
//! dropping it without stopping still kills the process.

use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use ureq::Agent;

use crate::config::RunConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::Stage;
use crate::process::{ToolCommand, Vars};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded retry schedule for readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    /// Total time allowed before giving up.
    pub deadline: Duration,
    /// First delay between attempts.
    pub backoff: Duration,
    /// Largest delay between attempts.
    pub ceiling: Duration,
}

impl ProbeSchedule {
    /// Delay to wait after `attempt` (zero-based) failed.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.ceiling)
    }
}

/// Starts the update server for a configuration.
pub struct ServerSupervisor<'a> {
    config: &'a RunConfig,
}

impl<'a> ServerSupervisor<'a> {
    /// Bind the supervisor to a configuration.
    #[must_use]
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    fn schedule(&self) -> ProbeSchedule {
        let timeouts = &self.config.timeouts;
        ProbeSchedule {
            deadline: timeouts.ready,
            backoff: timeouts.probe_backoff,
            ceiling: timeouts.probe_ceiling,
        }
    }

    /// Launch the server rooted at the repository and wait until it answers.
    ///
    /// When the server was spawned but never became ready, the process is
    /// reaped before the error is returned.
    pub fn start(&self) -> HarnessResult<ServerHandle> {
        let config = self.config;
        let vars = Vars::new()
            .with("app", &config.app_name)
            .with("port", config.port)
            .with_path("root", &config.root)
            .with_path("repository", &config.repository_dir());
        let command =
            ToolCommand::from_template(Stage::ServerStart, &config.tools.server, &vars, &config.root)?;
        let child = command.interruptible(&config.interrupt).spawn_background()?;
        let mut handle = ServerHandle {
            child: Some(child),
            url: config.server_url(),
        };
        if let Err(err) = wait_until_ready(&mut handle, self.schedule()) {
            if let Err(stop_err) = handle.terminate() {
                warn!("failed to stop unready update server: {stop_err}");
            }
            return Err(err);
        }
        Ok(handle)
    }
}

/// A running update server process.
#[derive(Debug)]
pub struct ServerHandle {
    child: Option<Child>,
    url: String,
}

impl ServerHandle {
    /// Base URL the server answers on.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Process id of the server.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn exit_code_if_exited(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            _ => None,
        }
    }

    /// Terminate the server and reap it.
    pub fn stop(mut self) -> HarnessResult<()> {
        self.terminate()
    }

    fn terminate(&mut self) -> HarnessResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id();
        if let Ok(Some(status)) = child.try_wait() {
            warn!("update server (pid {pid}) had already exited with {status}");
            return Ok(());
        }
        child
            .kill()
            .map_err(|err| HarnessError::io("kill", format!("pid {pid}"), err))?;
        child
            .wait()
            .map_err(|err| HarnessError::io("wait", format!("pid {pid}"), err))?;
        info!("stopped update server (pid {pid})");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!("update server handle dropped without stop; killing");
            if let Err(err) = self.terminate() {
                warn!("failed to kill update server: {err}");
            }
        }
    }
}

fn wait_until_ready(handle: &mut ServerHandle, schedule: ProbeSchedule) -> HarnessResult<()> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build();
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        if let Some(code) = handle.exit_code_if_exited() {
            handle.child = None;
            return Err(HarnessError::ServerExited { code });
        }
        if probe(&agent, &handle.url) {
            info!(
                "update server ready at {} after {} attempt(s)",
                handle.url,
                attempt + 1
            );
            return Ok(());
        }
        let delay = schedule.delay(attempt);
        if start.elapsed() + delay > schedule.deadline {
            return Err(HarnessError::ServerNotReady {
                url: handle.url.clone(),
                waited: start.elapsed(),
            });
        }
        thread::sleep(delay);
        attempt += 1;
    }
}

/// Whether anything answers HTTP at `url`. Error statuses still count.
pub fn probe(agent: &Agent, url: &str) -> bool {
    match agent.get(url).call() {
        Ok(_) | Err(ureq::Error::Status(_, _)) => true,
        Err(err) => {
            debug!("probe {url}: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let schedule = ProbeSchedule {
            deadline: Duration::from_secs(10),
            backoff: Duration::from_millis(100),
            ceiling: Duration::from_secs(1),
        };
        assert_eq!(schedule.delay(0), Duration::from_millis(100));
        assert_eq!(schedule.delay(1), Duration::from_millis(200));
        assert_eq!(schedule.delay(3), Duration::from_millis(800));
        assert_eq!(schedule.delay(4), Duration::from_secs(1));
        assert_eq!(schedule.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn error_status_counts_as_ready() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let responder = thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(tiny_http::Response::empty(404));
            }
        });
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(2))
            .build();
        assert!(probe(&agent, &format!("http://127.0.0.1:{port}/")));
        responder.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unready_server_is_reaped_before_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RunConfig::with_dirs(
            "my_app",
            tmp.path(),
            tmp.path().join("my_app"),
            tmp.path().join("data_my_app"),
        );
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.port = listener.local_addr().unwrap().port();
        drop(listener);
        config.timeouts.ready = Duration::from_millis(500);
        config.tools.server = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "echo $$ > {root}/server.pid; exec sleep 30".to_owned(),
        ];

        let err = ServerSupervisor::new(&config).start().unwrap_err();
        assert!(matches!(err, HarnessError::ServerNotReady { .. }), "{err}");
        let pid = std::fs::read_to_string(tmp.path().join("server.pid")).unwrap();
        let alive = std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .status()
            .unwrap();
        assert!(!alive.success(), "server pid {} survived", pid.trim());
    }

    #[test]
    fn refused_port_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(200))
            .build();
        assert!(!probe(&agent, &format!("http://127.0.0.1:{port}/")));
    }
}
