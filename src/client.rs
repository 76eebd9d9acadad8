// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Launch the installed client to apply and then observe the update.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::info;

use crate::config::RunConfig;
use crate::error::HarnessResult;
use crate::operator::Operator;
use crate::pipeline::Stage;
use crate::process::ToolCommand;

const CLOSE_PROMPT: &str = "Close the application window once the update has been applied.";

/// Runs the installed client binary.
pub struct ClientDriver<'a> {
    config: &'a RunConfig,
}

impl<'a> ClientDriver<'a> {
    /// Bind the driver to a configuration.
    #[must_use]
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    fn command(&self, stage: Stage) -> ToolCommand {
        ToolCommand::program(stage, &self.config.client_path(), &self.config.install_dir)
            .interruptible(&self.config.interrupt)
    }

    /// Run the client in the foreground so it checks for and applies the update.
    pub fn run_once(&self) -> HarnessResult<()> {
        info!("launching {}", self.config.client_path().display());
        self.command(Stage::ClientUpdate)
            .run(self.config.timeouts.client)
    }

    /// Wait for the operator to close the client session.
    pub fn await_operator(&self, operator: &mut dyn Operator) -> HarnessResult<()> {
        operator.acknowledge(CLOSE_PROMPT)
    }

    /// Run the client again and return everything it printed to stdout.
    pub fn run_and_capture(&self) -> HarnessResult<String> {
        let output = self
            .command(Stage::ClientVerifyRun)
            .capture(self.config.timeouts.client)?;
        info!("client reported: {}", output.trim());
        Ok(output)
    }
}
