// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the update cycle orchestrator.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the update cycle orchestrator.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use update_cycle::journal::Journal;
use update_cycle::operator::{ConsoleOperator, KeepWorkingDirs, Operator, ScriptedOperator};
use update_cycle::process::Interrupt;
use update_cycle::{preflight, HarnessError, Pipeline, RunConfig};

#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Run an end-to-end update cycle against a sample application"
)]
struct Cli {
    /// Path to the run configuration TOML.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Project root holding the sample application sources.
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Answer yes to every confirmation.
    #[arg(long, short = 'y', default_value_t = false, global = true)]
    yes: bool,

    /// Increase log verbosity.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full update cycle (default).
    Run(RunArgs),
    /// Check that the configured tools and sources are available.
    Check,
    /// Remove the working directories of earlier runs.
    Clean,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Keep the working directories when the run ends.
    #[arg(long, default_value_t = false)]
    keep: bool,

    /// Skip seeding the targets cache; the client downloads full archives.
    #[arg(long, default_value_t = false)]
    no_patch: bool,

    /// Port for the update server.
    #[arg(long)]
    port: Option<u16>,

    /// Write a JSON run report to this file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let code = match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            err.downcast_ref::<HarnessError>()
                .map_or(1, HarnessError::exit_code)
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose > 0 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.init();
}

fn execute(cli: Cli) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => env::current_dir().context("resolve current directory")?,
    };
    let mut config = RunConfig::from_host(root, cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            if let Some(port) = args.port {
                config.port = port;
            }
            if args.no_patch {
                config.patch_updates = false;
            }
            config.validate()?;
            run_cycle(&config, cli.yes, &args)
        }
        Command::Check => run_check(&config),
        Command::Clean => run_clean(&config, cli.yes),
    }
}

fn operator_for(yes: bool, keep: bool) -> Box<dyn Operator> {
    match (yes, keep) {
        (true, keep) => Box::new(ScriptedOperator::new(true, !keep)),
        (false, true) => Box::new(KeepWorkingDirs::new(ConsoleOperator::stdio())),
        (false, false) => Box::new(ConsoleOperator::stdio()),
    }
}

fn install_interrupt_handler(interrupt: &Interrupt) -> Result<()> {
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        flag.trip();
        warn!("interrupt received; stopping after rollback, server stop and cleanup offer");
    })
    .context("install interrupt handler")
}

fn run_cycle(config: &RunConfig, yes: bool, args: &RunArgs) -> Result<i32> {
    install_interrupt_handler(&config.interrupt)?;
    let journal = Journal::create(&config.journal_path())?;
    let mut operator = operator_for(yes, args.keep);
    let report = Pipeline::new(config, operator.as_mut(), journal).run();

    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    if report.passed() {
        info!("update cycle passed: client reports {:?}", config.expected_output());
    } else {
        match report.error() {
            Some(err) => error!("update cycle failed: {err}"),
            None => error!("update cycle failed"),
        }
    }
    for path in &report.remaining_dirs {
        info!("left in place: {}", path.display());
    }
    Ok(report.exit_code())
}

fn write_report(path: &Path, report: &update_cycle::RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize run report")?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    info!("run report written to {}", path.display());
    Ok(())
}

fn run_check(config: &RunConfig) -> Result<i32> {
    let checks = preflight::run(config);
    let failed: Vec<_> = checks.iter().filter(|check| !check.ok).collect();
    for check in &checks {
        let status = if check.ok { "ok" } else { "err" };
        println!("check={} status={status} {}", check.name, check.detail);
    }
    if failed.is_empty() {
        Ok(0)
    } else {
        Err(anyhow!("preflight failed: {} check(s) failed", failed.len()))
    }
}

fn run_clean(config: &RunConfig, yes: bool) -> Result<i32> {
    let dirs = config.working_dirs();
    let mut operator = operator_for(yes, false);
    let summary = dirs.reset_all(operator.as_mut())?;
    if summary.declined {
        info!("nothing removed");
    }
    for path in &summary.skipped {
        info!("skipped {}", path.display());
    }
    Ok(0)
}
