// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the static update repository server.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Serve an update repository directory over plain HTTP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use update_cycle::serve::RepoServer;

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Serve an update repository over HTTP")]
struct Cli {
    /// Port to listen on.
    #[arg(default_value_t = update_cycle::config::DEFAULT_PORT)]
    port: u16,

    /// Directory to serve.
    #[arg(long, short = 'd', value_name = "DIR", default_value = ".")]
    directory: PathBuf,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.bind, cli.port);
    let server = RepoServer::bind(&addr, &cli.directory)
        .with_context(|| format!("start repository server on {addr}"))?;
    info!("serving {} on http://{addr}/", cli.directory.display());
    server.serve_forever();
    Ok(())
}
