// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the drive agent

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use drive_agent::{build_logger, run_agent, Config};
use drive_common::cmd::{fatal, CmdError};
use slog::{error, info};

#[derive(Debug, Parser)]
#[clap(
    name = "drive-agent",
    about = "Formats and mounts this node's drives as their records request"
)]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();

    let config = Config::from_file(&args.config_file_path)
        .context("loading configuration")
        .map_err(CmdError::Failure)?;
    let log = build_logger(&config).map_err(CmdError::Failure)?;

    let shutdown = {
        let log = log.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(log, "received interrupt; shutting down"),
                Err(err) => {
                    // Without a signal handler there is no clean way to
                    // stop, so keep running until killed.
                    error!(log, "failed to listen for interrupt: {err}");
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    run_agent(config, &log, shutdown).await.map_err(|err| {
        error!(log, "drive agent failed: {err:#}");
        CmdError::Failure(err)
    })
}
