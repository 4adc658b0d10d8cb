// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the recorder until signalled.

use base::{bail, err, Error};
use bpaf::Bpaf;
use dvr::config::ConfigFile;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Runs the recorder: schedules entries and rules, and records until SIGINT or SIGTERM.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(crate::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::read(&args.config)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| err!(Internal, msg("unable to build runtime"), source(e)))?;
    let r = rt.block_on(async_run(config));

    // Don't wait for blocking tasks such as a timer thread join abandoned by an immediate
    // shutdown.
    rt.shutdown_background();
    r
}

async fn async_run(config: ConfigFile) -> Result<i32, Error> {
    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| err!(Internal, msg("unable to install SIGINT handler"), source(e)))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| err!(Internal, msg("unable to install SIGTERM handler"), source(e)))?;

    let db = super::open_db(&config)?;
    db.lock().start();
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let timers = if config.timers {
        Some(dvr::timer::start_timer_thread(db.clone(), shutdown_rx)?)
    } else {
        warn!("timers disabled; nothing will be recorded");
        None
    };
    info!("ready");

    tokio::select! {
        _ = int.recv() => info!("received SIGINT; shutting down gracefully"),
        _ = term.recv() => info!("received SIGTERM; shutting down gracefully"),
    }
    drop(shutdown_tx);
    if let Some(timers) = timers {
        let join = tokio::task::spawn_blocking(move || timers.join());
        tokio::select! {
            r = join => {
                if !matches!(r, Ok(Ok(()))) {
                    warn!("timer thread panicked");
                }
            }
            _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
            _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        }
    }
    db.lock().shutdown();
    info!("exiting");
    Ok(0)
}
