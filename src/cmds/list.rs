// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to print the DVR entries.

use base::Error;
use bpaf::Bpaf;
use dvr::config::ConfigFile;
use std::path::PathBuf;

/// Lists DVR entries ordered by start time, with their status.
#[derive(Bpaf, Debug)]
#[bpaf(command("list"))]
pub struct Args {
    #[bpaf(external(crate::parse_config_path))]
    config: PathBuf,

    /// Only list entries which haven't finished.
    upcoming: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::read(&args.config)?;
    let db = super::open_db(&config)?;
    let l = db.lock();
    for e in l.entries_by_start() {
        if args.upcoming && e.sched_state.is_finished() {
            continue;
        }
        println!(
            "{}  {} .. {}  {:<12} {:<32} {}",
            e.id,
            e.start,
            e.stop,
            e.channel_name,
            e.title_str(),
            e.status(),
        );
    }
    Ok(0)
}
