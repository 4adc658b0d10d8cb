// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::sync::Arc;

use base::clock::RealClocks;
use base::{err, Error};
use dvr::access::AllowAll;
use dvr::config::ConfigFile;
use dvr::epg::NoEpg;
use dvr::mux::FileMuxerFactory;
use dvr::space::Statvfs;
use dvr::store::SqliteStore;
use dvr::streaming::NoTuners;
use dvr::{Collaborators, Database};
use tracing::info;

pub mod list;
pub mod run;

/// Opens the database named by `config` and registers its channels. Doesn't start it.
///
/// No guide or tuner backend is attached: those are supplied by embedding the library.
fn open_db(config: &ConfigFile) -> Result<Arc<Database>, Error> {
    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| {
            err!(
                Unavailable,
                msg("unable to create {}", dir.display()),
                source(e)
            )
        })?;
    }
    info!(
        path = %config.db_path.display(),
        sqlite = rusqlite::version(),
        "opening database"
    );
    let store = SqliteStore::open(&config.db_path)?;
    let collab = Collaborators {
        epg: Arc::new(NoEpg),
        access: Arc::new(AllowAll),
        subscriber: Arc::new(NoTuners),
        muxers: Arc::new(FileMuxerFactory),
        space: Arc::new(Statvfs),
    };
    let db = Database::new(RealClocks {}, Box::new(store), collab, config.options())?;
    {
        let mut l = db.lock();
        for c in &config.channels {
            l.upsert_channel(c.to_channel());
        }
    }
    Ok(db)
}
