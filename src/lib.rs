// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The DVR scheduling and recording engine.
//!
//! All state lives in a [`Database`], whose [`Database::lock`] is the one lock serializing
//! every mutation. Timers fire from the thread started by [`timer::start_timer_thread`];
//! each active recording drains its stream on its own worker thread (see [`rec`]).

/// Defines a UUID-backed identifier type.
macro_rules! uuid_id {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(
            Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd,
            serde::Deserialize, serde::Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn generate() -> Self {
                $name(uuid::Uuid::now_v7())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0.as_simple(), f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = base::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map($name)
                    .map_err(|e| base::err!(InvalidArgument, msg("bad id {s:?}"), source(e)))
            }
        }
    };
}

pub mod access;
pub mod autorec;
pub mod channel;
pub mod config;
pub mod conflict;
pub mod db;
pub mod entry;
pub mod epg;
pub mod json;
mod lifecycle;
pub mod mux;
pub mod notify;
pub mod rec;
mod rerecord;
pub mod retention;
pub mod space;
pub mod store;
pub mod streaming;
pub mod testutil;
pub mod timer;
pub mod timerec;

pub use crate::db::{Collaborators, Database, DatabaseGuard, LockedDatabase};
pub use crate::entry::{DvrEntry, EntryId, NewEntry, Priority, RecState, SchedState};
pub use crate::streaming::StreamCode;
