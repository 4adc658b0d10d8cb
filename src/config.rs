// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Configuration: the runtime TOML file and the persisted DVR policy bundles.

use std::path::{Path, PathBuf};

use base::time::Duration;
use base::{err, Error};
use serde::{Deserialize, Serialize};

use crate::autorec::Dedup;
use crate::channel::{Channel, ServiceKind};
use crate::entry::Priority;
use crate::mux::Container;
use crate::retention::{Removal, Retention};

uuid_id!(
    /// Identifies a [`DvrConfig`].
    ConfigId
);

fn default_db_path() -> PathBuf {
    "/var/lib/pvr-dvr/db".into()
}

fn default_storage_dir() -> PathBuf {
    "/var/lib/pvr-dvr/recordings".into()
}

fn default_true() -> bool {
    true
}

fn default_warm_time_secs() -> u32 {
    30
}

fn default_timerec_check_secs() -> u32 {
    3600
}

fn default_space_check_secs() -> u32 {
    60
}

/// Top-level runtime configuration file object.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Path of the SQLite3 database holding entries, rules and DVR configs.
    ///
    /// default: `/var/lib/pvr-dvr/db`.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Storage directory of the default DVR config, used when it's first created.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Whether to run the timer thread. Turning this off leaves a read-mostly database.
    #[serde(default = "default_true")]
    pub timers: bool,

    /// Default warm-up time for new DVR configs.
    #[serde(default = "default_warm_time_secs")]
    pub warm_time_secs: u32,

    /// How often all time-based rules are re-evaluated.
    #[serde(default = "default_timerec_check_secs")]
    pub timerec_check_secs: u32,

    /// How often storage space is checked while recording.
    #[serde(default = "default_space_check_secs")]
    pub space_check_secs: u32,

    /// Default rerecord error threshold for new DVR configs; 0 disables rerecording.
    #[serde(default)]
    pub rerecord_errors: u32,

    /// Channels to register at startup.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// A channel as described in the configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Padding overrides; zero uses the DVR config's.
    #[serde(default)]
    pub extra_pre_secs: u32,
    #[serde(default)]
    pub extra_post_secs: u32,

    /// Services in order of preference.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServiceConfig {
    Dvb {
        name: String,
        adapter: String,
        mux: String,
    },
    Iptv {
        name: String,
    },
    Analog {
        name: String,
        device: String,
    },
}

impl ChannelConfig {
    pub fn to_channel(&self) -> Channel {
        let mut ch = Channel::new(self.id, &self.name);
        ch.enabled = self.enabled;
        ch.tags.clone_from(&self.tags);
        ch.extra_pre = Duration(i64::from(self.extra_pre_secs));
        ch.extra_post = Duration(i64::from(self.extra_post_secs));
        for s in &self.services {
            ch = match s {
                ServiceConfig::Dvb { name, adapter, mux } => ch.with_service(
                    name,
                    ServiceKind::Dvb {
                        adapter: adapter.clone(),
                        mux: mux.clone(),
                    },
                ),
                ServiceConfig::Iptv { name } => ch.with_service(name, ServiceKind::Iptv),
                ServiceConfig::Analog { name, device } => ch.with_service(
                    name,
                    ServiceKind::Analog {
                        device: device.clone(),
                    },
                ),
            };
        }
        ch
    }
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| err!(InvalidArgument, msg("bad config"), source(e)))
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            err!(
                NotFound,
                msg("unable to read {}", path.display()),
                source(e)
            )
        })?;
        Self::parse(&text)
    }

    pub fn options(&self) -> Options {
        Options {
            storage_dir: self.storage_dir.clone(),
            warm_time: Duration(i64::from(self.warm_time_secs)),
            timerec_check: Duration(i64::from(self.timerec_check_secs.max(60))),
            space_check: Duration(i64::from(self.space_check_secs.max(5))),
            rerecord_errors: self.rerecord_errors,
        }
    }
}

/// Settings of a [`crate::Database`] which aren't persisted in it.
#[derive(Clone, Debug)]
pub struct Options {
    pub storage_dir: PathBuf,
    pub warm_time: Duration,
    pub timerec_check: Duration,
    pub space_check: Duration,
    pub rerecord_errors: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            storage_dir: default_storage_dir(),
            warm_time: Duration(i64::from(default_warm_time_secs())),
            timerec_check: Duration(i64::from(default_timerec_check_secs())),
            space_check: Duration(i64::from(default_space_check_secs())),
            rerecord_errors: 0,
        }
    }
}

/// A named bundle of recording policy. Entries, rules and their spawns refer to one by id.
///
/// The config with the empty name is the default; it always exists.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DvrConfig {
    pub name: String,
    pub enabled: bool,
    pub comment: String,
    pub storage: PathBuf,
    pub container: Container,
    pub retention: Retention,
    pub removal: Removal,
    pub pre_extra: Duration,
    pub post_extra: Duration,

    /// Extra time subtracted from a warm start so the tuner is ready; capped at 4 minutes.
    pub warm_time: Duration,
    pub priority: Priority,

    /// Data errors above which a completed recording is rerecorded; 0 disables rerecording.
    pub rerecord_errors: u32,
    pub skip_commercials: bool,

    /// Free space in MiB to keep in the storage directory by removing maintained-space
    /// recordings; 0 disables.
    pub cleanup_threshold_free: u64,

    /// Space in MiB the storage filesystem may use before maintained-space recordings are
    /// removed; 0 disables.
    pub cleanup_threshold_used: u64,

    /// Whether to follow the broadcaster's running flags rather than the schedule alone.
    pub epg_running: bool,

    /// Whether a recording may continue as a new entry when the source changes in a way the
    /// container can't represent.
    pub clone: bool,

    /// Defaults for autorec rules which leave these at zero.
    pub max_count: u32,
    pub max_sched_count: u32,
    pub dedup: Dedup,

    /// Streaming profile passed to the tuner.
    pub profile: String,

    /// Hook commands. Stored for other components; never executed here.
    pub preproc: String,
    pub postproc: String,
    pub postremove: String,
}

impl Default for DvrConfig {
    fn default() -> Self {
        DvrConfig {
            name: String::new(),
            enabled: true,
            comment: String::new(),
            storage: default_storage_dir(),
            container: Container::default(),
            retention: Retention::Days(31),
            removal: Removal::Forever,
            pre_extra: Duration::ZERO,
            post_extra: Duration::ZERO,
            warm_time: Duration(i64::from(default_warm_time_secs())),
            priority: Priority::Normal,
            rerecord_errors: 0,
            skip_commercials: true,
            cleanup_threshold_free: 1000,
            cleanup_threshold_used: 0,
            epg_running: false,
            clone: true,
            max_count: 0,
            max_sched_count: 0,
            dedup: Dedup::default(),
            profile: String::new(),
            preproc: String::new(),
            postproc: String::new(),
            postremove: String::new(),
        }
    }
}

impl DvrConfig {
    /// The default config as first created for a database with the given options.
    pub fn initial(options: &Options) -> Self {
        DvrConfig {
            storage: options.storage_dir.clone(),
            warm_time: options.warm_time,
            rerecord_errors: options.rerecord_errors,
            ..Default::default()
        }
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    pub fn effective_warm_time(&self) -> Duration {
        Duration(self.warm_time.0.clamp(0, 240))
    }
}
