// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The DVR entry: one scheduled, active, or finished recording.
//!
//! This module holds the data and the pure computations on it. Transitions, which need the
//! rest of the database (channels, configs, timers, the guide), are methods of
//! [`crate::LockedDatabase`]; see `lifecycle.rs` and `rerecord.rs`.

use std::path::PathBuf;

use base::time::{Duration, Time};
use serde::{Deserialize, Serialize};

use crate::autorec::AutorecId;
use crate::channel::ChannelId;
use crate::config::{ConfigId, DvrConfig};
use crate::epg::{Broadcast, BroadcastId, LangStr};
use crate::retention::{Removal, Retention};
use crate::streaming::StreamCode;
use crate::timerec::TimerecId;

uuid_id!(
    /// Identifies a [`DvrEntry`]. Stable across restarts.
    EntryId
);

/// At or above this many data errors, a completed recording is reported as damaged.
pub const MAX_DATA_ERRORS: u32 = 10_000;

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedState {
    #[default]
    NoState,
    Scheduled,
    Recording,
    Completed,
    MissedTime,
}

impl SchedState {
    /// True for the states in which the entry will never record again.
    pub fn is_finished(self) -> bool {
        matches!(self, SchedState::Completed | SchedState::MissedTime)
    }
}

/// Progress of an entry which is [`SchedState::Recording`].
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecState {
    #[default]
    Pending,
    WaitProgramStart,
    Running,
    Commercial,
    Error,
    EpgWait,
    Finished,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Important,
    High,
    Normal,
    Low,
    Unimportant,

    /// Use the DVR config's priority.
    #[default]
    NotSet,
}

impl Priority {
    /// Resolves `NotSet` against the config's priority.
    pub fn resolve(self, config: Priority) -> Priority {
        match (self, config) {
            (Priority::NotSet, Priority::NotSet) => Priority::Normal,
            (Priority::NotSet, c) => c,
            (p, _) => p,
        }
    }

    /// The subscription weight for this priority. Must be resolved.
    pub fn weight(self) -> u32 {
        match self {
            Priority::Important => 500,
            Priority::High => 400,
            Priority::Normal | Priority::NotSet => 300,
            Priority::Low => 200,
            Priority::Unimportant => 100,
        }
    }

    /// One step more important; `Important` stays put.
    pub fn raised(self) -> Priority {
        match self {
            Priority::Important | Priority::High => Priority::Important,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
            Priority::Unimportant => Priority::Low,
            Priority::NotSet => Priority::NotSet,
        }
    }
}

/// One file written for an entry. An entry's files are kept in the order written.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileRecord {
    pub filename: PathBuf,
    pub size: u64,
    pub start: Time,
    pub stop: Time,

    /// Summary of the elementary streams at open.
    pub info: String,
}

#[derive(Clone, Debug)]
pub struct DvrEntry {
    pub id: EntryId,

    /// In-memory creation order; later entries have larger values. Not persisted.
    pub(crate) seq: u64,
    pub created: Time,
    pub enabled: bool,

    pub start: Time,
    pub stop: Time,

    /// Padding; zero inherits from the channel, then from the config.
    pub start_extra: Duration,
    pub stop_extra: Duration,

    /// `None` once the channel has been removed.
    pub channel: Option<ChannelId>,

    /// The channel's name when last known.
    pub channel_name: String,
    pub config: ConfigId,

    pub sched_state: SchedState,
    pub rec_state: RecState,
    pub last_error: StreamCode,

    pub title: LangStr,
    pub subtitle: LangStr,
    pub summary: LangStr,
    pub description: LangStr,
    pub content_type: u8,
    pub episode: String,
    pub episode_uri: Option<String>,
    pub copyright_year: u16,
    pub dvb_eid: u16,
    pub broadcast: Option<BroadcastId>,
    pub files: Vec<FileRecord>,

    pub priority: Priority,
    pub retention: Retention,
    pub removal: Removal,
    pub owner: String,
    pub creator: String,
    pub comment: String,

    pub autorec: Option<AutorecId>,
    pub timerec: Option<TimerecId>,
    pub parent: Option<EntryId>,
    pub child: Option<EntryId>,

    pub errors: u32,
    pub data_errors: u32,
    pub dont_reschedule: bool,
    pub dont_rerecord: bool,
    pub running_start: Option<Time>,
    pub running_stop: Option<Time>,
    pub running_pause: Option<Time>,
    pub play_count: u32,
    pub play_pos: Duration,

    /// Set when the files were deliberately removed but the entry kept.
    pub file_removed: bool,

    /// Cached stop extension from following segments of a multi-part broadcast.
    pub(crate) segment_stop_extra: Option<Duration>,

    /// Persisted fields this version doesn't understand.
    pub(crate) unknown: serde_json::Map<String, serde_json::Value>,
}

/// Parameters of a new entry, as given to [`crate::LockedDatabase::create`].
#[derive(Clone, Debug)]
pub struct NewEntry {
    /// `None` selects the default config.
    pub config: Option<ConfigId>,
    pub channel: ChannelId,
    pub start: Time,
    pub stop: Time,
    pub start_extra: Duration,
    pub stop_extra: Duration,
    pub title: LangStr,
    pub subtitle: LangStr,
    pub summary: LangStr,
    pub description: LangStr,
    pub content_type: u8,
    pub episode: String,
    pub episode_uri: Option<String>,
    pub copyright_year: u16,
    pub dvb_eid: u16,
    pub broadcast: Option<BroadcastId>,
    pub priority: Priority,
    pub retention: Retention,
    pub removal: Removal,
    pub owner: String,
    pub creator: String,
    pub comment: String,
    pub enabled: bool,
}

impl NewEntry {
    pub fn new(channel: ChannelId, start: Time, stop: Time, title: &str) -> Self {
        NewEntry {
            config: None,
            channel,
            start,
            stop,
            start_extra: Duration::ZERO,
            stop_extra: Duration::ZERO,
            title: LangStr::new(title),
            subtitle: LangStr::default(),
            summary: LangStr::default(),
            description: LangStr::default(),
            content_type: 0,
            episode: String::new(),
            episode_uri: None,
            copyright_year: 0,
            dvb_eid: 0,
            broadcast: None,
            priority: Priority::NotSet,
            retention: Retention::Config,
            removal: Removal::Config,
            owner: String::new(),
            creator: String::new(),
            comment: String::new(),
            enabled: true,
        }
    }

    /// Describes a recording of `b`, copying its metadata and linking it.
    pub fn from_broadcast(b: &Broadcast) -> Self {
        NewEntry {
            title: b.title.clone(),
            subtitle: b.subtitle.clone(),
            summary: b.summary.clone(),
            description: b.description.clone(),
            content_type: b.content_type(),
            episode: b.episode.to_string(),
            episode_uri: b.episode_uri.clone(),
            copyright_year: b.copyright_year,
            dvb_eid: b.dvb_eid,
            broadcast: Some(b.id),
            ..NewEntry::new(b.channel, b.start, b.stop, "")
        }
    }
}

/// A change to an existing entry. `None` fields are left alone.
///
/// Which fields take effect depends on the entry's state; see
/// [`crate::LockedDatabase::update`].
#[derive(Clone, Debug, Default)]
pub struct EntryChange {
    pub enabled: Option<bool>,
    pub channel: Option<ChannelId>,
    pub config: Option<ConfigId>,
    pub start: Option<Time>,
    pub stop: Option<Time>,
    pub start_extra: Option<Duration>,
    pub stop_extra: Option<Duration>,
    pub title: Option<LangStr>,
    pub subtitle: Option<LangStr>,
    pub description: Option<LangStr>,
    pub episode: Option<String>,
    pub content_type: Option<u8>,
    pub priority: Option<Priority>,
    pub retention: Option<Retention>,
    pub removal: Option<Removal>,
    pub comment: Option<String>,
    pub play_count: Option<u32>,
    pub play_pos: Option<Duration>,
}

impl DvrEntry {
    pub(crate) fn new(id: EntryId, seq: u64, created: Time, config: ConfigId, n: NewEntry) -> Self {
        DvrEntry {
            id,
            seq,
            created,
            enabled: n.enabled,
            start: n.start,
            stop: n.stop,
            start_extra: n.start_extra,
            stop_extra: n.stop_extra,
            channel: Some(n.channel),
            channel_name: String::new(),
            config,
            sched_state: SchedState::NoState,
            rec_state: RecState::Pending,
            last_error: StreamCode::Ok,
            title: n.title,
            subtitle: n.subtitle,
            summary: n.summary,
            description: n.description,
            content_type: n.content_type,
            episode: n.episode,
            episode_uri: n.episode_uri,
            copyright_year: n.copyright_year,
            dvb_eid: n.dvb_eid,
            broadcast: n.broadcast,
            files: Vec::new(),
            priority: n.priority,
            retention: n.retention,
            removal: n.removal,
            owner: n.owner,
            creator: n.creator,
            comment: n.comment,
            autorec: None,
            timerec: None,
            parent: None,
            child: None,
            errors: 0,
            data_errors: 0,
            dont_reschedule: false,
            dont_rerecord: false,
            running_start: None,
            running_stop: None,
            running_pause: None,
            play_count: 0,
            play_pos: Duration::ZERO,
            file_removed: false,
            segment_stop_extra: None,
            unknown: serde_json::Map::new(),
        }
    }

    /// Title in the given language, falling back to any language, then to "".
    pub fn title_str(&self) -> &str {
        self.title.get(None).unwrap_or("")
    }

    /// Sum of the sizes of all files.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// True if any recorded file is still on disk.
    pub fn any_file_exists(&self) -> bool {
        self.files.iter().any(|f| f.filename.exists())
    }

    /// True if this entry finished without a usable recording.
    pub fn is_failed(&self) -> bool {
        match self.sched_state {
            SchedState::MissedTime => true,
            SchedState::Completed => !self.last_error.is_ok(),
            _ => false,
        }
    }

    /// True while the broadcaster says the programme is still on air.
    pub(crate) fn epg_says_running(&self) -> bool {
        self.running_start > self.running_stop
    }

    /// Human-readable status, derived from the current state on every call.
    pub fn status(&self) -> &'static str {
        match self.sched_state {
            SchedState::Scheduled => "Scheduled for recording",
            SchedState::Recording => match self.rec_state {
                RecState::Pending => "Waiting for stream",
                RecState::WaitProgramStart => "Waiting for program start",
                RecState::Running => "Running",
                RecState::Commercial => "Commercial break",
                RecState::Error => self.last_error.text(),
                RecState::EpgWait => "Waiting for EPG running flag",
                RecState::Finished => "Finished",
            },
            SchedState::Completed => {
                if self.files.is_empty() {
                    "File not created"
                } else if !self.file_removed && !self.any_file_exists() {
                    "File missing"
                } else if !self.last_error.is_ok() {
                    self.last_error.text()
                } else if self.data_errors >= MAX_DATA_ERRORS {
                    "Too many data errors"
                } else {
                    "Completed OK"
                }
            }
            SchedState::MissedTime => match self.last_error {
                StreamCode::SvcNotEnabled => "Service not enabled",
                StreamCode::Ok => "Time missed",
                e => e.text(),
            },
            SchedState::NoState => "Invalid",
        }
    }

    /// Machine-readable status, for clients which colour-code entries.
    ///
    /// `rerecord_errors` is the threshold from the entry's config.
    pub fn sched_status(&self, rerecord_errors: u32) -> &'static str {
        match self.sched_state {
            SchedState::Scheduled | SchedState::NoState => "scheduled",
            SchedState::Recording if !self.last_error.is_ok() => "recordingError",
            SchedState::Recording => "recording",
            SchedState::MissedTime => "completedError",
            SchedState::Completed => {
                if !self.last_error.is_ok() || (!self.file_removed && !self.any_file_exists()) {
                    "completedError"
                } else if !self.dont_rerecord
                    && rerecord_errors > 0
                    && (self.errors > 0 || self.data_errors > rerecord_errors)
                {
                    "completedRerecord"
                } else if self.data_errors > 0 {
                    "completedWarning"
                } else {
                    "completed"
                }
            }
        }
    }

    /// Resolves the effective padding before the start: entry, then channel, then config.
    pub(crate) fn pre_padding(&self, channel: Duration, config: &DvrConfig) -> Duration {
        [self.start_extra, channel, config.pre_extra]
            .into_iter()
            .find(|d| *d != Duration::ZERO)
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn post_padding(&self, channel: Duration, config: &DvrConfig) -> Duration {
        [self.stop_extra, channel, config.post_extra]
            .into_iter()
            .find(|d| *d != Duration::ZERO)
            .unwrap_or(Duration::ZERO)
    }

    /// When to start the tuner. A warm start also subtracts the config's warm time so the
    /// stream is ready by the padded start.
    pub(crate) fn start_time(&self, pre: Duration, warm: Option<Duration>) -> Time {
        let t = self
            .start
            .saturating_sub(pre)
            .saturating_sub(warm.unwrap_or(Duration::ZERO));
        t.max(Time(0))
    }

    pub(crate) fn stop_time(&self, post: Duration) -> Time {
        self.stop
            .saturating_add(self.segment_stop_extra.unwrap_or(Duration::ZERO))
            .saturating_add(post)
    }
}
