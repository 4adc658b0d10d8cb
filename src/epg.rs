// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The interface to the programme guide.
//!
//! The guide itself lives elsewhere. The recorder reads broadcasts through [`Epg`] and is told
//! about changes via the `on_broadcast_*` and `on_running_changed` methods of
//! [`crate::LockedDatabase`].

use std::collections::BTreeMap;
use std::fmt;

use base::time::{Duration, Time};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

#[derive(
    Copy, Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct BroadcastId(pub u32);

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Text in one or more languages, keyed by language code.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LangStr(pub BTreeMap<String, String>);

impl LangStr {
    /// The language code used when the guide doesn't say.
    pub const UNDETERMINED: &'static str = "und";

    pub fn new(text: &str) -> Self {
        let mut m = BTreeMap::new();
        if !text.is_empty() {
            m.insert(Self::UNDETERMINED.to_owned(), text.to_owned());
        }
        LangStr(m)
    }

    /// Returns the text in `lang`, falling back to any available language.
    pub fn get(&self, lang: Option<&str>) -> Option<&str> {
        if let Some(l) = lang {
            if let Some(s) = self.0.get(l) {
                return Some(s);
            }
        }
        self.0.values().next().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|s| s.is_empty())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }
}

impl From<&str> for LangStr {
    fn from(s: &str) -> Self {
        LangStr::new(s)
    }
}

/// Episode numbering as supplied by the guide.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EpisodeNum {
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub part: Option<u32>,
}

impl EpisodeNum {
    pub fn is_empty(&self) -> bool {
        self.season.is_none() && self.episode.is_none() && self.part.is_none()
    }
}

/// Formats as eg `S01E02` or `S01E02P1`; empty if nothing is known.
impl fmt::Display for EpisodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.season {
            write!(f, "S{s:02}")?;
        }
        if let Some(e) = self.episode {
            write!(f, "E{e:02}")?;
        }
        if let Some(p) = self.part {
            write!(f, "P{p}")?;
        }
        Ok(())
    }
}

/// A snapshot of one scheduled programme on one channel.
#[derive(Clone, Debug, Default)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub channel: ChannelId,
    pub start: Time,
    pub stop: Time,
    pub title: LangStr,
    pub subtitle: LangStr,
    pub summary: LangStr,
    pub description: LangStr,
    pub episode: EpisodeNum,

    /// Stable identity of the episode across repeats, if the guide supplies one.
    pub episode_uri: Option<String>,

    /// Identity of the series this broadcast belongs to.
    pub serieslink: Option<String>,

    /// Identity shared by consecutive broadcasts that are parts of one programme.
    pub segment_link: Option<String>,

    /// DVB content nibbles (`0xNM`: N = content type, M = subtype).
    pub genre: Vec<u8>,
    pub categories: Vec<String>,
    pub is_new: bool,
    pub is_repeat: bool,
    pub copyright_year: u16,
    pub star_rating: u8,

    /// DVB event id; 0 if unknown.
    pub dvb_eid: u16,
}

impl Broadcast {
    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }

    /// Returns the primary content type (the upper nibble of the first genre code), or 0.
    pub fn content_type(&self) -> u8 {
        self.genre.first().map(|g| g >> 4).unwrap_or(0)
    }

    pub fn has_content_type(&self, content_type: u8) -> bool {
        self.genre.iter().any(|g| g >> 4 == content_type)
    }
}

/// Where a running-state signal came from. Only the broadcast stream's own event
/// information is trusted to start and stop recordings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EpgSource {
    Eit,
    Other,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunningState {
    NotSet,
    Now,
    Stop,
    Pause,
}

/// Read access to the programme guide.
pub trait Epg: Send + Sync {
    fn broadcast(&self, id: BroadcastId) -> Option<Broadcast>;

    /// Returns broadcasts on `channel` which end after `after`, ordered by start time.
    fn schedule(&self, channel: ChannelId, after: Time) -> Vec<Broadcast>;
}

/// An [`Epg`] with no broadcasts, for use when no guide is attached.
pub struct NoEpg;

impl Epg for NoEpg {
    fn broadcast(&self, _id: BroadcastId) -> Option<Broadcast> {
        None
    }

    fn schedule(&self, _channel: ChannelId, _after: Time) -> Vec<Broadcast> {
        Vec::new()
    }
}
