// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Standing rules which record a channel during a daily time window.
//!
//! Each rule has at most one spawn: the entry for its next (or current) window. Rules are
//! re-checked periodically from the timer queue, which moves the spawn along day by day.

use base::time::{global_zone, Time};
use base::{bail, Error};
use jiff::civil::Date;
use jiff::tz::TimeZone;
use jiff::Zoned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::ChannelId;
use crate::config::ConfigId;
use crate::db::{put_doc, LockedDatabase};
use crate::entry::{EntryId, NewEntry, Priority, SchedState};
use crate::notify::Event;
use crate::retention::{Removal, Retention};
use crate::store;

uuid_id!(
    /// Identifies a [`TimerecEntry`].
    TimerecId
);

const MINUTES_PER_DAY: u16 = 24 * 60;

/// A window which ended less than this long ago is still current.
const LATE_LIMIT: base::time::Duration = base::time::Duration(600);

const DEFAULT_TITLE: &str = "Time-%F_%R";

fn all_weekdays() -> u8 {
    0x7f
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimerecEntry {
    pub name: String,
    pub enabled: bool,

    /// A strftime template expanded at the window's start; empty means `Time-%F_%R`.
    pub title: String,
    pub channel: Option<ChannelId>,

    /// Start and stop as minutes after local midnight. A stop before the start means the
    /// window ends the next day.
    pub start: Option<u16>,
    pub stop: Option<u16>,

    /// Bit 0 is Monday.
    #[serde(default = "all_weekdays")]
    pub weekdays: u8,
    pub config: Option<ConfigId>,
    pub priority: Priority,
    pub retention: Retention,
    pub removal: Removal,
    pub owner: String,
    pub creator: String,
    pub comment: String,
}

impl Default for TimerecEntry {
    fn default() -> Self {
        TimerecEntry {
            name: String::new(),
            enabled: true,
            title: String::new(),
            channel: None,
            start: None,
            stop: None,
            weekdays: all_weekdays(),
            config: None,
            priority: Priority::NotSet,
            retention: Retention::Config,
            removal: Removal::Config,
            owner: String::new(),
            creator: String::new(),
            comment: String::new(),
        }
    }
}

/// The instant `minute` minutes after midnight of `date` in `tz`. Clock times skipped or
/// repeated by a DST change resolve as the wall clock would read them.
fn at(date: Date, minute: u16, tz: &TimeZone) -> Option<Zoned> {
    let hour = i8::try_from(minute / 60).ok()?;
    let min = i8::try_from(minute % 60).ok()?;
    date.at(hour, min, 0, 0).to_zoned(tz.clone()).ok()
}

impl TimerecEntry {
    /// Computes the rule's current or next window as of `now`, in the global zone.
    pub fn window(&self, now: Time) -> Option<(Zoned, Zoned)> {
        self.window_in(now, &global_zone())
    }

    pub fn window_in(&self, now: Time, tz: &TimeZone) -> Option<(Zoned, Zoned)> {
        let (Some(start_min), Some(stop_min)) = (self.start, self.stop) else {
            return None;
        };
        if !self.enabled
            || self.weekdays & 0x7f == 0
            || start_min >= MINUTES_PER_DAY
            || stop_min >= MINUTES_PER_DAY
        {
            return None;
        }
        let today = jiff::Timestamp::from_second(now.0)
            .ok()?
            .to_zoned(tz.clone())
            .date();
        let limit = now - LATE_LIMIT;
        let mut start = at(today, start_min, tz)?;
        let mut stop = at(today, stop_min, tz)?;
        if Time::from_zoned(&start) < limit && Time::from_zoned(&stop) < limit {
            let tomorrow = today.tomorrow().ok()?;
            start = at(tomorrow, start_min, tz)?;
            stop = at(tomorrow, stop_min, tz)?;
        }
        if start > stop {
            stop = at(stop.date().tomorrow().ok()?, stop_min, tz)?;
        }
        let weekday = start.weekday().to_monday_zero_offset();
        if self.weekdays & (1 << weekday) == 0 {
            return None;
        }
        Some((start, stop))
    }

    /// The spawn's title for a window starting at `start`.
    pub fn title_at(&self, start: &Zoned) -> String {
        let template = if self.title.is_empty() {
            DEFAULT_TITLE
        } else {
            &self.title
        };
        jiff::fmt::strtime::format(template, start).unwrap_or_else(|e| {
            warn!(template, err = %e, "bad title template");
            template.to_owned()
        })
    }
}

impl LockedDatabase {
    pub fn timerec(&self, id: TimerecId) -> Option<&TimerecEntry> {
        self.timerecs.get(&id)
    }

    pub fn timerecs(&self) -> impl Iterator<Item = (&TimerecId, &TimerecEntry)> {
        self.timerecs.iter()
    }

    fn validate_timerec(&self, r: &TimerecEntry) -> Result<(), Error> {
        for m in [r.start, r.stop].into_iter().flatten() {
            if m >= MINUTES_PER_DAY {
                bail!(InvalidArgument, msg("minute of day {m} out of range"));
            }
        }
        if let Some(c) = r.config {
            if !self.configs.contains_key(&c) {
                bail!(NotFound, msg("no DVR config {c}"));
            }
        }
        Ok(())
    }

    pub fn add_timerec(&mut self, r: TimerecEntry) -> Result<TimerecId, Error> {
        self.validate_timerec(&r)?;
        let id = TimerecId::generate();
        info!(%id, name = %r.name, "adding timerec rule");
        self.timerecs.insert(id, r);
        self.save_timerec(id);
        self.notifier.send(Event::TimerecAdded(id));
        self.timerec_check(id);
        Ok(id)
    }

    pub fn update_timerec(&mut self, id: TimerecId, r: TimerecEntry) -> Result<(), Error> {
        if !self.timerecs.contains_key(&id) {
            bail!(NotFound, msg("no timerec {id}"));
        }
        self.validate_timerec(&r)?;
        self.timerecs.insert(id, r);
        self.save_timerec(id);
        self.timerec_check(id);
        Ok(())
    }

    pub fn delete_timerec(&mut self, id: TimerecId) -> Result<(), Error> {
        if !self.timerecs.contains_key(&id) {
            bail!(NotFound, msg("no timerec {id}"));
        }
        self.timerec_purge_spawn(id);
        self.timerecs.remove(&id);
        self.delete_doc(&store::key(store::TIMEREC_PREFIX, id));
        self.notifier.send(Event::TimerecDeleted(id));
        info!(%id, "deleted timerec rule");
        Ok(())
    }

    pub(crate) fn save_timerec(&mut self, id: TimerecId) {
        if let Some(r) = self.timerecs.get(&id) {
            put_doc(&mut *self.store, &store::key(store::TIMEREC_PREFIX, id), r);
        }
    }

    fn timerec_spawn(&self, id: TimerecId) -> Option<EntryId> {
        self.entries
            .values()
            .filter(|e| e.timerec == Some(id))
            .max_by_key(|e| e.seq)
            .map(|e| e.id)
    }

    /// Lets go of the rule's spawn: a pending one is cancelled, one which has started is
    /// detached and left to finish.
    pub(crate) fn timerec_purge_spawn(&mut self, id: TimerecId) {
        let spawns: Vec<(EntryId, SchedState)> = self
            .entries
            .values()
            .filter(|e| e.timerec == Some(id))
            .map(|e| (e.id, e.sched_state))
            .collect();
        for (eid, state) in spawns {
            if matches!(state, SchedState::Scheduled | SchedState::NoState) {
                self.cancel(eid, false);
            } else if let Some(e) = self.entries.get_mut(&eid) {
                e.timerec = None;
                self.changed(eid);
            }
        }
    }

    /// Brings the rule's spawn in line with its next window.
    pub(crate) fn timerec_check(&mut self, id: TimerecId) {
        let now = self.now();
        let Some(r) = self.timerecs.get(&id) else {
            return;
        };
        let channel = r.channel.filter(|c| self.channels.contains_key(c));
        let (Some((start, stop)), Some(channel)) = (r.window(now), channel) else {
            self.timerec_purge_spawn(id);
            return;
        };
        let title = r.title_at(&start);
        let mut n = NewEntry::new(
            channel,
            Time::from_zoned(&start),
            Time::from_zoned(&stop),
            &title,
        );
        n.config = r.config;
        n.priority = r.priority;
        n.retention = r.retention;
        n.removal = r.removal;
        n.owner.clone_from(&r.owner);
        n.creator.clone_from(&r.creator);
        n.comment = if r.comment.is_empty() {
            "Time recording".to_owned()
        } else {
            format!("Time recording: {}", r.comment)
        };
        let config = self.resolve_config_id(n.config);
        let unchanged = self
            .timerec_spawn(id)
            .and_then(|s| self.entries.get(&s))
            .is_some_and(|e| {
                e.start == n.start
                    && e.stop == n.stop
                    && e.channel == Some(channel)
                    && e.config == config
                    && e.title_str() == title
            });
        if unchanged {
            return;
        }
        self.timerec_purge_spawn(id);
        debug!(%id, start = %n.start, stop = %n.stop, "spawning timerec entry");
        if let Err(err) = self.create_entry(n, None, Some(id)) {
            warn!(%id, err = %err.chain(), "unable to spawn timerec entry");
        }
    }

    pub(crate) fn timerec_check_all(&mut self) {
        let ids: Vec<TimerecId> = self.timerecs.keys().copied().collect();
        for id in ids {
            self.timerec_check(id);
        }
    }
}
