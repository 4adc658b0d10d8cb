// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Standing rules which schedule recordings of matching guide broadcasts.

use base::time::{Duration, Time};
use base::{bail, err, Error};
use itertools::Itertools as _;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelId};
use crate::config::{ConfigId, DvrConfig};
use crate::db::{put_doc, LockedDatabase};
use crate::entry::{EntryId, NewEntry, Priority, SchedState};
use crate::epg::Broadcast;
use crate::notify::Event;
use crate::retention::{Removal, Retention};
use crate::store;

uuid_id!(
    /// Identifies an [`AutorecEntry`].
    AutorecId
);

/// How a rule decides that a spawn repeats something already recorded. Checked when the
/// spawn is about to start recording.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DedupKind {
    /// Record every matching broadcast.
    #[default]
    All,
    DifferentEpisodeNumber,
    DifferentTitle,
    DifferentSubtitle,
    DifferentDescription,
    OncePerDay,
    OncePerWeek,
    OncePerMonth,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Dedup {
    pub kind: DedupKind,

    /// Only compare against spawns of the same rule.
    pub local: bool,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastType {
    #[default]
    All,
    New,
    Repeat,
}

fn all_weekdays() -> u8 {
    0x7f
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutorecEntry {
    pub name: String,
    pub enabled: bool,

    /// Case-insensitive regular expression; empty matches anything.
    pub title: String,

    /// Match `title` against the subtitle, summary and description too.
    pub fulltext: bool,
    pub channel: Option<ChannelId>,
    pub channel_tag: Option<String>,

    /// DVB content type (the genre's upper nibble); 0 for any.
    pub content_type: u8,

    /// Earliest and latest start, as minutes after local midnight. The window may wrap.
    pub start_window: Option<(u16, u16)>,

    /// Bit 0 is Monday.
    #[serde(default = "all_weekdays")]
    pub weekdays: u8,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub min_season: u32,
    pub max_season: u32,
    pub min_year: u16,
    pub max_year: u16,

    /// Match only this series. When set, the title and time filters don't apply.
    pub serieslink: Option<String>,
    pub broadcast_type: BroadcastType,
    pub star_rating: u8,

    pub config: Option<ConfigId>,
    pub priority: Priority,
    pub retention: Retention,
    pub removal: Removal,
    pub start_extra: Duration,
    pub stop_extra: Duration,

    /// Completed spawns to keep; 0 defers to the config.
    pub max_count: u32,

    /// Spawns to have scheduled at once; 0 defers to the config.
    pub max_sched_count: u32,

    /// `DedupKind::All` defers to the config.
    pub dedup: Dedup,
    pub owner: String,
    pub creator: String,
    pub comment: String,

    #[serde(skip)]
    regex: Option<Regex>,
}

impl Default for AutorecEntry {
    fn default() -> Self {
        AutorecEntry {
            name: String::new(),
            enabled: true,
            title: String::new(),
            fulltext: false,
            channel: None,
            channel_tag: None,
            content_type: 0,
            start_window: None,
            weekdays: all_weekdays(),
            min_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            min_season: 0,
            max_season: 0,
            min_year: 0,
            max_year: 0,
            serieslink: None,
            broadcast_type: BroadcastType::All,
            star_rating: 0,
            config: None,
            priority: Priority::NotSet,
            retention: Retention::Config,
            removal: Removal::Config,
            start_extra: Duration::ZERO,
            stop_extra: Duration::ZERO,
            max_count: 0,
            max_sched_count: 0,
            dedup: Dedup::default(),
            owner: String::new(),
            creator: String::new(),
            comment: String::new(),
            regex: None,
        }
    }
}

/// Returns the broadcast's start as (minute of day, Monday-zero weekday) in the global zone.
fn local_start(t: Time) -> Option<(u16, u8)> {
    let z = t.to_zoned()?;
    let minute = u16::try_from(z.hour()).ok()? * 60 + u16::try_from(z.minute()).ok()?;
    let weekday = u8::try_from(z.weekday().to_monday_zero_offset()).ok()?;
    Some((minute, weekday))
}

impl AutorecEntry {
    /// Compiles the title expression. Must be called after deserializing or editing.
    pub fn compile(&mut self) -> Result<(), Error> {
        self.regex = None;
        if self.title.is_empty() {
            return Ok(());
        }
        let re = RegexBuilder::new(&self.title)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                err!(
                    InvalidArgument,
                    msg("bad title expression {:?}", self.title),
                    source(e)
                )
            })?;
        self.regex = Some(re);
        Ok(())
    }

    /// A rule without any selective filter would record everything; such rules never match.
    fn is_wildcard(&self) -> bool {
        self.channel.is_none()
            && self.channel_tag.is_none()
            && self.content_type == 0
            && self.title.is_empty()
            && self.serieslink.is_none()
    }

    fn title_matches(&self, b: &Broadcast) -> bool {
        let Some(re) = &self.regex else {
            return self.title.is_empty();
        };
        let mut texts: SmallVec<[&str; 8]> = b.title.values().collect();
        if self.fulltext {
            texts.extend(b.subtitle.values());
            texts.extend(b.summary.values());
            texts.extend(b.description.values());
        }
        texts.iter().any(|t| re.is_match(t))
    }

    /// Decides whether the rule wants broadcast `b` on `channel`.
    pub fn matches(&self, b: &Broadcast, channel: &Channel) -> bool {
        if !self.enabled || self.weekdays == 0 || b.title.is_empty() || self.is_wildcard() {
            return false;
        }
        if let Some(c) = self.channel {
            if c != channel.id || !channel.enabled {
                return false;
            }
        }
        if let Some(tag) = &self.channel_tag {
            if !channel.has_tag(tag) {
                return false;
            }
        }
        match self.broadcast_type {
            BroadcastType::All => {}
            BroadcastType::New if !b.is_new => return false,
            BroadcastType::Repeat if !b.is_repeat => return false,
            _ => {}
        }
        if let Some(link) = &self.serieslink {
            return b.serieslink.as_ref() == Some(link);
        }
        if !self.title_matches(b) {
            return false;
        }
        if self.content_type != 0 && !b.has_content_type(self.content_type) {
            return false;
        }
        let Some((minute, weekday)) = local_start(b.start) else {
            return false;
        };
        if let Some((from, to)) = self.start_window {
            let inside = if from <= to {
                (from..=to).contains(&minute)
            } else {
                minute >= from || minute <= to
            };
            if !inside {
                return false;
            }
        }
        let duration = b.duration();
        if self.min_duration > Duration::ZERO && duration < self.min_duration {
            return false;
        }
        if self.max_duration > Duration::ZERO && duration > self.max_duration {
            return false;
        }
        if self.weekdays & 0x7f != 0x7f && self.weekdays & (1 << weekday) == 0 {
            return false;
        }
        if self.star_rating > 0 && b.star_rating < self.star_rating {
            return false;
        }
        let season = b.episode.season.unwrap_or(0);
        if self.min_season > 0 && season < self.min_season {
            return false;
        }
        if self.max_season > 0 && season > self.max_season {
            return false;
        }
        if self.min_year > 0 && b.copyright_year < self.min_year {
            return false;
        }
        if self.max_year > 0 && b.copyright_year > self.max_year {
            return false;
        }
        true
    }
}

impl LockedDatabase {
    pub fn autorec(&self, id: AutorecId) -> Option<&AutorecEntry> {
        self.autorecs.get(&id)
    }

    pub fn autorecs(&self) -> impl Iterator<Item = (&AutorecId, &AutorecEntry)> {
        self.autorecs.iter()
    }

    /// Adds a rule and schedules everything in the guide it matches.
    pub fn add_autorec(&mut self, mut r: AutorecEntry) -> Result<AutorecId, Error> {
        r.compile()?;
        if let Some(c) = r.config {
            if !self.configs.contains_key(&c) {
                bail!(NotFound, msg("no DVR config {c}"));
            }
        }
        let id = AutorecId::generate();
        info!(%id, name = %r.name, "adding autorec rule");
        self.autorecs.insert(id, r);
        self.save_autorec(id);
        self.notifier.send(Event::AutorecAdded(id));
        self.autorec_changed(id);
        Ok(id)
    }

    /// Replaces a rule. Its scheduled spawns are cancelled, the rest detached, and the guide
    /// scanned again.
    pub fn update_autorec(&mut self, id: AutorecId, mut r: AutorecEntry) -> Result<(), Error> {
        if !self.autorecs.contains_key(&id) {
            bail!(NotFound, msg("no autorec {id}"));
        }
        r.compile()?;
        self.purge_spawns(id, true);
        self.autorecs.insert(id, r);
        self.save_autorec(id);
        self.autorec_changed(id);
        Ok(())
    }

    pub fn delete_autorec(&mut self, id: AutorecId) -> Result<(), Error> {
        if !self.autorecs.contains_key(&id) {
            bail!(NotFound, msg("no autorec {id}"));
        }
        self.purge_spawns(id, true);
        self.autorecs.remove(&id);
        self.delete_doc(&store::key(store::AUTOREC_PREFIX, id));
        self.notifier.send(Event::AutorecDeleted(id));
        info!(%id, "deleted autorec rule");
        Ok(())
    }

    pub(crate) fn save_autorec(&mut self, id: AutorecId) {
        if let Some(r) = self.autorecs.get(&id) {
            put_doc(&mut *self.store, &store::key(store::AUTOREC_PREFIX, id), r);
        }
    }

    fn autorec_config(&self, r: &AutorecEntry) -> &DvrConfig {
        let id = self.resolve_config_id(r.config);
        self.configs
            .get(&id)
            .or_else(|| self.configs.get(&self.default_config))
            .expect("default config always exists")
    }

    /// The rule's dedup mode, falling back to its config's.
    pub(crate) fn autorec_dedup(&self, id: AutorecId) -> Dedup {
        match self.autorecs.get(&id) {
            Some(r) if r.dedup.kind == DedupKind::All => self.autorec_config(r).dedup,
            Some(r) => r.dedup,
            None => Dedup::default(),
        }
    }

    pub(crate) fn autorec_max_sched_count(&self, id: AutorecId) -> u32 {
        match self.autorecs.get(&id) {
            Some(r) if r.max_sched_count > 0 => r.max_sched_count,
            Some(r) => self.autorec_config(r).max_sched_count,
            None => 0,
        }
    }

    fn autorec_max_count(&self, id: AutorecId) -> u32 {
        match self.autorecs.get(&id) {
            Some(r) if r.max_count > 0 => r.max_count,
            Some(r) => self.autorec_config(r).max_count,
            None => 0,
        }
    }

    fn spawns(&self, id: AutorecId) -> impl Iterator<Item = &crate::DvrEntry> {
        self.entries.values().filter(move |e| e.autorec == Some(id))
    }

    /// Returns true if the rule may schedule another spawn.
    fn autorec_has_room(&self, id: AutorecId) -> bool {
        let max = self.autorec_max_sched_count(id);
        max == 0
            || self
                .spawns(id)
                .filter(|e| e.enabled && !e.sched_state.is_finished())
                .count()
                < max as usize
    }

    /// Cancels the rule's scheduled spawns (if `cancel_scheduled`) and detaches the rest.
    fn purge_spawns(&mut self, id: AutorecId, cancel_scheduled: bool) {
        let spawns: SmallVec<[(EntryId, SchedState); 16]> =
            self.spawns(id).map(|e| (e.id, e.sched_state)).collect();
        for (eid, state) in spawns {
            if cancel_scheduled && matches!(state, SchedState::Scheduled | SchedState::NoState) {
                self.cancel(eid, false);
                continue;
            }
            if let Some(e) = self.entries.get_mut(&eid) {
                e.autorec = None;
                self.changed(eid);
            }
        }
    }

    /// Re-scans the whole guide for the rule.
    pub(crate) fn autorec_changed(&mut self, id: AutorecId) {
        let Some(r) = self.autorecs.get(&id) else {
            return;
        };
        let now = self.now();
        let wanted: Vec<Broadcast> = self
            .channels
            .values()
            .filter(|c| c.enabled)
            .flat_map(|c| {
                self.collab
                    .epg
                    .schedule(c.id, now)
                    .into_iter()
                    .filter(|b| r.matches(b, c))
                    .collect::<Vec<_>>()
            })
            .sorted_by_key(|b| b.start)
            .collect();
        debug!(%id, matches = wanted.len(), "autorec scan");
        for b in wanted {
            if !self.autorec_has_room(id) {
                break;
            }
            self.create_by_autorec(&b, id);
        }
    }

    /// Offers a new or changed broadcast to every rule.
    pub(crate) fn autorec_check_event(&mut self, b: &Broadcast) {
        let Some(channel) = self.channels.get(&b.channel) else {
            return;
        };
        if b.stop <= self.now() {
            return;
        }
        let rules: SmallVec<[AutorecId; 8]> = self
            .autorecs
            .iter()
            .filter(|(_, r)| r.matches(b, channel))
            .map(|(&id, _)| id)
            .collect();
        for id in rules {
            if self.autorec_has_room(id) {
                self.create_by_autorec(b, id);
            }
        }
    }

    /// Schedules `b` for rule `id` unless it's already being (or has been) recorded.
    fn create_by_autorec(&mut self, b: &Broadcast, id: AutorecId) -> Option<EntryId> {
        let already = self.entries.values().any(|e| {
            !e.is_failed()
                && (e.broadcast == Some(b.id)
                    || (b.episode_uri.is_some() && e.episode_uri == b.episode_uri))
        });
        if already {
            return None;
        }
        let r = self.autorecs.get(&id)?;
        let mut n = NewEntry::from_broadcast(b);
        n.config = r.config;
        n.start_extra = r.start_extra;
        n.stop_extra = r.stop_extra;
        n.priority = r.priority;
        n.retention = r.retention;
        n.removal = r.removal;
        n.owner.clone_from(&r.owner);
        n.creator.clone_from(&r.creator);
        n.comment = if r.comment.is_empty() {
            "Auto recording".to_owned()
        } else {
            format!("Auto recording: {}", r.comment)
        };
        match self.create_entry(n, Some(id), None) {
            Ok(e) => e,
            Err(err) => {
                debug!(%id, broadcast = %b.id, err = %err.chain(), "autorec spawn failed");
                None
            }
        }
    }

    /// Called when a spawn completes; trims the oldest completed spawns down to the rule's
    /// `max_count`.
    pub(crate) fn autorec_completed(&mut self, id: AutorecId) {
        if self.loading {
            return;
        }
        let max = self.autorec_max_count(id) as usize;
        if max == 0 {
            return;
        }
        let done: Vec<EntryId> = self
            .spawns(id)
            .filter(|e| e.sched_state == SchedState::Completed && !e.is_failed())
            .sorted_by_key(|e| (e.start, e.seq))
            .map(|e| e.id)
            .collect();
        let excess = done.len().saturating_sub(max);
        for eid in done.into_iter().take(excess) {
            info!(rule = %id, entry = %eid, "removing recording beyond rule's count");
            self.cancel_remove(eid, false);
        }
    }

    /// Cancels scheduled spawns whose rule no longer wants their broadcast.
    pub fn purge_obsolete(&mut self) {
        let obsolete: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.sched_state == SchedState::Scheduled)
            .filter_map(|e| {
                let rule = self.autorecs.get(&e.autorec?)?;
                let wanted = e
                    .broadcast
                    .and_then(|b| self.collab.epg.broadcast(b))
                    .zip(e.channel.and_then(|c| self.channels.get(&c)))
                    .is_some_and(|(b, c)| rule.matches(&b, c));
                (!wanted).then_some(e.id)
            })
            .collect();
        for id in obsolete {
            info!(%id, "cancelling obsolete autorec spawn");
            self.cancel(id, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::epg::EpisodeNum;
    use crate::testutil::{self, TestDvr, T0};
    use base::time::{DAY, HOUR, MINUTE};

    fn rule(title: &str) -> AutorecEntry {
        let mut r = AutorecEntry {
            title: title.to_owned(),
            ..Default::default()
        };
        r.compile().unwrap();
        r
    }

    #[test]
    fn title_is_case_insensitive_regex() {
        testutil::init();
        let ch = Channel::new(1, "One");
        let b = testutil::broadcast(1, ch.id, T0 + HOUR, T0 + 2 * HOUR, "The Late Show");
        assert!(rule("late show").matches(&b, &ch));
        assert!(rule("^the").matches(&b, &ch));
        assert!(!rule("^late").matches(&b, &ch));
        let mut bad = AutorecEntry {
            title: "(".to_owned(),
            ..Default::default()
        };
        assert_eq!(bad.compile().unwrap_err().kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn wildcard_never_matches() {
        testutil::init();
        let ch = Channel::new(1, "One");
        let b = testutil::broadcast(1, ch.id, T0 + HOUR, T0 + 2 * HOUR, "Anything");
        assert!(!AutorecEntry::default().matches(&b, &ch));
        let r = AutorecEntry {
            channel: Some(ch.id),
            ..Default::default()
        };
        assert!(r.matches(&b, &ch));
    }

    #[test]
    fn fulltext() {
        testutil::init();
        let ch = Channel::new(1, "One");
        let mut b = testutil::broadcast(1, ch.id, T0 + HOUR, T0 + 2 * HOUR, "Film");
        b.description = "starring a famous detective".into();
        let mut r = rule("detective");
        assert!(!r.matches(&b, &ch));
        r.fulltext = true;
        assert!(r.matches(&b, &ch));
    }

    #[test]
    fn filters() {
        testutil::init();
        let ch = Channel::new(1, "One");
        // T0 is midnight UTC on a Friday.
        let mut b = testutil::broadcast(1, ch.id, T0 + 20 * HOUR, T0 + 21 * HOUR, "Film");
        let mut r = rule("film");
        r.start_window = Some((19 * 60, 21 * 60));
        assert!(r.matches(&b, &ch));
        r.start_window = Some((23 * 60, 60));
        assert!(!r.matches(&b, &ch));
        b.start = T0 + 23 * HOUR + 30 * MINUTE;
        b.stop = b.start + HOUR;
        assert!(r.matches(&b, &ch));

        r.start_window = None;
        r.weekdays = 1 << 4; // Friday
        assert!(r.matches(&b, &ch));
        r.weekdays = 1 << 5;
        assert!(!r.matches(&b, &ch));
        r.weekdays = 0x7f;

        r.min_duration = 2 * HOUR;
        assert!(!r.matches(&b, &ch));
        r.min_duration = Duration::ZERO;

        r.min_season = 2;
        b.episode = EpisodeNum {
            season: Some(1),
            ..Default::default()
        };
        assert!(!r.matches(&b, &ch));
        r.min_season = 0;

        r.broadcast_type = BroadcastType::New;
        assert!(!r.matches(&b, &ch));
        b.is_new = true;
        assert!(r.matches(&b, &ch));

        r.channel_tag = Some("hd".to_owned());
        assert!(!r.matches(&b, &ch));
    }

    #[test]
    fn serieslink_short_circuits() {
        testutil::init();
        let ch = Channel::new(1, "One");
        let mut b = testutil::broadcast(1, ch.id, T0 + HOUR, T0 + 2 * HOUR, "Something else");
        b.serieslink = Some("crid://series/1".to_owned());
        let mut r = rule("film");
        r.serieslink = Some("crid://series/1".to_owned());
        assert!(r.matches(&b, &ch));
        b.serieslink = None;
        assert!(!r.matches(&b, &ch));
    }

    #[test]
    fn add_schedules_matching_broadcasts() {
        testutil::init();
        let t = TestDvr::new();
        let a = t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        t.epg.add(testutil::broadcast(2, testutil::CH1, T0 + 2 * HOUR, T0 + 3 * HOUR, "Film"));
        let b = t.epg.add(testutil::broadcast(3, testutil::CH2, T0 + DAY, T0 + DAY + HOUR, "News"));
        let mut l = t.db.lock();
        let id = l
            .add_autorec(AutorecEntry {
                title: "news".to_owned(),
                comment: "daily".to_owned(),
                ..Default::default()
            })
            .unwrap();
        let spawns: Vec<_> = l.entries().filter(|e| e.autorec == Some(id)).collect();
        assert_eq!(spawns.len(), 2);
        assert!(spawns.iter().all(|e| e.comment == "Auto recording: daily"));
        assert!(l.find_by_broadcast(a.id).is_some());
        assert!(l.find_by_broadcast(b.id).is_some());

        // Same broadcast again: no new entry.
        l.on_broadcast_updated(&a);
        assert_eq!(l.entries().count(), 2);
    }

    #[test]
    fn same_episode_uri_spawns_once() {
        testutil::init();
        let t = TestDvr::new();
        let mut a = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        a.episode_uri = Some("crid://episode/7".to_owned());
        let mut b = testutil::broadcast(2, testutil::CH2, T0 + DAY, T0 + DAY + HOUR, "Film");
        b.episode_uri = a.episode_uri.clone();
        t.epg.add(a.clone());
        t.epg.add(b.clone());
        let mut l = t.db.lock();
        let id = l.add_autorec(rule("film")).unwrap();
        assert_eq!(l.entries().count(), 1);
        let ea = l.find_by_broadcast(a.id).unwrap().id;
        assert_eq!(l.entry(ea).unwrap().autorec, Some(id));
        assert!(l.find_by_broadcast(b.id).is_none());
        l.on_broadcast_updated(&b);
        assert!(l.find_by_broadcast(b.id).is_none());

        // A failed recording of the episode doesn't count.
        l.entries.get_mut(&ea).unwrap().sched_state = SchedState::MissedTime;
        l.on_broadcast_updated(&b);
        assert_eq!(l.find_by_broadcast(b.id).unwrap().autorec, Some(id));
    }

    #[test]
    fn max_sched_count() {
        testutil::init();
        let t = TestDvr::new();
        for i in 0..4 {
            let start = T0 + (i + 1) * DAY;
            t.epg.add(testutil::broadcast(
                i as u32 + 1,
                testutil::CH1,
                start,
                start + HOUR,
                "News",
            ));
        }
        let mut l = t.db.lock();
        let id = l
            .add_autorec(AutorecEntry {
                title: "news".to_owned(),
                max_sched_count: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(l.autorec_max_sched_count(id), 2);
        let mut starts: Vec<_> = l.entries().map(|e| e.start).collect();
        starts.sort();
        assert_eq!(starts, vec![T0 + DAY, T0 + 2 * DAY]);
    }

    #[test]
    fn update_replaces_spawns_and_delete_detaches() {
        testutil::init();
        let t = TestDvr::new();
        t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        t.epg.add(testutil::broadcast(2, testutil::CH1, T0 + 2 * HOUR, T0 + 3 * HOUR, "Film"));
        let mut l = t.db.lock();
        let id = l.add_autorec(rule("news")).unwrap();
        assert_eq!(l.entries().count(), 1);
        l.update_autorec(id, rule("film")).unwrap();
        let titles: Vec<_> = l.entries().map(|e| e.title_str().to_owned()).collect();
        assert_eq!(titles, vec!["Film"]);
        l.delete_autorec(id).unwrap();
        assert_eq!(l.entries().count(), 0);
        assert!(l.autorec(id).is_none());
        assert_eq!(
            l.update_autorec(id, rule("x")).unwrap_err().kind(),
            base::ErrorKind::NotFound
        );
    }

    #[test]
    fn max_count_trims_oldest() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let id = l
            .add_autorec(AutorecEntry {
                title: "news".to_owned(),
                max_count: 1,
                ..Default::default()
            })
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..2 {
            let start = T0 - (3 - i) * HOUR;
            let eid = l
                .create_entry(
                    NewEntry::new(testutil::CH1, start, start + HOUR, "News"),
                    Some(id),
                    None,
                )
                .unwrap()
                .unwrap();
            let e = l.entries.get_mut(&eid).unwrap();
            e.sched_state = SchedState::Completed;
            e.last_error = crate::StreamCode::Ok;
            e.files.push(crate::entry::FileRecord {
                filename: t.storage().join(format!("gone-{i}.ts")),
                ..Default::default()
            });
            ids.push(eid);
        }
        l.autorec_completed(id);
        assert!(l.entry(ids[0]).unwrap().file_removed);
        assert!(!l.entry(ids[1]).unwrap().file_removed);
    }

    #[test]
    fn purge_obsolete_cancels_unwanted() {
        testutil::init();
        let t = TestDvr::new();
        let b = t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        let mut l = t.db.lock();
        let id = l.add_autorec(rule("news")).unwrap();
        let eid = l.find_by_broadcast(b.id).unwrap().id;
        l.purge_obsolete();
        assert!(l.entry(eid).is_some());
        l.autorecs.get_mut(&id).unwrap().enabled = false;
        l.purge_obsolete();
        assert!(l.entry(eid).is_none());
    }
}
