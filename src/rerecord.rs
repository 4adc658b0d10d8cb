// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Rerecording of damaged recordings, and matching of entries against broadcasts.

use base::time::{Duration, Time};
use tracing::{debug, info};

use crate::autorec::DedupKind;
use crate::db::LockedDatabase;
use crate::entry::{DvrEntry, EntryId, NewEntry, SchedState};
use crate::epg::Broadcast;
use crate::retention::{Removal, Retention};
use crate::streaming::StreamCode;

impl LockedDatabase {
    /// Returns true if `b` plausibly is the programme `e` was scheduled for.
    ///
    /// The durations must agree within 20%. Then a shared DVB event id is conclusive;
    /// otherwise the start times must be within `window` and the titles (and, where both
    /// have one, the episode numbers) must agree.
    pub(crate) fn fuzzy_match(e: &DvrEntry, b: &Broadcast, eid: u16, window: Duration) -> bool {
        let entry_len = e.stop - e.start;
        let bcast_len = b.stop - b.start;
        if (bcast_len.0 - entry_len.0).abs() > entry_len.0 / 5 {
            return false;
        }
        if e.dvb_eid != 0 && eid != 0 && e.dvb_eid == eid {
            return true;
        }
        let (Some(t1), Some(t2)) = (b.title.get(None), e.title.get(None)) else {
            return false;
        };
        if (b.start - e.start).0.unsigned_abs() > window.0.max(0) as u64 {
            return false;
        }
        if t1 != t2 {
            return false;
        }
        let episode = b.episode.to_string();
        if !episode.is_empty() && !e.episode.is_empty() && episode != e.episode {
            return false;
        }
        true
    }

    /// Looks for an earlier recording which makes this autorec spawn redundant under its
    /// rule's dedup mode.
    pub(crate) fn duplicate_event(&self, id: EntryId) -> Option<EntryId> {
        let e = self.entries.get(&id)?;
        let dedup = self.autorec_dedup(e.autorec?);
        match dedup.kind {
            DedupKind::All => return None,
            DedupKind::DifferentEpisodeNumber if e.episode.is_empty() => return None,
            DedupKind::DifferentSubtitle if e.subtitle.is_empty() => return None,
            DedupKind::DifferentDescription if e.description.is_empty() => return None,
            _ => {}
        }
        let title = e.title.get(None).filter(|t| !t.is_empty())?;
        let day = |t: Time| t.to_zoned();
        let e_day = day(e.start);
        self.entries
            .values()
            .filter(|o| {
                o.id != id
                    && !matches!(o.sched_state, SchedState::NoState | SchedState::MissedTime)
                    && o.start <= e.start
                    && !(o.sched_state == SchedState::Scheduled && !o.enabled)
                    && !o.is_failed()
                    && o.title.get(None) == Some(title)
                    && (!dedup.local || o.autorec == e.autorec)
            })
            .find(|o| match dedup.kind {
                DedupKind::All => false,
                DedupKind::DifferentEpisodeNumber => o.episode == e.episode,
                DedupKind::DifferentTitle => true,
                DedupKind::DifferentSubtitle => o.subtitle == e.subtitle,
                DedupKind::DifferentDescription => o.description == e.description,
                DedupKind::OncePerDay => match (&e_day, day(o.start)) {
                    (Some(a), Some(b)) => a.date() == b.date(),
                    _ => false,
                },
                DedupKind::OncePerWeek => match (&e_day, day(o.start)) {
                    (Some(a), Some(b)) => {
                        let (a, b) = (a.date().iso_week_date(), b.date().iso_week_date());
                        a.year() == b.year() && a.week() == b.week()
                    }
                    _ => false,
                },
                DedupKind::OncePerMonth => match (&e_day, day(o.start)) {
                    (Some(a), Some(b)) => a.year() == b.year() && a.month() == b.month(),
                    _ => false,
                },
            })
            .map(|o| o.id)
    }

    /// Decides whether a finished entry should be recorded again, and schedules it if so.
    ///
    /// Returns true if the entry has been taken care of and shouldn't have its retention
    /// armed: either a rerecording now exists or the entry itself was deleted.
    pub(crate) fn rerecord(&mut self, id: EntryId) -> bool {
        let Some(e) = self.entries.get(&id) else {
            return false;
        };
        if self.loading || e.dont_rerecord {
            return false;
        }
        let threshold = self.config_of(e).rerecord_errors;
        if threshold == 0 {
            return false;
        }

        if let Some(parent) = e.parent {
            let Some(p) = self.entries.get(&parent) else {
                return false;
            };
            match e.sched_state {
                SchedState::Completed if e.errors == 0 && e.data_errors < p.data_errors => {
                    if e.total_size() / 5 < p.total_size() / 6 {
                        self.not_so_good(id, parent);
                        return false;
                    }
                    info!(%id, %parent, "rerecording is better; replacing original");
                    self.cancel_delete(parent, true);
                }
                SchedState::Completed => {
                    if !e.any_file_exists() {
                        self.cancel_delete(id, true);
                        return true;
                    }
                    self.not_so_good(id, parent);
                    return false;
                }
                SchedState::MissedTime => {
                    debug!(%id, %parent, "rerecording missed; trying again");
                    self.cancel_delete(id, true);
                    return true;
                }
                _ => {}
            }
        }

        let Some(e) = self.entries.get(&id) else {
            return false;
        };
        if e.child.is_some() || !e.enabled {
            return false;
        }
        match e.sched_state {
            SchedState::Scheduled | SchedState::Recording => return false,
            SchedState::Completed if e.data_errors < threshold && e.errors == 0 => return false,
            _ => {}
        }
        let Some(channel) = e.channel else {
            return false;
        };
        let now = self.now();
        let config = self.config_of(e);
        let (pre, _) = self.padding(e);
        let lead = pre - config.effective_warm_time();
        let best = self
            .collab
            .epg
            .schedule(channel, now)
            .into_iter()
            .filter(|b| {
                Some(b.id) != e.broadcast
                    && b.start - lead >= now
                    && Self::fuzzy_match(e, b, 0, Duration(i64::MAX))
            })
            .min_by_key(|b| b.start);
        let Some(b) = best else {
            return false;
        };
        let priority = e.priority.resolve(config.priority).raised();
        let mut n = NewEntry::from_broadcast(&b);
        n.config = Some(e.config);
        n.start_extra = e.start_extra;
        n.stop_extra = e.stop_extra;
        n.owner.clone_from(&e.owner);
        n.creator.clone_from(&e.creator);
        n.priority = priority;
        n.retention = e.retention;
        n.removal = e.removal;
        n.comment = if e.comment.is_empty() {
            "Re-record".to_owned()
        } else {
            format!("Re-record: {}", e.comment)
        };
        match self.create_entry(n, None, None) {
            Ok(Some(child)) => {
                info!(%id, %child, start = %b.start, "scheduled rerecording");
                self.change_parent_child(id, Some(child));
                self.timers.disarm(crate::timer::Slot::Entry(id));
                true
            }
            Ok(None) => {
                // Something equivalent is already scheduled.
                if let Some(e) = self.entries.get_mut(&id) {
                    e.dont_rerecord = true;
                }
                self.changed(id);
                false
            }
            Err(err) => {
                debug!(%id, err = %err.chain(), "unable to schedule rerecording");
                false
            }
        }
    }

    /// A rerecording turned out no better than its original: demote it, and let the original
    /// resume its own retention.
    fn not_so_good(&mut self, id: EntryId, parent: EntryId) {
        info!(%id, %parent, "rerecording is no better than the original");
        if let Some(e) = self.entries.get_mut(&id) {
            e.retention = Retention::OnRemove;
            e.removal = Removal::Days(1);
        }
        self.change_parent_child(parent, None);
        self.set_state(
            id,
            SchedState::Completed,
            crate::entry::RecState::Finished,
            StreamCode::WeakStream,
        );
        self.retention_timer(parent);
    }
}

#[cfg(test)]
mod tests {
    use crate::autorec::{AutorecEntry, Dedup, DedupKind};
    use crate::config::DvrConfig;
    use crate::db::LockedDatabase;
    use crate::entry::{FileRecord, Priority};
    use crate::testutil::{self, TestDvr, T0};
    use crate::notify::Event;
    use crate::{NewEntry, RecState, SchedState, StreamCode};
    use base::time::{Duration, DAY, HOUR, MINUTE};
    use std::sync::Arc;

    #[test]
    fn fuzzy_match() {
        let e = crate::entry::DvrEntry::new(
            crate::EntryId::generate(),
            0,
            T0,
            crate::config::ConfigId::generate(),
            NewEntry::new(testutil::CH1, T0, T0 + HOUR, "News"),
        );
        let mut b = testutil::broadcast(1, testutil::CH1, T0 + DAY, T0 + DAY + 55 * MINUTE, "News");
        assert!(LockedDatabase::fuzzy_match(&e, &b, 0, Duration(i64::MAX)));
        assert!(!LockedDatabase::fuzzy_match(&e, &b, 0, HOUR));
        b.stop = T0 + DAY + 30 * MINUTE; // 50% shorter
        assert!(!LockedDatabase::fuzzy_match(&e, &b, 0, Duration(i64::MAX)));
        b.stop = T0 + DAY + HOUR;
        b.title = "Sport".into();
        assert!(!LockedDatabase::fuzzy_match(&e, &b, 0, Duration(i64::MAX)));
    }

    fn rerecording_dvr() -> TestDvr {
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let id = l.default_config_id();
        let c = DvrConfig {
            rerecord_errors: 100,
            ..l.config(id).unwrap().clone()
        };
        l.update_config(id, c).unwrap();
        drop(l);
        t
    }

    #[test]
    fn rerecords_failed_recording() {
        testutil::init();
        let t = rerecording_dvr();
        let first = t.epg.add(testutil::broadcast(
            1,
            testutil::CH1,
            T0 + HOUR,
            T0 + 2 * HOUR,
            "Film",
        ));
        let repeat = t.epg.add(testutil::broadcast(
            2,
            testutil::CH1,
            T0 + DAY,
            T0 + DAY + HOUR,
            "Film",
        ));
        let id = t.db.lock().create(NewEntry::from_broadcast(&first)).unwrap().unwrap();
        t.subscriber.fail_next();
        t.advance_to(T0 + HOUR);
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::BadSource);
        let child = e.child.expect("rerecording scheduled");
        let c = l.entry(child).unwrap();
        assert_eq!(c.parent, Some(id));
        assert_eq!(c.broadcast, Some(repeat.id));
        assert_eq!(c.priority, Priority::High);
        assert_eq!(c.comment, "Re-record");
        assert_eq!(c.sched_state, SchedState::Scheduled);

        // The parent's retention is pinned while the child is pending.
        assert_eq!(l.timers.get(crate::timer::Slot::Entry(id)), None);
    }

    #[test]
    fn no_rerecord_when_disabled() {
        testutil::init();
        let t = TestDvr::new();
        let first = t.epg.add(testutil::broadcast(
            1,
            testutil::CH1,
            T0 + HOUR,
            T0 + 2 * HOUR,
            "Film",
        ));
        t.epg.add(testutil::broadcast(2, testutil::CH1, T0 + DAY, T0 + DAY + HOUR, "Film"));
        let id = t.db.lock().create(NewEntry::from_broadcast(&first)).unwrap().unwrap();
        t.subscriber.fail_next();
        t.advance_to(T0 + HOUR);
        assert_eq!(t.db.lock().entry(id).unwrap().child, None);
    }

    #[test]
    fn cancelling_child_without_rerecord_stops_parent() {
        testutil::init();
        let t = rerecording_dvr();
        let first = t.epg.add(testutil::broadcast(
            1,
            testutil::CH1,
            T0 + HOUR,
            T0 + 2 * HOUR,
            "Film",
        ));
        t.epg.add(testutil::broadcast(2, testutil::CH1, T0 + DAY, T0 + DAY + HOUR, "Film"));
        let id = t.db.lock().create(NewEntry::from_broadcast(&first)).unwrap().unwrap();
        t.subscriber.fail_next();
        t.advance_to(T0 + HOUR);
        let mut l = t.db.lock();
        let child = l.entry(id).unwrap().child.unwrap();
        l.cancel(child, false);
        assert!(l.entry(child).is_none());
        let p = l.entry(id).unwrap();
        assert_eq!(p.child, None);
        assert!(p.dont_rerecord);
        assert!(l.timers.get(crate::timer::Slot::Entry(id)).is_some());
    }

    #[test]
    fn parent_child_links_are_symmetric() {
        testutil::init();
        let t = rerecording_dvr();
        let mut l = t.db.lock();
        let a = l
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "a"))
            .unwrap()
            .unwrap();
        let b = l
            .create(NewEntry::new(testutil::CH1, T0 + 3 * HOUR, T0 + 4 * HOUR, "b"))
            .unwrap()
            .unwrap();
        let c = l
            .create(NewEntry::new(testutil::CH1, T0 + 5 * HOUR, T0 + 6 * HOUR, "c"))
            .unwrap()
            .unwrap();
        l.change_parent_child(a, Some(b));
        assert_eq!(l.entry(b).unwrap().parent, Some(a));
        l.change_parent_child(a, Some(c));
        assert_eq!(l.entry(b).unwrap().parent, None);
        assert_eq!(l.entry(c).unwrap().parent, Some(a));
        l.change_parent_child(b, Some(c));
        assert_eq!(l.entry(a).unwrap().child, None);
        assert_eq!(l.entry(b).unwrap().child, Some(c));
        l.cancel(c, true);
        assert_eq!(l.entry(b).unwrap().child, None);
        for e in l.entries() {
            if let Some(p) = e.parent {
                assert_eq!(l.entry(p).unwrap().child, Some(e.id));
            }
            if let Some(c) = e.child {
                assert_eq!(l.entry(c).unwrap().parent, Some(e.id));
            }
        }
    }

    #[test]
    fn better_child_replaces_parent() {
        testutil::init();
        let t = rerecording_dvr();
        let mut l = t.db.lock();
        let dir = t.storage();
        std::fs::create_dir_all(&dir).unwrap();
        let file = |name: &str, size: u64| {
            let p = dir.join(name);
            std::fs::write(&p, vec![0u8; size as usize]).unwrap();
            FileRecord {
                filename: p,
                size,
                ..Default::default()
            }
        };
        let parent = l
            .create(NewEntry::new(testutil::CH1, T0 - 3 * HOUR, T0 - 2 * HOUR, "a"))
            .unwrap()
            .unwrap();
        let child = l
            .create(NewEntry::new(testutil::CH1, T0 - 2 * HOUR, T0 - HOUR, "a"))
            .unwrap()
            .unwrap();
        {
            let p = l.entries.get_mut(&parent).unwrap();
            p.files.push(file("p.ts", 600));
            p.data_errors = 500;
            p.sched_state = SchedState::Completed;
        }
        {
            let c = l.entries.get_mut(&child).unwrap();
            c.files.push(file("c.ts", 600));
            c.data_errors = 10;
            c.sched_state = SchedState::Completed;
        }
        l.change_parent_child(parent, Some(child));
        assert!(!l.rerecord(child));
        assert!(l.entry(parent).is_none());
        assert!(!dir.join("p.ts").exists());
        assert_eq!(l.entry(child).unwrap().parent, None);
    }

    #[test]
    fn small_child_is_not_so_good() {
        testutil::init();
        let t = rerecording_dvr();
        let mut l = t.db.lock();
        let parent = l
            .create(NewEntry::new(testutil::CH1, T0 - 3 * HOUR, T0 - 2 * HOUR, "a"))
            .unwrap()
            .unwrap();
        let child = l
            .create(NewEntry::new(testutil::CH1, T0 - 2 * HOUR, T0 - HOUR, "a"))
            .unwrap()
            .unwrap();
        {
            let p = l.entries.get_mut(&parent).unwrap();
            p.files.push(FileRecord {
                size: 6000,
                ..Default::default()
            });
            p.data_errors = 500;
            p.sched_state = SchedState::Completed;
        }
        {
            let c = l.entries.get_mut(&child).unwrap();
            c.files.push(FileRecord {
                size: 100,
                ..Default::default()
            });
            c.sched_state = SchedState::Completed;
        }
        l.change_parent_child(parent, Some(child));
        assert!(!l.rerecord(child));
        let c = l.entry(child).unwrap();
        assert_eq!(c.parent, None);
        assert_eq!(c.last_error, StreamCode::WeakStream);
        assert_eq!(c.retention, crate::retention::Retention::OnRemove);
        assert_eq!(l.entry(parent).unwrap().child, None);
    }

    fn dedup_dvr(kind: DedupKind) -> (TestDvr, crate::autorec::AutorecId) {
        let t = TestDvr::new();
        let mut rule = AutorecEntry::default();
        rule.name = "films".to_owned();
        rule.title = "^Film$".to_owned();
        rule.channel = Some(testutil::CH1);
        rule.dedup = Dedup { kind, local: false };
        let id = t.db.lock().add_autorec(rule).unwrap();
        (t, id)
    }

    #[test]
    fn duplicate_episode_is_skipped() {
        testutil::init();
        let (t, _) = dedup_dvr(DedupKind::DifferentEpisodeNumber);
        let mut a = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        a.episode.episode = Some(3);
        let mut b = testutil::broadcast(2, testutil::CH1, T0 + DAY, T0 + DAY + HOUR, "Film");
        b.episode.episode = Some(3);
        t.epg.add(a.clone());
        t.epg.add(b.clone());
        t.db.lock().on_broadcast_updated(&a);
        t.db.lock().on_broadcast_updated(&b);
        let (ea, eb) = {
            let l = t.db.lock();
            (
                l.find_by_broadcast(a.id).unwrap().id,
                l.find_by_broadcast(b.id).unwrap().id,
            )
        };
        let l = t.db.lock();
        assert_eq!(l.duplicate_event(ea), None);
        assert_eq!(l.duplicate_event(eb), Some(ea));
    }

    #[test]
    fn duplicate_spawn_deleted_instead_of_recorded() {
        testutil::init();
        let (t, _) = dedup_dvr(DedupKind::DifferentEpisodeNumber);
        let mut a = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        a.episode.episode = Some(3);
        let mut b = testutil::broadcast(2, testutil::CH1, T0 + 3 * HOUR, T0 + 4 * HOUR, "Film");
        b.episode.episode = Some(3);
        for x in [&a, &b] {
            t.epg.add(x.clone());
            t.db.lock().on_broadcast_updated(x);
        }
        let (ea, eb) = {
            let l = t.db.lock();
            (
                l.find_by_broadcast(a.id).unwrap().id,
                l.find_by_broadcast(b.id).unwrap().id,
            )
        };
        t.advance_to(T0 + HOUR);
        let sub = t.subscriber.last().unwrap();
        sub.queue.deliver(testutil::start_msg());
        sub.queue.deliver(testutil::video_packet(0, b"abc"));
        t.wait_for(ea, |e| e.rec_state == RecState::Running);
        t.advance_to(T0 + 3 * HOUR);
        t.join_workers();
        let l = t.db.lock();
        let e = l.entry(ea).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::Ok);
        assert!(l.entry(eb).is_none());
        assert!(t.events.lock().contains(&Event::EntryDeleted(eb)));

        // The duplicate never subscribed.
        assert!(Arc::ptr_eq(&t.subscriber.last().unwrap().queue, &sub.queue));
    }

    #[test]
    fn once_per_day() {
        testutil::init();
        let (t, _) = dedup_dvr(DedupKind::OncePerDay);
        let a = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        let b = testutil::broadcast(2, testutil::CH1, T0 + 3 * HOUR, T0 + 4 * HOUR, "Film");
        let c = testutil::broadcast(3, testutil::CH1, T0 + DAY + HOUR, T0 + DAY + 2 * HOUR, "Film");
        for x in [&a, &b, &c] {
            t.epg.add(x.clone());
            t.db.lock().on_broadcast_updated(x);
        }
        let l = t.db.lock();
        let id = |b: &crate::epg::Broadcast| l.find_by_broadcast(b.id).unwrap().id;
        assert_eq!(l.duplicate_event(id(&b)), Some(id(&a)));
        assert_eq!(l.duplicate_event(id(&c)), None);
    }

    #[test]
    fn record_all_never_dedups() {
        testutil::init();
        let (t, _) = dedup_dvr(DedupKind::All);
        let a = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        let b = testutil::broadcast(2, testutil::CH1, T0 + 3 * HOUR, T0 + 4 * HOUR, "Film");
        for x in [&a, &b] {
            t.epg.add(x.clone());
            t.db.lock().on_broadcast_updated(x);
        }
        let l = t.db.lock();
        let eb = l.find_by_broadcast(b.id).unwrap().id;
        assert_eq!(l.duplicate_event(eb), None);
    }
}
