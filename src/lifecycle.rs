// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Entry transitions: scheduling, starting and stopping, cancellation, retention, and the
//! reactions to guide changes.

use base::time::{Duration, Time, HOUR};
use base::{bail, Error};
use tracing::{debug, info, warn};

use crate::db::LockedDatabase;
use crate::entry::{DvrEntry, EntryChange, EntryId, RecState, SchedState};
use crate::epg::{Broadcast, BroadcastId, EpgSource, RunningState};
use crate::notify::Event;
use crate::retention::{self, Plan, Retention};
use crate::store;
use crate::streaming::StreamCode;
use crate::timer::{Action, Slot};

/// How long a recording is extended at a time while the guide says the programme is running.
const EPG_RUNNING_GRACE: Duration = Duration(10);

/// Segment search limits: programmes examined, gap from the previous segment, and span from
/// the first segment's start.
const MAX_SEGMENT_PROGRAMMES: usize = 10;
const MAX_SEGMENT_GAP: Duration = Duration(3 * 3600);
const MAX_SEGMENT_SPAN: Duration = Duration(9 * 3600);

/// How far a replaced broadcast's successor may be from the entry's times to be adopted.
const UPDATE_WINDOW: Duration = Duration(86_400);

impl LockedDatabase {
    /// Effective (pre, post) padding of `e`.
    pub(crate) fn padding(&self, e: &DvrEntry) -> (Duration, Duration) {
        let config = self.config_of(e);
        let (pre, post) = e
            .channel
            .and_then(|c| self.channels.get(&c))
            .map(|c| (c.extra_pre, c.extra_post))
            .unwrap_or((Duration::ZERO, Duration::ZERO));
        (e.pre_padding(pre, config), e.post_padding(post, config))
    }

    /// When the entry's recording starts: the start minus padding and, for a warm start, the
    /// config's warm time.
    pub fn start_time(&self, id: EntryId, warm: bool) -> Option<Time> {
        let e = self.entries.get(&id)?;
        let (pre, _) = self.padding(e);
        let warm = warm.then(|| self.config_of(e).effective_warm_time());
        Some(e.start_time(pre, warm))
    }

    /// When the entry's recording stops: the stop plus padding, extended over any following
    /// segments of the same programme.
    pub fn stop_time(&mut self, id: EntryId) -> Option<Time> {
        if self.entries.get(&id)?.segment_stop_extra.is_none() {
            let extra = self.segment_stop_extra(id);
            if let Some(e) = self.entries.get_mut(&id) {
                e.segment_stop_extra = Some(extra);
            }
        }
        let e = self.entries.get(&id)?;
        let (_, post) = self.padding(e);
        Some(e.stop_time(post))
    }

    fn segment_stop_extra(&self, id: EntryId) -> Duration {
        let Some(e) = self.entries.get(&id) else {
            return Duration::ZERO;
        };
        let (Some(bid), Some(channel)) = (e.broadcast, e.channel) else {
            return Duration::ZERO;
        };
        let Some(b) = self.collab.epg.broadcast(bid) else {
            return Duration::ZERO;
        };
        let Some(link) = b.segment_link.as_deref() else {
            return Duration::ZERO;
        };
        let mut extra = Duration::ZERO;
        let mut last_stop = b.stop;
        for n in self
            .collab
            .epg
            .schedule(channel, b.stop)
            .iter()
            .filter(|n| n.id != b.id && n.start >= b.stop)
            .take(MAX_SEGMENT_PROGRAMMES)
        {
            if n.start - last_stop > MAX_SEGMENT_GAP || n.start - b.start > MAX_SEGMENT_SPAN {
                break;
            }
            if n.segment_link.as_deref() == Some(link) {
                extra = n.stop - b.stop;
                last_stop = n.stop;
            }
        }
        if extra != Duration::ZERO {
            debug!(%id, %extra, "extending over following segments");
        }
        extra
    }

    /// Sets the entry's state triple, persisting and notifying if anything changed.
    pub(crate) fn set_state(
        &mut self,
        id: EntryId,
        sched: SchedState,
        rec: RecState,
        code: StreamCode,
    ) {
        let Some(e) = self.entries.get_mut(&id) else {
            return;
        };
        if e.sched_state == sched && e.rec_state == rec && e.last_error == code {
            return;
        }
        if e.last_error != code && code.is_error() {
            e.errors += 1;
        }
        debug!(
            %id,
            from = ?(e.sched_state, e.rec_state, e.last_error),
            to = ?(sched, rec, code),
            "state change"
        );
        e.sched_state = sched;
        e.rec_state = rec;
        e.last_error = code;
        let b = e.broadcast;
        self.changed(id);
        if let Some(b) = b {
            self.queue_epg_notify(b);
        }
    }

    pub(crate) fn queue_epg_notify(&mut self, b: BroadcastId) {
        if self.notifier.queue_epg(b) {
            let now = self.now();
            self.timers.arm(Slot::EpgNotify, Action::EpgNotify, now);
        }
    }

    fn mark_missed(&mut self, id: EntryId, code: StreamCode) {
        self.set_state(id, SchedState::MissedTime, RecState::Finished, code);
    }

    fn mark_completed(&mut self, id: EntryId, code: StreamCode) {
        self.set_state(id, SchedState::Completed, RecState::Finished, code);
        if let Some(a) = self.entries.get(&id).and_then(|e| e.autorec) {
            self.autorec_completed(a);
        }
    }

    /// Decides what the entry waits for next and arms its timer accordingly.
    pub(crate) fn set_timer(&mut self, id: EntryId) {
        let now = self.now();
        let (Some(start), Some(stop)) = (self.start_time(id, true), self.stop_time(id)) else {
            return;
        };
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let state = e.sched_state;
        let last_error = e.last_error;
        if now >= stop || e.dont_reschedule {
            if e.epg_says_running() && !e.dont_reschedule && state == SchedState::Recording {
                self.timers.arm(
                    Slot::Entry(id),
                    Action::StopRecording,
                    now + EPG_RUNNING_GRACE,
                );
                return;
            }
            if state == SchedState::Recording {
                let code = if e.rec_state == RecState::Error {
                    last_error
                } else {
                    StreamCode::Ok
                };
                self.stop_recording(id, code, false);
                return;
            }
            if e.files.is_empty() {
                self.mark_missed(id, last_error);
            } else {
                self.mark_completed(id, last_error);
            }
            if !self.rerecord(id) {
                self.retention_timer(id);
            }
            return;
        }
        if state == SchedState::Recording {
            if !e.enabled {
                self.abort_recording(id);
                return;
            }
            self.timers.arm(Slot::Entry(id), Action::StopRecording, stop);
            return;
        }
        let channel_enabled = e
            .channel
            .and_then(|c| self.channels.get(&c))
            .is_some_and(|c| c.enabled);
        if e.enabled && channel_enabled {
            self.set_state(id, SchedState::Scheduled, RecState::Pending, last_error);
            self.timers.arm(Slot::Entry(id), Action::StartRecording, start);
        } else {
            self.set_state(id, SchedState::NoState, RecState::Pending, last_error);
            self.timers.disarm(Slot::Entry(id));
        }
    }

    /// Fires every timer which is due, including zero-delay tasks armed meanwhile.
    pub(crate) fn run_due_timers(&mut self) {
        loop {
            let now = self.now();
            let Some((slot, action)) = self.timers.pop_due(now) else {
                break;
            };
            match (slot, action) {
                (Slot::Entry(id), Action::StartRecording) => self.on_start_timer(id),
                (Slot::Entry(id), Action::StopRecording) => self.on_stop_timer(id),
                (Slot::Entry(id), Action::RemoveFiles) => self.on_remove_files(id),
                (Slot::Entry(id), Action::Expire) => {
                    info!(%id, "retention expired");
                    self.defer_destroy(id);
                }
                (Slot::Entry(id), Action::Rerecord) => {
                    if !self.rerecord(id) {
                        self.retention_timer(id);
                    }
                }
                (Slot::Destroy(id), _) => self.destroy(id),
                (Slot::EpgNotify, _) => self.notifier.flush_epg(),
                (Slot::TimerecCheck, _) => {
                    self.timerec_check_all();
                    let next = now.saturating_add(self.options.timerec_check);
                    self.timers
                        .arm(Slot::TimerecCheck, Action::TimerecCheck, next);
                }
                (Slot::SpaceCheck, _) => {
                    self.space_check();
                    let next = now.saturating_add(self.options.space_check);
                    self.timers.arm(Slot::SpaceCheck, Action::SpaceCheck, next);
                }
                (slot, action) => warn!(?slot, ?action, "ignoring unexpected timer"),
            }
        }
    }

    fn on_start_timer(&mut self, id: EntryId) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let last_error = e.last_error;
        let channel_enabled = e
            .channel
            .and_then(|c| self.channels.get(&c))
            .is_some_and(|c| c.enabled);
        if !channel_enabled || !e.enabled {
            self.set_state(id, SchedState::NoState, RecState::Pending, last_error);
            return;
        }
        if let Some(dup) = self.duplicate_event(id) {
            info!(%id, duplicate_of = %dup, "not recording duplicate");
            self.cancel_delete(id, true);
            return;
        }
        self.set_state(id, SchedState::Recording, RecState::Pending, StreamCode::Ok);
        if let Some(e) = self.entries.get(&id) {
            info!(
                %id,
                title = e.title_str(),
                channel = %e.channel_name,
                "recorder starting"
            );
        }
        if let Err(code) = self.rec_subscribe(id) {
            warn!(%id, %code, "unable to start recording");
            self.mark_completed(id, code);
            if !self.rerecord(id) {
                self.retention_timer(id);
            }
            return;
        }
        if let Some(stop) = self.stop_time(id) {
            self.timers.arm(Slot::Entry(id), Action::StopRecording, stop);
        }
    }

    fn on_stop_timer(&mut self, id: EntryId) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        if e.sched_state != SchedState::Recording {
            return;
        }
        if e.epg_says_running() && !e.dont_reschedule {
            debug!(%id, "guide says still running; extending");
            let when = self.now() + EPG_RUNNING_GRACE;
            self.timers.arm(Slot::Entry(id), Action::StopRecording, when);
            return;
        }
        let code = if e.rec_state == RecState::Error {
            e.last_error
        } else {
            StreamCode::Ok
        };
        self.stop_recording(id, code, false);
    }

    /// Ends the entry's recording with `code`.
    ///
    /// With `clone`, the pipeline has already moved to another entry and is left alone.
    pub(crate) fn stop_recording(&mut self, id: EntryId, code: StreamCode, clone: bool) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let rec_state = e.rec_state;
        let autorec = e.autorec;
        if !clone {
            self.rec_unsubscribe(id);
        }
        let Some(e) = self.entries.get_mut(&id) else {
            return;
        };
        e.dont_reschedule = true;
        let missed = code != StreamCode::InvalidTarget
            && (matches!(rec_state, RecState::Pending | RecState::WaitProgramStart)
                || e.files.is_empty());
        if missed {
            self.mark_missed(id, code);
        } else {
            self.mark_completed(id, code);
        }
        if let Some(e) = self.entries.get(&id) {
            info!(
                %id,
                title = e.title_str(),
                status = e.status(),
                "end of program"
            );
        }
        self.changed(id);
        if !self.rerecord(id) {
            self.retention_timer(id);
        }
        if let Some(a) = autorec {
            if self.autorec_max_sched_count(a) > 0 {
                self.autorec_changed(a);
            }
        }
    }

    /// Stops a recording at the user's request. What the user aborted isn't rerecorded.
    fn abort_recording(&mut self, id: EntryId) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.dont_rerecord = true;
        }
        self.stop_recording(id, StreamCode::Aborted, false);
    }

    /// Arms the next retention step of a finished entry.
    pub(crate) fn retention_timer(&mut self, id: EntryId) {
        let now = self.now();
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        if e.child.is_some() {
            // Pinned until the rerecording resolves.
            self.timers.disarm(Slot::Entry(id));
            return;
        }
        let config = self.config_of(e);
        let retention = e.retention.resolve(config.retention);
        let removal = e.removal.resolve(config.removal);
        let rerecord_errors = config.rerecord_errors;
        let has_files = !e.files.is_empty() && !e.file_removed;
        match retention::plan(now, e.stop, retention, removal, has_files) {
            Plan::RemoveFilesAt(t) => {
                self.retention_arm(id, Action::RemoveFiles, t, rerecord_errors)
            }
            Plan::RemoveFilesNow => self.on_remove_files(id),
            Plan::ExpireAt(t) => self.retention_arm(id, Action::Expire, t, rerecord_errors),
            Plan::Keep => self.timers.disarm(Slot::Entry(id)),
        }
    }

    /// Arms a retention timer. While rerecording is enabled, far-off timers are replaced by
    /// an hourly rerecord check.
    fn retention_arm(&mut self, id: EntryId, action: Action, when: Time, rerecord_errors: u32) {
        let now = self.now();
        if rerecord_errors > 0 && when - now > HOUR {
            self.timers.arm(Slot::Entry(id), Action::Rerecord, now + HOUR);
        } else {
            self.timers.arm(Slot::Entry(id), action, when);
        }
    }

    pub(crate) fn on_remove_files(&mut self, id: EntryId) {
        self.remove_files(id);
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let retention = e.retention.resolve(self.config_of(e).retention);
        if retention == Retention::OnRemove {
            self.defer_destroy(id);
        } else {
            self.retention_timer(id);
        }
    }

    /// Deletes the entry's files from disk, keeping the entry.
    pub(crate) fn remove_files(&mut self, id: EntryId) {
        let Some(e) = self.entries.get_mut(&id) else {
            return;
        };
        if e.file_removed || e.files.is_empty() {
            return;
        }
        for f in &e.files {
            match std::fs::remove_file(&f.filename) {
                Ok(()) => info!(%id, file = %f.filename.display(), "removed recording file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    %id,
                    file = %f.filename.display(),
                    %err,
                    "unable to remove recording file"
                ),
            }
        }
        e.file_removed = true;
        self.changed(id);
    }

    /// Cancels the entry. A scheduled entry is destroyed; a recording one is stopped and kept;
    /// a finished one is left alone.
    ///
    /// If this entry is a rerecording, `rerecord` says whether its parent may look for
    /// another opportunity.
    pub fn cancel(&mut self, id: EntryId, rerecord: bool) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let parent = e.parent;
        let state = e.sched_state;
        match state {
            SchedState::Recording => self.abort_recording(id),
            SchedState::Scheduled | SchedState::NoState => self.destroy(id),
            SchedState::Completed | SchedState::MissedTime => {}
        }
        self.resolve_parent(parent, rerecord);
    }

    /// Cancels the entry and deletes it along with its files.
    pub fn cancel_delete(&mut self, id: EntryId, rerecord: bool) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let parent = e.parent;
        let state = e.sched_state;
        match state {
            SchedState::Recording => {
                self.abort_recording(id);
                self.remove_files(id);
            }
            SchedState::Completed | SchedState::MissedTime => self.remove_files(id),
            SchedState::Scheduled | SchedState::NoState => {}
        }
        self.destroy(id);
        self.resolve_parent(parent, rerecord);
    }

    /// Cancels the entry and deletes its files, keeping the entry unless its retention is
    /// [`Retention::OnRemove`].
    pub fn cancel_remove(&mut self, id: EntryId, rerecord: bool) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let parent = e.parent;
        let state = e.sched_state;
        match state {
            SchedState::Recording | SchedState::Completed | SchedState::MissedTime => {
                if state == SchedState::Recording {
                    self.abort_recording(id);
                }
                self.remove_files(id);
                let on_remove = self.entries.get(&id).is_some_and(|e| {
                    e.retention.resolve(self.config_of(e).retention) == Retention::OnRemove
                });
                if on_remove {
                    self.destroy(id);
                }
            }
            SchedState::Scheduled | SchedState::NoState => self.destroy(id),
        }
        self.resolve_parent(parent, rerecord);
    }

    /// After a rerecording is cancelled, either lets its parent try again or stops it from
    /// rerecording at all.
    fn resolve_parent(&mut self, parent: Option<EntryId>, rerecord: bool) {
        let Some(p) = parent else {
            return;
        };
        if rerecord {
            if !self.rerecord(p) {
                self.retention_timer(p);
            }
        } else if let Some(e) = self.entries.get_mut(&p) {
            if !e.dont_rerecord {
                e.dont_rerecord = true;
                self.changed(p);
            }
            self.retention_timer(p);
        }
    }

    /// Links `child` as the rerecording of `parent`, or clears `parent`'s child with `None`.
    pub(crate) fn change_parent_child(&mut self, parent: EntryId, child: Option<EntryId>) {
        let old = self.entries.get(&parent).and_then(|e| e.child);
        if old == child {
            return;
        }
        if let Some(old) = old {
            if let Some(c) = self.entries.get_mut(&old) {
                c.parent = None;
                self.changed(old);
            }
        }
        if let Some(c) = child {
            let prev_parent = self.entries.get(&c).and_then(|e| e.parent);
            if let Some(pp) = prev_parent.filter(|pp| *pp != parent) {
                if let Some(pe) = self.entries.get_mut(&pp) {
                    pe.child = None;
                    self.changed(pp);
                }
            }
            if let Some(ce) = self.entries.get_mut(&c) {
                ce.parent = Some(parent);
                self.changed(c);
            }
        }
        if let Some(p) = self.entries.get_mut(&parent) {
            p.child = child;
            self.changed(parent);
        }
    }

    /// Removes the entry from the registry immediately.
    pub(crate) fn destroy(&mut self, id: EntryId) {
        if !self.entries.contains_key(&id) {
            return;
        }
        self.rec_unsubscribe(id);
        if let Some(p) = self.entries.get(&id).and_then(|e| e.parent) {
            self.change_parent_child(p, None);
        }
        if let Some(c) = self.entries.get(&id).and_then(|e| e.child) {
            if let Some(ce) = self.entries.get_mut(&c) {
                ce.parent = None;
                self.changed(c);
            }
        }
        self.timers.disarm(Slot::Entry(id));
        self.timers.disarm(Slot::Destroy(id));
        let Some(e) = self.entries.remove(&id) else {
            return;
        };
        info!(%id, title = e.title_str(), "destroying entry");
        self.delete_doc(&store::key(store::ENTRY_PREFIX, id));
        self.notifier.send(Event::EntryDeleted(id));
        if let Some(b) = e.broadcast {
            self.queue_epg_notify(b);
        }
    }

    /// Destroys the entry from a zero-delay timer, after the current caller unwinds.
    pub(crate) fn defer_destroy(&mut self, id: EntryId) {
        if !self.entries.contains_key(&id) {
            return;
        }
        self.timers.disarm(Slot::Entry(id));
        let now = self.now();
        self.timers.arm(Slot::Destroy(id), Action::Destroy, now);
    }

    /// Applies a user's edit.
    ///
    /// Scheduled entries accept any change. Once recording has begun only the stop time
    /// (clamped to now and the start), the padding, retention, removal, playback state and
    /// comment may change, plus the titles of entries which have a recording.
    pub fn update(&mut self, id: EntryId, c: EntryChange) -> Result<(), Error> {
        let now = self.now();
        let Some(e) = self.entries.get(&id) else {
            bail!(NotFound, msg("no entry {id}"));
        };
        let state = e.sched_state;
        let channel_name = match c.channel {
            Some(ch) => match self.channels.get(&ch) {
                Some(ch) => Some(ch.name.clone()),
                None => bail!(NotFound, msg("invalid channel")),
            },
            None => None,
        };
        let config = c.config.map(|cid| self.resolve_config_id(Some(cid)));
        let Some(e) = self.entries.get_mut(&id) else {
            bail!(NotFound, msg("no entry {id}"));
        };
        let mut unlinked = None;
        match state {
            SchedState::Scheduled | SchedState::NoState => {
                let start = c.start.unwrap_or(e.start);
                let stop = c.stop.unwrap_or(e.stop);
                if start >= stop {
                    bail!(InvalidArgument, msg("invalid times"));
                }
                let moved = start != e.start
                    || stop != e.stop
                    || (c.channel.is_some() && c.channel != e.channel);
                if moved {
                    unlinked = e.broadcast.take();
                    e.segment_stop_extra = None;
                }
                e.start = start;
                e.stop = stop;
                if let (Some(ch), Some(name)) = (c.channel, channel_name) {
                    e.channel = Some(ch);
                    e.channel_name = name;
                }
                if let Some(config) = config {
                    e.config = config;
                }
                if let Some(v) = c.enabled {
                    e.enabled = v;
                }
                if let Some(v) = c.title {
                    e.title = v;
                }
                if let Some(v) = c.subtitle {
                    e.subtitle = v;
                }
                if let Some(v) = c.description {
                    e.description = v;
                }
                if let Some(v) = c.episode {
                    e.episode = v;
                }
                if let Some(v) = c.content_type {
                    e.content_type = v;
                }
                if let Some(v) = c.priority {
                    e.priority = v;
                }
            }
            SchedState::Recording | SchedState::Completed | SchedState::MissedTime => {
                if let Some(stop) = c.stop {
                    e.stop = stop.max(now).max(e.start);
                }
                if state != SchedState::MissedTime {
                    if let Some(v) = c.title {
                        e.title = v;
                    }
                    if let Some(v) = c.subtitle {
                        e.subtitle = v;
                    }
                }
                if state == SchedState::Recording {
                    if let Some(v) = c.enabled {
                        e.enabled = v;
                    }
                }
            }
        }
        if let Some(v) = c.start_extra {
            e.start_extra = v;
        }
        if let Some(v) = c.stop_extra {
            e.stop_extra = v;
        }
        if let Some(v) = c.retention {
            e.retention = v;
        }
        if let Some(v) = c.removal {
            e.removal = v;
        }
        if let Some(v) = c.comment {
            e.comment = v;
        }
        if let Some(v) = c.play_count {
            e.play_count = v;
        }
        if let Some(v) = c.play_pos {
            e.play_pos = v;
        }
        debug!(%id, "updated entry");
        self.changed(id);
        if let Some(b) = unlinked {
            self.queue_epg_notify(b);
        }
        if state.is_finished() {
            self.retention_timer(id);
        } else {
            self.set_timer(id);
        }
        Ok(())
    }

    /// Copies an entry which is recording, moving its pipeline to the copy. Used when the
    /// source changes in a way the container can't follow.
    pub(crate) fn clone_recording(&mut self, old: EntryId) -> Option<EntryId> {
        let mut n = self.entries.get(&old)?.clone();
        let r = self.recordings.remove(&old)?;
        let id = EntryId::generate();
        n.id = id;
        n.seq = self.next_seq;
        self.next_seq += 1;
        n.created = self.now();
        n.files.clear();
        n.errors = 0;
        n.data_errors = 0;
        n.last_error = StreamCode::Ok;
        n.rec_state = RecState::Pending;
        n.parent = None;
        n.child = None;
        n.dont_reschedule = false;
        n.file_removed = false;
        if let Some(e) = self.entries.get_mut(&old) {
            e.data_errors = e.data_errors.saturating_add(r.take_data_errors());
        }
        info!(%old, new = %id, "continuing recording as a new entry");
        r.retarget(id);
        self.entries.insert(id, n);
        self.recordings.insert(id, r);
        self.save_entry(id);
        self.notifier.send(Event::EntryAdded(id));
        self.stop_recording(old, StreamCode::InvalidTarget, true);
        self.set_timer(id);
        Some(id)
    }

    // Guide changes.

    /// The guide replaced broadcast `old` with `new`.
    ///
    /// Scheduled entries follow the replacement if it's close enough; autorec spawns are
    /// dropped and the rules re-run against the new broadcast.
    pub fn on_broadcast_replaced(&mut self, old: BroadcastId, new: &Broadcast) {
        if old == new.id {
            return;
        }
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.broadcast == Some(old) && e.sched_state == SchedState::Scheduled)
            .map(|e| e.id)
            .collect();
        for id in ids {
            let Some(e) = self.entries.get(&id) else {
                continue;
            };
            if e.autorec.is_some() {
                debug!(%id, "broadcast replaced; dropping autorec spawn");
                self.destroy(id);
                continue;
            }
            let adopt = e.channel == Some(new.channel)
                && Self::fuzzy_match(e, new, new.dvb_eid, UPDATE_WINDOW);
            let Some(e) = self.entries.get_mut(&id) else {
                continue;
            };
            if adopt {
                e.broadcast = Some(new.id);
                e.start = new.start;
                e.stop = new.stop;
                e.dvb_eid = new.dvb_eid;
                e.segment_stop_extra = None;
            } else {
                e.broadcast = None;
            }
            self.changed(id);
            self.set_timer(id);
        }
        self.autorec_check_event(new);
    }

    /// The guide dropped a broadcast. Linked entries forget it; scheduled autorec spawns go.
    pub fn on_broadcast_removed(&mut self, b: BroadcastId) {
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.broadcast == Some(b))
            .map(|e| e.id)
            .collect();
        for id in ids {
            let Some(e) = self.entries.get_mut(&id) else {
                continue;
            };
            if e.autorec.is_some() && e.sched_state == SchedState::Scheduled {
                self.destroy(id);
                continue;
            }
            e.broadcast = None;
            e.segment_stop_extra = None;
            self.changed(id);
        }
    }

    /// The guide changed a broadcast's details. Linked entries take the new times and
    /// descriptions; autorec rules get a chance at it.
    pub fn on_broadcast_updated(&mut self, b: &Broadcast) {
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.broadcast == Some(b.id))
            .map(|e| e.id)
            .collect();
        for id in ids {
            let Some(e) = self.entries.get_mut(&id) else {
                continue;
            };
            e.segment_stop_extra = None;
            match e.sched_state {
                SchedState::Scheduled | SchedState::NoState => {
                    if b.start >= b.stop {
                        continue;
                    }
                    e.start = b.start;
                    e.stop = b.stop;
                    e.title = b.title.clone();
                    e.subtitle = b.subtitle.clone();
                    e.summary = b.summary.clone();
                    e.description = b.description.clone();
                    e.episode = b.episode.to_string();
                    e.episode_uri = b.episode_uri.clone();
                    e.dvb_eid = b.dvb_eid;
                }
                SchedState::Recording => {
                    if b.stop > e.start {
                        e.stop = b.stop;
                    }
                }
                SchedState::Completed | SchedState::MissedTime => continue,
            }
            self.changed(id);
            self.set_timer(id);
        }
        self.autorec_check_event(b);
    }

    /// The broadcaster signalled that `b` started, stopped or paused.
    ///
    /// Only signals from the stream's own event information for broadcasts with an event
    /// id are trusted.
    pub fn on_running_changed(&mut self, b: &Broadcast, source: EpgSource, state: RunningState) {
        if source != EpgSource::Eit || b.dvb_eid == 0 {
            return;
        }
        let now = self.now();
        let Some(id) = self
            .entries
            .values()
            .filter(|e| e.broadcast == Some(b.id))
            .min_by_key(|e| (e.sched_state.is_finished(), e.seq))
            .map(|e| e.id)
        else {
            return;
        };
        debug!(%id, broadcast = %b.id, ?state, "running state");
        match state {
            RunningState::Now => {
                let others: Vec<EntryId> = self
                    .entries
                    .values()
                    .filter(|e| e.id != id && e.channel == Some(b.channel) && e.epg_says_running())
                    .map(|e| e.id)
                    .collect();
                for o in others {
                    if let Some(e) = self.entries.get_mut(&o) {
                        e.running_stop = Some(now);
                    }
                    self.rec_running_changed(o, RunningState::Stop);
                }
                let Some(e) = self.entries.get_mut(&id) else {
                    return;
                };
                e.running_start = Some(now);
                e.running_pause = None;
                let scheduled = e.sched_state == SchedState::Scheduled;
                self.rec_running_changed(id, RunningState::Now);
                if scheduled && self.start_time(id, true).is_some_and(|t| t > now) {
                    info!(%id, "broadcast started early; starting now");
                    self.timers.arm(Slot::Entry(id), Action::StartRecording, now);
                }
            }
            RunningState::Stop => {
                let Some(e) = self.entries.get_mut(&id) else {
                    return;
                };
                e.running_stop = Some(now);
                e.running_pause = None;
                let stop = e.sched_state == SchedState::Recording && e.running_start.is_some();
                self.rec_running_changed(id, RunningState::Stop);
                if stop {
                    if let Some(e) = self.entries.get_mut(&id) {
                        e.dont_reschedule = true;
                    }
                    self.stop_recording(id, StreamCode::Ok, false);
                }
            }
            RunningState::Pause => {
                if let Some(e) = self.entries.get_mut(&id) {
                    e.running_pause = Some(now);
                }
                self.rec_running_changed(id, RunningState::Pause);
            }
            RunningState::NotSet => return,
        }
        self.notifier.send(Event::EntryChanged(id));
    }
}

#[cfg(test)]
mod tests {
    use crate::epg::{EpgSource, RunningState};
    use crate::notify::Event;
    use crate::retention::{Removal, Retention};
    use crate::testutil::{self, TestDvr, T0};
    use crate::timer::{Action, Slot};
    use crate::{EntryId, NewEntry, RecState, SchedState, StreamCode};
    use base::time::{Duration, DAY, HOUR, MINUTE};

    #[test]
    fn schedules_at_padded_warm_start() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let mut n = NewEntry::new(testutil::CH1, T0 + Duration(1000), T0 + Duration(2000), "x");
        n.start_extra = 5 * MINUTE;
        let id = l.create(n).unwrap().unwrap();
        assert_eq!(l.entry(id).unwrap().sched_state, SchedState::Scheduled);

        // 1000 - 300 pre - 30 warm.
        assert_eq!(l.start_time(id, true), Some(T0 + Duration(670)));
        assert_eq!(l.start_time(id, false), Some(T0 + Duration(700)));
        assert_eq!(l.stop_time(id), Some(T0 + Duration(2000)));
        assert_eq!(
            l.timers.get(Slot::Entry(id)),
            Some((T0 + Duration(670), Action::StartRecording))
        );
    }

    #[test]
    fn set_timer_is_idempotent() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let id = l
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "x"))
            .unwrap()
            .unwrap();
        let before = (l.entry(id).unwrap().sched_state, l.timers.get(Slot::Entry(id)));
        let events = t.events.lock().len();
        l.set_timer(id);
        l.set_timer(id);
        assert_eq!(
            (l.entry(id).unwrap().sched_state, l.timers.get(Slot::Entry(id))),
            before
        );
        assert_eq!(t.events.lock().len(), events);
    }

    #[test]
    fn missed_when_created_in_the_past() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let id = l
            .create(NewEntry::new(testutil::CH1, T0 - 2 * HOUR, T0 - HOUR, "old"))
            .unwrap()
            .unwrap();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::MissedTime);
        assert_eq!(e.status(), "Time missed");

        // Default config keeps the log 31 days after the stop.
        assert_eq!(
            l.timers.get(Slot::Entry(id)),
            Some((T0 - HOUR + 31 * DAY, Action::Expire))
        );
    }

    #[test]
    fn disabled_channel_means_no_state() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let mut ch = l.channel(testutil::CH1).unwrap().clone();
        ch.enabled = false;
        l.upsert_channel(ch);
        let id = l
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "x"))
            .unwrap()
            .unwrap();
        assert_eq!(l.entry(id).unwrap().sched_state, SchedState::NoState);
        assert_eq!(l.entry(id).unwrap().status(), "Invalid");
        assert_eq!(l.timers.get(Slot::Entry(id)), None);
    }

    #[test]
    fn cancel_scheduled_destroys() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let id = l
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "x"))
            .unwrap()
            .unwrap();
        l.cancel(id, false);
        assert!(l.entry(id).is_none());
        assert!(t.events.lock().contains(&Event::EntryDeleted(id)));
        assert_eq!(l.timers.get(Slot::Entry(id)), None);
        assert_eq!(t.store.len(), 1); // just the default config
    }

    #[test]
    fn full_recording() {
        testutil::init();
        let t = TestDvr::new();
        let id = {
            let mut l = t.db.lock();
            l.create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show"))
                .unwrap()
                .unwrap()
        };
        t.advance_to(T0 + HOUR);
        assert_eq!(t.db.lock().entry(id).unwrap().sched_state, SchedState::Recording);
        let sub = t.subscriber.last().unwrap();
        assert_eq!(sub.channel, testutil::CH1);
        assert_eq!(sub.weight, 300);

        sub.queue.deliver(testutil::start_msg());
        for dts in [5000, 5040, 5080] {
            sub.queue.deliver(testutil::video_packet(dts, b"abcd"));
        }
        t.wait_for(id, |e| e.rec_state == RecState::Running && e.files.len() == 1);
        testutil::wait_until(|| t.muxers.written_dts().len() == 3);

        t.advance_to(T0 + 2 * HOUR);
        t.join_workers();
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::Ok);
        assert_eq!(e.status(), "Completed OK");
        assert_eq!(e.files[0].size, 12);
        assert_eq!(e.files[0].filename, t.storage().join("Show.ts"));
        assert!(sub.unsubscribed());
        assert_eq!(t.muxers.written_dts(), vec![0, 40, 80]);
    }

    #[test]
    fn no_data_means_missed() {
        testutil::init();
        let t = TestDvr::new();
        let id = t
            .db
            .lock()
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + 2 * HOUR);
        t.join_workers();
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::MissedTime);
        assert!(e.dont_reschedule);
    }

    #[test]
    fn access_denied_completes_with_error() {
        testutil::init();
        let t = TestDvr::new();
        t.access.deny("mallory");
        let mut n = NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show");
        n.owner = "mallory".to_owned();
        let id = t.db.lock().create(n).unwrap().unwrap();
        t.advance_to(T0 + HOUR);
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::UserAccess);
        assert_eq!(e.errors, 1);
        assert_eq!(e.status(), "File not created");
        assert!(t.subscriber.last().is_none());
    }

    #[test]
    fn subscribe_failure_is_bad_source() {
        testutil::init();
        let t = TestDvr::new();
        t.subscriber.fail_next();
        let id = t
            .db
            .lock()
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + HOUR);
        let l = t.db.lock();
        assert_eq!(l.entry(id).unwrap().last_error, StreamCode::BadSource);
        assert_eq!(l.entry(id).unwrap().sched_state, SchedState::Completed);
    }

    #[test]
    fn cancel_recording_aborts() {
        testutil::init();
        let t = TestDvr::new();
        let id = t
            .db
            .lock()
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + HOUR);
        let sub = t.subscriber.last().unwrap();
        sub.queue.deliver(testutil::start_msg());
        sub.queue.deliver(testutil::video_packet(0, b"abcd"));
        t.wait_for(id, |e| e.rec_state == RecState::Running);
        t.db.lock().cancel(id, false);
        t.join_workers();
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::Aborted);
        assert!(sub.unsubscribed());
    }

    #[test]
    fn aborted_recordings_are_not_rerecorded() {
        testutil::init();
        let t = TestDvr::new();
        {
            let mut l = t.db.lock();
            let cid = l.default_config_id();
            let mut c = l.config(cid).unwrap().clone();
            c.rerecord_errors = 100;
            l.update_config(cid, c).unwrap();
        }
        let film = t.epg.add(testutil::broadcast(
            1,
            testutil::CH1,
            T0 + HOUR,
            T0 + 2 * HOUR,
            "Film",
        ));
        t.epg.add(testutil::broadcast(
            2,
            testutil::CH1,
            T0 + DAY,
            T0 + DAY + HOUR,
            "Film",
        ));
        let play = t.epg.add(testutil::broadcast(
            3,
            testutil::CH2,
            T0 + HOUR,
            T0 + 2 * HOUR,
            "Play",
        ));
        t.epg.add(testutil::broadcast(
            4,
            testutil::CH2,
            T0 + DAY,
            T0 + DAY + HOUR,
            "Play",
        ));
        let (deleted, kept) = {
            let mut l = t.db.lock();
            (
                l.create(NewEntry::from_broadcast(&film)).unwrap().unwrap(),
                l.create(NewEntry::from_broadcast(&play)).unwrap().unwrap(),
            )
        };
        t.advance_to(T0 + HOUR);
        t.wait_for(deleted, |e| e.sched_state == SchedState::Recording);
        t.wait_for(kept, |e| e.sched_state == SchedState::Recording);
        {
            let mut l = t.db.lock();
            l.cancel_delete(deleted, false);
            l.cancel(kept, false);
        }
        t.join_workers();
        {
            let l = t.db.lock();
            assert!(l.entry(deleted).is_none());
            let e = l.entry(kept).unwrap();
            assert_eq!(e.last_error, StreamCode::Aborted);
            assert_eq!(e.child, None);
            assert!(e.dont_rerecord);
            assert_eq!(l.entries().count(), 1);
        }

        // Nor by the periodic rerecord check.
        t.advance_to(T0 + 4 * HOUR);
        let l = t.db.lock();
        assert_eq!(l.entry(kept).unwrap().child, None);
        assert_eq!(l.entries().count(), 1);
    }

    #[test]
    fn retention_removes_files_then_expires() {
        testutil::init();
        let t = TestDvr::new();
        let id = {
            let mut l = t.db.lock();
            let mut n = NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show");
            n.retention = Retention::Days(3);
            n.removal = Removal::Days(1);
            l.create(n).unwrap().unwrap()
        };
        t.advance_to(T0 + HOUR);
        let sub = t.subscriber.last().unwrap();
        sub.queue.deliver(testutil::start_msg());
        sub.queue.deliver(testutil::video_packet(0, b"abcd"));
        t.wait_for(id, |e| e.rec_state == RecState::Running);
        t.advance_to(T0 + 2 * HOUR);
        t.join_workers();
        let path = {
            let l = t.db.lock();
            let e = l.entry(id).unwrap();
            assert_eq!(
                l.timers.get(Slot::Entry(id)),
                Some((T0 + 2 * HOUR + DAY, Action::RemoveFiles))
            );
            e.files[0].filename.clone()
        };
        assert!(path.exists());
        t.advance_to(T0 + 2 * HOUR + DAY);
        assert!(!path.exists());
        {
            let l = t.db.lock();
            assert!(l.entry(id).unwrap().file_removed);
            assert_eq!(
                l.timers.get(Slot::Entry(id)),
                Some((T0 + 2 * HOUR + 3 * DAY, Action::Expire))
            );
        }
        t.advance_to(T0 + 2 * HOUR + 3 * DAY);
        assert!(t.db.lock().entry(id).is_none());
    }

    #[test]
    fn on_remove_retention_destroys_with_files() {
        testutil::init();
        let t = TestDvr::new();
        let mut l = t.db.lock();
        let mut n = NewEntry::new(testutil::CH1, T0 - 2 * HOUR, T0 - HOUR, "old");
        n.retention = Retention::OnRemove;
        let id = l.create(n).unwrap().unwrap();
        assert_eq!(l.timers.get(Slot::Entry(id)), None);
        l.cancel_remove(id, false);
        assert!(l.entry(id).is_none());
    }

    #[test]
    fn update_scheduled_unlinks_broadcast() {
        testutil::init();
        let t = TestDvr::new();
        let b = t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        let mut l = t.db.lock();
        let id = l.create(NewEntry::from_broadcast(&b)).unwrap().unwrap();
        l.update(
            id,
            crate::entry::EntryChange {
                start: Some(T0 + 90 * MINUTE),
                ..Default::default()
            },
        )
        .unwrap();
        let e = l.entry(id).unwrap();
        assert_eq!(e.broadcast, None);
        assert_eq!(e.start, T0 + 90 * MINUTE);
        let bad = l.update(
            id,
            crate::entry::EntryChange {
                stop: Some(T0),
                ..Default::default()
            },
        );
        assert_eq!(bad.unwrap_err().kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn update_recording_clamps_stop() {
        testutil::init();
        let t = TestDvr::new();
        let id = t
            .db
            .lock()
            .create(NewEntry::new(testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Show"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + HOUR + 10 * MINUTE);
        let mut l = t.db.lock();
        l.update(
            id,
            crate::entry::EntryChange {
                stop: Some(T0 + 3 * HOUR),
                start: Some(T0),
                ..Default::default()
            },
        )
        .unwrap();
        let e = l.entry(id).unwrap();
        assert_eq!(e.stop, T0 + 3 * HOUR);
        assert_eq!(e.start, T0 + HOUR); // start is fixed once recording
        assert_eq!(
            l.timers.get(Slot::Entry(id)),
            Some((T0 + 3 * HOUR, Action::StopRecording))
        );
    }

    #[test]
    fn segments_extend_stop() {
        testutil::init();
        let t = TestDvr::new();
        let mut first = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Film");
        first.segment_link = Some("film".to_owned());
        let mut news = testutil::broadcast(
            2,
            testutil::CH1,
            T0 + 2 * HOUR,
            T0 + 2 * HOUR + 10 * MINUTE,
            "News",
        );
        news.segment_link = None;
        let mut second = testutil::broadcast(
            3,
            testutil::CH1,
            T0 + 2 * HOUR + 10 * MINUTE,
            T0 + 3 * HOUR,
            "Film",
        );
        second.segment_link = Some("film".to_owned());
        t.epg.add(first.clone());
        t.epg.add(news);
        t.epg.add(second);
        let mut l = t.db.lock();
        let id = l.create(NewEntry::from_broadcast(&first)).unwrap().unwrap();
        assert_eq!(l.stop_time(id), Some(T0 + 3 * HOUR));
    }

    #[test]
    fn running_stop_ends_recording() {
        testutil::init();
        let t = TestDvr::new();
        let mut b = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Live");
        b.dvb_eid = 42;
        t.epg.add(b.clone());
        let id = t.db.lock().create(NewEntry::from_broadcast(&b)).unwrap().unwrap();
        t.advance_to(T0 + HOUR);
        let sub = t.subscriber.last().unwrap();
        sub.queue.deliver(testutil::start_msg());
        sub.queue.deliver(testutil::video_packet(0, b"abcd"));
        t.wait_for(id, |e| e.rec_state == RecState::Running);
        {
            let mut l = t.db.lock();
            l.on_running_changed(&b, EpgSource::Eit, RunningState::Now);
            // Untrusted sources are ignored.
            l.on_running_changed(&b, EpgSource::Other, RunningState::Stop);
            assert_eq!(l.entry(id).unwrap().sched_state, SchedState::Recording);
        }
        t.advance_to(T0 + 2 * HOUR);
        {
            // The guide says it's still on; the stop is deferred.
            let l = t.db.lock();
            assert_eq!(l.entry(id).unwrap().sched_state, SchedState::Recording);
        }
        t.advance(Duration(5));
        t.db.lock().on_running_changed(&b, EpgSource::Eit, RunningState::Stop);
        t.join_workers();
        let l = t.db.lock();
        let e = l.entry(id).unwrap();
        assert_eq!(e.sched_state, SchedState::Completed);
        assert_eq!(e.last_error, StreamCode::Ok);
    }

    #[test]
    fn running_now_starts_early() {
        testutil::init();
        let t = TestDvr::new();
        let mut b = testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Early");
        b.dvb_eid = 7;
        t.epg.add(b.clone());
        let id = t.db.lock().create(NewEntry::from_broadcast(&b)).unwrap().unwrap();
        t.advance(10 * MINUTE);
        t.db.lock().on_running_changed(&b, EpgSource::Eit, RunningState::Now);
        t.advance(Duration(1));
        assert_eq!(t.db.lock().entry(id).unwrap().sched_state, SchedState::Recording);
    }

    #[test]
    fn broadcast_replacement() {
        testutil::init();
        let t = TestDvr::new();
        let b = t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        let mut l = t.db.lock();
        let id = l.create(NewEntry::from_broadcast(&b)).unwrap().unwrap();

        // Slightly moved: adopted.
        let moved = testutil::broadcast(
            2,
            testutil::CH1,
            T0 + HOUR + 5 * MINUTE,
            T0 + 2 * HOUR + 5 * MINUTE,
            "News",
        );
        l.on_broadcast_replaced(b.id, &moved);
        let e = l.entry(id).unwrap();
        assert_eq!(e.broadcast, Some(moved.id));
        assert_eq!(e.start, T0 + HOUR + 5 * MINUTE);

        // Something else entirely: unlinked.
        let other = testutil::broadcast(3, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "Sport");
        l.on_broadcast_replaced(moved.id, &other);
        assert_eq!(l.entry(id).unwrap().broadcast, None);
        assert_eq!(l.entry(id).unwrap().start, T0 + HOUR + 5 * MINUTE);
    }

    #[test]
    fn epg_notifications_coalesce() {
        testutil::init();
        let t = TestDvr::new();
        let b = t.epg.add(testutil::broadcast(1, testutil::CH1, T0 + HOUR, T0 + 2 * HOUR, "News"));
        let id: EntryId = t.db.lock().create(NewEntry::from_broadcast(&b)).unwrap().unwrap();
        t.advance(Duration(1));
        let n = t
            .events
            .lock()
            .iter()
            .filter(|e| **e == Event::EpgUpdated(b.id))
            .count();
        assert_eq!(n, 1);
        t.db.lock().cancel(id, false);
        t.advance(Duration(1));
        let n = t
            .events
            .lock()
            .iter()
            .filter(|e| **e == Event::EpgUpdated(b.id))
            .count();
        assert_eq!(n, 2);
    }
}
