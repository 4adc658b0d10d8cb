// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording pipeline: one worker thread per active recording.
//!
//! A worker drains its [`StreamingQueue`] and writes packets through a [`Muxer`] without
//! holding the database lock. It takes the lock only to open or close a file, to report a
//! state change or error, and to move the recording to a clone. The scheduler stops a worker
//! by setting its exit flag and queueing [`StreamMessage::Exit`]; the worker checks the flag
//! each time it acquires the lock, so it never acts on an entry it no longer owns.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use base::clock::Clocks;
use base::strutil::clean_path_component;
use base::{Error, Mutex};
use tracing::{debug, info, warn};

use crate::db::{Host, LockedDatabase};
use crate::entry::{EntryId, FileRecord, RecState, SchedState};
use crate::epg::RunningState;
use crate::mux::Muxer;
use crate::streaming::{
    Packet, StreamCode, StreamMessage, StreamStart, StreamingQueue, Subscription,
};

/// Packets held while waiting for the broadcaster's running flag.
const MAX_BACKLOG: usize = 4096;

/// How long to wait for the running flag before recording anyway.
const EPG_WAIT: std::time::Duration = std::time::Duration::from_secs(2);

const RUNNING_NOT_SET: u8 = 0;
const RUNNING_NOW: u8 = 1;
const RUNNING_STOP: u8 = 2;
const RUNNING_PAUSE: u8 = 3;

/// State shared between a recording's worker and the scheduler.
struct Shared {
    /// The entry being recorded. Changes when the recording is moved to a clone.
    entry: Mutex<EntryId>,
    exit: AtomicBool,

    /// Data errors not yet added to the entry.
    data_errors: AtomicU32,

    /// Bytes written to the current file.
    bytes: AtomicU64,

    /// True while the worker has a file open.
    file_open: AtomicBool,
    running: AtomicU8,
}

/// An active recording pipeline, owned by the database.
pub struct Recording {
    shared: Arc<Shared>,
    queue: Arc<StreamingQueue>,
    subscription: Option<Box<dyn Subscription>>,
    join: Option<thread::JoinHandle<()>>,
}

impl Recording {
    /// Returns the data errors seen since the last call, resetting the file's byte count.
    pub(crate) fn take_data_errors(&self) -> u32 {
        self.shared.bytes.store(0, Ordering::SeqCst);
        self.shared.data_errors.swap(0, Ordering::SeqCst)
    }

    /// Points the worker at a different entry.
    pub(crate) fn retarget(&self, id: EntryId) {
        *self.shared.entry.lock() = id;
    }
}

impl LockedDatabase {
    /// Subscribes to the entry's channel and starts its worker.
    pub(crate) fn rec_subscribe(&mut self, id: EntryId) -> Result<(), StreamCode> {
        let e = self.entries.get(&id).ok_or(StreamCode::UndefinedError)?;
        let access = self
            .collab
            .access
            .lookup(&e.owner)
            .ok_or(StreamCode::UserAccess)?;
        let active = self
            .recordings
            .keys()
            .filter(|r| self.entries.get(r).is_some_and(|o| o.owner == e.owner))
            .count();
        access.check_recording(u32::try_from(active).unwrap_or(u32::MAX))?;
        let channel = e
            .channel
            .and_then(|c| self.channels.get(&c))
            .ok_or(StreamCode::SourceDeleted)?;
        let config = self.config_of(e);
        let weight = e.priority.resolve(config.priority).weight();
        let queue = StreamingQueue::new();
        let subscription = self
            .collab
            .subscriber
            .subscribe(channel, weight, &config.profile, queue.clone())
            .map_err(|err| {
                warn!(%id, err = %err.chain(), "subscription failed");
                StreamCode::BadSource
            })?;
        let shared = Arc::new(Shared {
            entry: Mutex::new(id),
            exit: AtomicBool::new(false),
            data_errors: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            file_open: AtomicBool::new(false),
            running: AtomicU8::new(RUNNING_NOT_SET),
        });
        let worker = Worker {
            host: self.host.clone(),
            clocks: self.clocks.clone(),
            shared: shared.clone(),
            queue: queue.clone(),
            muxer: self.collab.muxers.create(config.container),
            phase: Phase::Idle,
            open: false,
            start: None,
            reference: None,
            dts_offset: None,
            commercial: false,
            skip_commercials: false,
        };
        let name = format!("rec-{}", clean_path_component(e.title_str()));
        let join = match thread::Builder::new().name(name).spawn(move || worker.run()) {
            Ok(j) => j,
            Err(err) => {
                warn!(%id, %err, "unable to start recording thread");
                subscription.unsubscribe();
                return Err(StreamCode::UndefinedError);
            }
        };
        debug!(%id, weight, "subscribed");
        self.recordings.insert(
            id,
            Recording {
                shared,
                queue,
                subscription: Some(subscription),
                join: Some(join),
            },
        );
        Ok(())
    }

    /// Stops the entry's pipeline, if any, folding its counters into the entry. The worker
    /// is joined once the lock is released.
    pub(crate) fn rec_unsubscribe(&mut self, id: EntryId) {
        let Some(mut r) = self.recordings.remove(&id) else {
            return;
        };
        r.shared.exit.store(true, Ordering::SeqCst);
        if let Some(s) = r.subscription.take() {
            s.unsubscribe();
        }
        r.queue.clear();
        r.queue.deliver(StreamMessage::Exit);
        let now = self.now();
        let data_errors = r.shared.data_errors.swap(0, Ordering::SeqCst);
        let bytes = r.shared.bytes.load(Ordering::SeqCst);
        let file_open = r.shared.file_open.load(Ordering::SeqCst);
        if let Some(e) = self.entries.get_mut(&id) {
            e.data_errors = e.data_errors.saturating_add(data_errors);
            if let Some(f) = e.files.last_mut().filter(|_| file_open) {
                f.size = f.size.max(bytes);
                f.stop = now;
            }
        }
        if let Some(j) = r.join.take() {
            if j.thread().id() == thread::current().id() {
                // A worker stopping its own entry; it exits when it next looks at its flag.
                drop(j);
            } else {
                self.pending_joins.push(j);
            }
        }
        debug!(%id, data_errors, bytes, "unsubscribed");
    }

    /// Stops every pipeline without changing any entry's state. For process shutdown.
    pub fn shutdown(&mut self) {
        let ids: Vec<EntryId> = self.recordings.keys().copied().collect();
        for id in ids {
            self.rec_unsubscribe(id);
            self.save_entry(id);
        }
        info!("recordings stopped");
    }

    /// Passes a change of the broadcaster's running flag to the entry's worker.
    pub(crate) fn rec_running_changed(&mut self, id: EntryId, state: RunningState) {
        if let Some(r) = self.recordings.get(&id) {
            let v = match state {
                RunningState::NotSet => RUNNING_NOT_SET,
                RunningState::Now => RUNNING_NOW,
                RunningState::Stop => RUNNING_STOP,
                RunningState::Pause => RUNNING_PAUSE,
            };
            r.shared.running.store(v, Ordering::SeqCst);
        }
    }

    /// Sets the recording sub-state of an entry which is recording.
    fn rec_set_state(&mut self, id: EntryId, rec: RecState, code: StreamCode) {
        if self
            .entries
            .get(&id)
            .is_some_and(|e| e.sched_state == SchedState::Recording)
        {
            self.set_state(id, SchedState::Recording, rec, code);
        }
    }

    /// Records a stream error, counting it once per distinct code.
    fn rec_error(&mut self, id: EntryId, code: StreamCode) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        if e.last_error != code {
            warn!(%id, %code, "recording error");
            self.rec_set_state(id, RecState::Error, code);
        }
    }

    /// Picks a fresh filename for the entry's next file and records it.
    fn rec_new_file(&mut self, id: EntryId, start: &StreamStart) -> Result<PathBuf, Error> {
        let now = self.now();
        let Some(e) = self.entries.get(&id) else {
            base::bail!(NotFound, msg("no entry {id}"));
        };
        let config = self.config_of(e);
        let dir = config.storage.clone();
        let ext = config.container.extension();
        let base = clean_path_component(e.title_str());
        std::fs::create_dir_all(&dir).map_err(|err| {
            base::err!(
                Unavailable,
                msg("unable to create {}", dir.display()),
                source(err)
            )
        })?;
        let mut path = dir.join(format!("{base}.{ext}"));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{base}-{n}.{ext}"));
            n += 1;
        }
        let Some(e) = self.entries.get_mut(&id) else {
            base::bail!(NotFound, msg("no entry {id}"));
        };
        e.files.push(FileRecord {
            filename: path.clone(),
            size: 0,
            start: now,
            stop: now,
            info: start.summary(),
        });
        info!(%id, file = %path.display(), "recording to file");
        self.changed(id);
        Ok(path)
    }

    fn rec_file_closed(&mut self, id: EntryId, size: u64) {
        let now = self.now();
        if let Some(f) = self.entries.get_mut(&id).and_then(|e| e.files.last_mut()) {
            f.size = size;
            f.stop = now;
        }
        self.changed(id);
    }
}

enum Phase {
    /// No stream yet, or the stream stopped.
    Idle,

    /// Holding packets until the broadcaster says the programme is on.
    AwaitingEpgRunning {
        since: base::clock::Instant,
        backlog: VecDeque<Packet>,
    },
    Muxing,
}

/// The recording was stopped while the worker was waiting for the database lock.
struct Stopped;

struct Worker {
    host: Weak<dyn Host>,
    clocks: Arc<dyn Clocks>,
    shared: Arc<Shared>,
    queue: Arc<StreamingQueue>,
    muxer: Box<dyn Muxer>,
    phase: Phase,

    /// True while the muxer has a file open.
    open: bool,
    start: Option<Arc<StreamStart>>,
    reference: Option<u32>,
    dts_offset: Option<i64>,
    commercial: bool,

    /// Copied from the entry's config at each stream start.
    skip_commercials: bool,
}

impl Worker {
    fn run(mut self) {
        debug!("starting");
        loop {
            let msg = self.queue.next();
            if matches!(msg, StreamMessage::Exit) || self.shared.exit.load(Ordering::SeqCst) {
                break;
            }
            let r = match msg {
                StreamMessage::Packet(pkt) => self.on_packet(pkt),
                msg => self.locked(|w, l, id| w.handle(l, id, msg)),
            };
            if r.is_err() {
                break;
            }
        }
        if self.open {
            // Sizes were already folded in by the unsubscribe.
            if let Err(err) = self.muxer.close() {
                warn!(err = %err.chain(), "unable to close recording file");
            }
        }
        debug!("ending");
    }

    /// The entry currently being recorded, for logging outside the database lock.
    fn id(&self) -> EntryId {
        *self.shared.entry.lock()
    }

    /// Runs `f` under the database lock, unless the recording has been stopped meanwhile.
    fn locked<R>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut LockedDatabase, EntryId) -> R,
    ) -> Result<R, Stopped> {
        let host = self.host.upgrade().ok_or(Stopped)?;
        let mut l = host.lock();
        if self.shared.exit.load(Ordering::SeqCst) {
            return Err(Stopped);
        }
        let id = *self.shared.entry.lock();
        Ok(f(self, &mut l, id))
    }

    fn handle(&mut self, l: &mut LockedDatabase, id: EntryId, msg: StreamMessage) {
        match msg {
            StreamMessage::Start(start) => self.on_start(l, id, start),
            StreamMessage::Stop(code) => self.on_stop(l, id, code),
            StreamMessage::ServiceStatus(status) => {
                if let Some(code) = status.code() {
                    l.rec_error(id, code);
                }
            }
            StreamMessage::NoStart(code) => l.rec_error(id, code),
            StreamMessage::Packet(_) | StreamMessage::Exit => {}
        }
    }

    fn on_start(&mut self, l: &mut LockedDatabase, id: EntryId, start: Arc<StreamStart>) {
        debug!(%id, streams = start.streams.len(), "stream start");
        if self.open {
            match self.muxer.reconfigure(&start) {
                Ok(()) => {
                    self.reference = start.reference_stream();
                    self.start = Some(start);
                    self.phase = Phase::Muxing;
                    return;
                }
                Err(err) => {
                    info!(%id, err = %err.chain(), "stream change not representable in file");
                    self.close(l, id);
                    let clone = l.entries.get(&id).is_some_and(|e| l.config_of(e).clone);
                    if clone {
                        if let Some(new) = l.clone_recording(id) {
                            return self.on_start(l, new, start);
                        }
                    }
                    l.stop_recording(id, StreamCode::InvalidTarget, false);
                    return;
                }
            }
        }
        self.reference = start.reference_stream();
        self.start = Some(start);
        self.dts_offset = None;
        self.commercial = false;
        let Some(e) = l.entries.get(&id) else {
            return;
        };
        let config = l.config_of(e);
        self.skip_commercials = config.skip_commercials;
        let wait_for_epg = config.epg_running
            && e.dvb_eid != 0
            && self.shared.running.load(Ordering::SeqCst) != RUNNING_NOW;
        if wait_for_epg {
            debug!(%id, "waiting for running flag");
            self.phase = Phase::AwaitingEpgRunning {
                since: self.clocks.monotonic(),
                backlog: VecDeque::new(),
            };
            l.rec_set_state(id, RecState::EpgWait, StreamCode::Ok);
        } else {
            self.open_file(l, id);
        }
    }

    fn open_file(&mut self, l: &mut LockedDatabase, id: EntryId) {
        let Some(start) = self.start.clone() else {
            return;
        };
        let result = l
            .rec_new_file(id, &start)
            .and_then(|path| self.muxer.open(&path, &start));
        match result {
            Ok(()) => {
                self.open = true;
                self.shared.bytes.store(0, Ordering::SeqCst);
                self.shared.file_open.store(true, Ordering::SeqCst);
                self.phase = Phase::Muxing;
                l.rec_set_state(id, RecState::WaitProgramStart, StreamCode::Ok);
            }
            Err(err) => {
                warn!(%id, err = %err.chain(), "unable to open recording file");
                self.phase = Phase::Idle;
                l.rec_error(id, StreamCode::InvalidTarget);
            }
        }
    }

    fn close(&mut self, l: &mut LockedDatabase, id: EntryId) {
        if !self.open {
            return;
        }
        self.open = false;
        self.phase = Phase::Idle;
        let size = match self.muxer.close() {
            Ok(s) => s,
            Err(err) => {
                warn!(%id, err = %err.chain(), "unable to close recording file");
                self.shared.bytes.load(Ordering::SeqCst)
            }
        };
        self.shared.bytes.store(0, Ordering::SeqCst);
        self.shared.file_open.store(false, Ordering::SeqCst);
        l.rec_file_closed(id, size);
    }

    /// Handles one packet without the database lock, taking it only to report a change.
    fn on_packet(&mut self, pkt: Packet) -> Result<(), Stopped> {
        if pkt.errors > 0 {
            self.shared.data_errors.fetch_add(pkt.errors, Ordering::SeqCst);
        }
        match &mut self.phase {
            Phase::Idle => Ok(()),
            Phase::AwaitingEpgRunning { since, backlog } => {
                if backlog.len() >= MAX_BACKLOG {
                    backlog.pop_front();
                }
                backlog.push_back(pkt);
                let running = self.shared.running.load(Ordering::SeqCst) == RUNNING_NOW;
                let waited = self.clocks.monotonic().saturating_sub(*since) >= EPG_WAIT;
                if !(running || waited) {
                    return Ok(());
                }
                let backlog = std::mem::take(backlog);
                if !running {
                    info!(id = %self.id(), "no running flag; recording anyway");
                }
                self.locked(|w, l, id| w.open_file(l, id))?;
                for p in backlog {
                    self.mux(p)?;
                }
                Ok(())
            }
            Phase::Muxing => self.mux(pkt),
        }
    }

    fn mux(&mut self, mut pkt: Packet) -> Result<(), Stopped> {
        if !matches!(self.phase, Phase::Muxing) {
            return Ok(());
        }
        let paused = self.shared.running.load(Ordering::SeqCst) == RUNNING_PAUSE;
        let in_break = paused || (self.skip_commercials && pkt.commercial == Some(true));
        if in_break != self.commercial {
            self.commercial = in_break;
            if let Err(err) = self.muxer.add_marker() {
                warn!(id = %self.id(), err = %err.chain(), "unable to add marker");
            }
            if self.dts_offset.is_some() {
                let rec = if in_break {
                    RecState::Commercial
                } else {
                    RecState::Running
                };
                self.locked(|_, l, id| l.rec_set_state(id, rec, StreamCode::Ok))?;
            }
        }
        if in_break {
            return Ok(());
        }

        let Some(dts) = pkt.dts else {
            return Ok(());
        };
        let offset = match self.dts_offset {
            Some(o) => o,
            None if self.reference == Some(pkt.stream) => {
                debug!(dts, "first reference packet");
                self.dts_offset = Some(dts);
                self.locked(|_, l, id| l.rec_set_state(id, RecState::Running, StreamCode::Ok))?;
                dts
            }
            None => return Ok(()),
        };
        if dts < offset || pkt.pts.is_some_and(|p| p < offset) {
            self.shared.data_errors.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        pkt.dts = Some(dts - offset);
        pkt.pts = pkt.pts.map(|p| p - offset);
        let len = pkt.data.len() as u64;
        match self.muxer.write(&pkt) {
            Ok(()) => {
                self.shared.bytes.fetch_add(len, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                warn!(id = %self.id(), err = %err.chain(), "write failed");
                self.locked(|w, l, id| {
                    l.rec_error(id, StreamCode::NoSpace);
                    w.close(l, id);
                })
            }
        }
    }

    fn on_stop(&mut self, l: &mut LockedDatabase, id: EntryId, code: StreamCode) {
        debug!(%id, %code, "stream stop");
        match code {
            StreamCode::Ok => {
                self.close(l, id);
                l.rec_set_state(id, RecState::Finished, code);
            }
            StreamCode::SourceReconfigured => {
                // The muxer stays open for the restart.
                self.phase = Phase::Idle;
            }
            code => {
                l.rec_error(id, code);
                self.close(l, id);
            }
        }
    }
}
