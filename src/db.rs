// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The DVR database: the registry of entries, rules, channels and configs, and the one lock
//! that serializes all changes to them.
//!
//! Usage:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # fn f(collab: dvr::Collaborators, channels: Vec<dvr::channel::Channel>) -> Result<(), base::Error> {
//! let store = dvr::store::SqliteStore::open("/var/lib/pvr-dvr/db".as_ref())?;
//! let db = dvr::Database::new(
//!     base::clock::RealClocks {},
//!     Box::new(store),
//!     collab,
//!     dvr::config::Options::default(),
//! )?;
//! {
//!     let mut l = db.lock();
//!     for c in channels {
//!         l.upsert_channel(c);
//!     }
//!     l.start();
//! }
//! let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
//! let timers = dvr::timer::start_timer_thread(db.clone(), shutdown_rx)?;
//! # drop(shutdown_tx);
//! # timers.join().unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! Entries are owned by the registry and referred to everywhere else by [`EntryId`]; an entry
//! is alive exactly as long as its id is in the registry.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::thread;

use base::clock::{Clocks, RealClocks, TimerGuard};
use base::time::Time;
use base::{bail, err, Error, FastHashMap, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::access::AccessControl;
use crate::autorec::{AutorecEntry, AutorecId};
use crate::channel::{Channel, ChannelId};
use crate::config::{ConfigId, DvrConfig, Options};
use crate::conflict::{self, ConflictState};
use crate::entry::{DvrEntry, EntryId, NewEntry, SchedState};
use crate::epg::{BroadcastId, Epg};
use crate::json::EntryDoc;
use crate::mux::MuxerFactory;
use crate::notify::{Event, Listener, Notifier};
use crate::rec::Recording;
use crate::space::DiskSpace;
use crate::store::{self, Store};
use crate::streaming::{StreamCode, Subscriber};
use crate::timer::{Action, Slot, TimerQueue};
use crate::timerec::{TimerecEntry, TimerecId};

/// The subsystems the recorder talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub epg: Arc<dyn Epg>,
    pub access: Arc<dyn AccessControl>,
    pub subscriber: Arc<dyn Subscriber>,
    pub muxers: Arc<dyn MuxerFactory>,
    pub space: Arc<dyn DiskSpace>,
}

/// What recording threads hold to get back to the database.
pub(crate) trait Host: Send + Sync {
    fn lock(&self) -> DatabaseGuard<'_>;
}

/// In-memory state of the database, accessible only through [`Database::lock`].
pub struct LockedDatabase {
    pub(crate) clocks: Arc<dyn Clocks>,
    pub(crate) host: Weak<dyn Host>,
    pub(crate) store: Box<dyn Store>,
    pub(crate) collab: Collaborators,
    pub(crate) options: Options,

    pub(crate) channels: BTreeMap<ChannelId, Channel>,
    pub(crate) configs: BTreeMap<ConfigId, DvrConfig>,
    pub(crate) default_config: ConfigId,
    pub(crate) entries: BTreeMap<EntryId, DvrEntry>,
    pub(crate) autorecs: BTreeMap<AutorecId, AutorecEntry>,
    pub(crate) timerecs: BTreeMap<TimerecId, TimerecEntry>,

    /// Active recording pipelines, keyed by the entry they write for.
    pub(crate) recordings: FastHashMap<EntryId, Recording>,
    pub(crate) timers: TimerQueue,
    pub(crate) notifier: Notifier,
    pub(crate) next_seq: u64,

    /// True while the persisted entries are being re-scheduled at startup.
    pub(crate) loading: bool,
    started: bool,

    /// Recording threads which have been told to exit. Joined by [`DatabaseGuard`] after
    /// the lock is released.
    pub(crate) pending_joins: Vec<thread::JoinHandle<()>>,
}

/// Serializes and saves a document, logging failure.
pub(crate) fn put_doc<T: serde::Serialize>(store: &mut dyn Store, key: &str, t: &T) {
    let r = serde_json::to_string(t)
        .map_err(|e| err!(Internal, msg("serialize"), source(e)))
        .and_then(|d| store.put(key, &d));
    if let Err(e) = r {
        warn!(key, err = %e.chain(), "unable to save document");
    }
}

/// Outcome of parsing one persisted document.
fn parse_doc<T: serde::de::DeserializeOwned, I: std::str::FromStr>(
    key: &str,
    prefix: &str,
    doc: &str,
) -> Option<(I, T)> {
    let id = match key[prefix.len()..].parse() {
        Ok(id) => id,
        Err(_) => {
            warn!(key, "ignoring document with malformed key");
            return None;
        }
    };
    match serde_json::from_str(doc) {
        Ok(t) => Some((id, t)),
        Err(e) => {
            warn!(key, err = %e, "ignoring unparseable document");
            None
        }
    }
}

impl LockedDatabase {
    fn new(
        clocks: Arc<dyn Clocks>,
        host: Weak<dyn Host>,
        store: Box<dyn Store>,
        collab: Collaborators,
        options: Options,
    ) -> Self {
        LockedDatabase {
            clocks,
            host,
            store,
            collab,
            options,
            channels: BTreeMap::new(),
            configs: BTreeMap::new(),
            default_config: ConfigId(uuid::Uuid::nil()),
            entries: BTreeMap::new(),
            autorecs: BTreeMap::new(),
            timerecs: BTreeMap::new(),
            recordings: FastHashMap::default(),
            timers: TimerQueue::default(),
            notifier: Notifier::default(),
            next_seq: 0,
            loading: false,
            started: false,
            pending_joins: Vec::new(),
        }
    }

    pub(crate) fn now(&self) -> Time {
        Time::from(self.clocks.realtime())
    }

    /// Loads configs, rules and entries from the store. Doesn't schedule anything; see
    /// [`LockedDatabase::start`].
    fn load(&mut self) -> Result<(), Error> {
        for (key, doc) in self.store.list(store::CONFIG_PREFIX)? {
            if let Some((id, c)) =
                parse_doc::<DvrConfig, ConfigId>(&key, store::CONFIG_PREFIX, &doc)
            {
                self.configs.insert(id, c);
            }
        }
        match self.configs.iter().find(|(_, c)| c.is_default()) {
            Some((&id, _)) => self.default_config = id,
            None => {
                let id = ConfigId::generate();
                info!(%id, "creating default DVR config");
                self.configs.insert(id, DvrConfig::initial(&self.options));
                self.default_config = id;
                self.save_config(id);
            }
        }

        for (key, doc) in self.store.list(store::AUTOREC_PREFIX)? {
            if let Some((id, mut r)) =
                parse_doc::<AutorecEntry, AutorecId>(&key, store::AUTOREC_PREFIX, &doc)
            {
                if let Err(e) = r.compile() {
                    warn!(%id, err = %e.chain(), "autorec title doesn't compile; rule won't match");
                }
                self.autorecs.insert(id, r);
            }
        }
        for (key, doc) in self.store.list(store::TIMEREC_PREFIX)? {
            if let Some((id, r)) =
                parse_doc::<TimerecEntry, TimerecId>(&key, store::TIMEREC_PREFIX, &doc)
            {
                self.timerecs.insert(id, r);
            }
        }

        let mut docs: Vec<(EntryId, EntryDoc)> = self
            .store
            .list(store::ENTRY_PREFIX)?
            .iter()
            .filter_map(|(k, d)| parse_doc(k, store::ENTRY_PREFIX, d))
            .collect();
        docs.sort_by_key(|(_, d)| d.created);
        for (id, doc) in docs {
            let config = self.resolve_config_id(doc.config);
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(id, doc.into_entry(id, seq, config));
        }
        self.repair_links();
        info!(
            entries = self.entries.len(),
            autorecs = self.autorecs.len(),
            timerecs = self.timerecs.len(),
            "loaded"
        );
        Ok(())
    }

    /// Drops references to missing rules and one-sided parent/child links.
    fn repair_links(&mut self) {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            let e = &self.entries[&id];
            let bad_autorec = e.autorec.is_some_and(|a| !self.autorecs.contains_key(&a));
            let bad_timerec = e.timerec.is_some_and(|t| !self.timerecs.contains_key(&t));
            let bad_parent = e
                .parent
                .is_some_and(|p| self.entries.get(&p).and_then(|p| p.child) != Some(id));
            let bad_child = e
                .child
                .is_some_and(|c| self.entries.get(&c).and_then(|c| c.parent) != Some(id));
            if !(bad_autorec || bad_timerec || bad_parent || bad_child) {
                continue;
            }
            warn!(%id, bad_autorec, bad_timerec, bad_parent, bad_child, "repairing entry links");
            if let Some(e) = self.entries.get_mut(&id) {
                if bad_autorec {
                    e.autorec = None;
                }
                if bad_timerec {
                    e.timerec = None;
                }
                if bad_parent {
                    e.parent = None;
                }
                if bad_child {
                    e.child = None;
                }
            }
            self.save_entry(id);
        }
    }

    /// Schedules every loaded entry and rule. Call once, after registering channels.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.loading = true;
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.set_timer(id);
        }
        self.loading = false;
        self.timerec_check_all();
        let next = self.now().saturating_add(self.options.timerec_check);
        self.timers.arm(Slot::TimerecCheck, Action::TimerecCheck, next);
        let next = self.now().saturating_add(self.options.space_check);
        self.timers.arm(Slot::SpaceCheck, Action::SpaceCheck, next);
        info!("started");
    }

    pub(crate) fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    pub fn add_listener(&mut self, l: Listener) {
        self.notifier.add_listener(l);
    }

    pub fn clear_listeners(&mut self) {
        self.notifier.clear_listeners();
    }

    pub(crate) fn save_entry(&mut self, id: EntryId) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let doc = match serde_json::to_string(&EntryDoc::from_entry(e)) {
            Ok(d) => d,
            Err(e) => {
                warn!(%id, err = %e, "unable to serialize entry");
                return;
            }
        };
        if let Err(e) = self.store.put(&store::key(store::ENTRY_PREFIX, id), &doc) {
            warn!(%id, err = %e.chain(), "unable to save entry");
        }
    }

    pub(crate) fn save_config(&mut self, id: ConfigId) {
        let Some(c) = self.configs.get(&id) else {
            return;
        };
        put_doc(&mut *self.store, &store::key(store::CONFIG_PREFIX, id), c);
    }

    pub(crate) fn delete_doc(&mut self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            warn!(key, err = %e.chain(), "unable to delete document");
        }
    }

    pub(crate) fn changed(&mut self, id: EntryId) {
        self.save_entry(id);
        self.notifier.send(Event::EntryChanged(id));
    }

    // Entries.

    pub fn entry(&self, id: EntryId) -> Option<&DvrEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DvrEntry> {
        self.entries.values()
    }

    /// All entries ordered by start time, then creation order.
    pub fn entries_by_start(&self) -> Vec<&DvrEntry> {
        let mut v: Vec<&DvrEntry> = self.entries.values().collect();
        v.sort_by_key(|e| (e.start, e.seq));
        v
    }

    pub fn find_by_broadcast(&self, b: BroadcastId) -> Option<&DvrEntry> {
        self.entries.values().find(|e| e.broadcast == Some(b))
    }

    /// Machine-readable status; see [`DvrEntry::sched_status`].
    pub fn sched_status(&self, id: EntryId) -> Option<&'static str> {
        let e = self.entries.get(&id)?;
        Some(e.sched_status(self.config_of(e).rerecord_errors))
    }

    /// Creates an entry. Returns `Ok(None)` if an equivalent live entry already exists.
    pub fn create(&mut self, n: NewEntry) -> Result<Option<EntryId>, Error> {
        self.create_entry(n, None, None)
    }

    pub(crate) fn create_entry(
        &mut self,
        n: NewEntry,
        autorec: Option<AutorecId>,
        timerec: Option<TimerecId>,
    ) -> Result<Option<EntryId>, Error> {
        if n.start >= n.stop {
            bail!(InvalidArgument, msg("invalid times"));
        }
        let Some(ch) = self.channels.get(&n.channel) else {
            bail!(NotFound, msg("invalid channel"));
        };
        let channel_name = ch.name.clone();
        let config = self.resolve_config_id(n.config);
        if let Some(dup) = self.entries.values().find(|e| {
            e.channel == Some(n.channel)
                && !e.sched_state.is_finished()
                && e.config == config
                && e.start == n.start
                && e.owner == n.owner
        }) {
            info!(existing = %dup.id, title = dup.title_str(), "not creating duplicate entry");
            return Ok(None);
        }
        let id = EntryId::generate();
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut e = DvrEntry::new(id, seq, self.now(), config, n);
        e.channel_name = channel_name;
        e.autorec = autorec;
        e.timerec = timerec;
        info!(
            %id,
            title = e.title_str(),
            start = %e.start,
            stop = %e.stop,
            channel = %e.channel_name,
            "created entry"
        );
        self.entries.insert(id, e);
        self.save_entry(id);
        self.notifier.send(Event::EntryAdded(id));
        self.set_timer(id);
        Ok(Some(id))
    }

    // Configs.

    pub fn default_config_id(&self) -> ConfigId {
        self.default_config
    }

    pub fn config(&self, id: ConfigId) -> Option<&DvrConfig> {
        self.configs.get(&id)
    }

    pub fn configs(&self) -> &BTreeMap<ConfigId, DvrConfig> {
        &self.configs
    }

    /// Maps a requested config id to one which exists.
    pub(crate) fn resolve_config_id(&self, id: Option<ConfigId>) -> ConfigId {
        match id {
            Some(id) if self.configs.contains_key(&id) => id,
            _ => self.default_config,
        }
    }

    /// The config governing `e`.
    ///
    /// Panics if the default config is missing, which can't happen after load.
    pub(crate) fn config_of(&self, e: &DvrEntry) -> &DvrConfig {
        self.configs
            .get(&e.config)
            .or_else(|| self.configs.get(&self.default_config))
            .expect("default config exists")
    }

    pub fn add_config(&mut self, c: DvrConfig) -> Result<ConfigId, Error> {
        if c.is_default() {
            bail!(AlreadyExists, msg("the default config already exists"));
        }
        let id = ConfigId::generate();
        info!(%id, name = %c.name, "adding DVR config");
        self.configs.insert(id, c);
        self.save_config(id);
        Ok(id)
    }

    /// Replaces a config and reschedules everything governed by it.
    pub fn update_config(&mut self, id: ConfigId, mut c: DvrConfig) -> Result<(), Error> {
        let Some(old) = self.configs.get(&id) else {
            bail!(NotFound, msg("no config {id}"));
        };
        if old.is_default() {
            c.name.clear();
        } else if c.is_default() {
            bail!(InvalidArgument, msg("only the default config may have an empty name"));
        }
        self.configs.insert(id, c);
        self.save_config(id);
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.config == id)
            .map(|e| e.id)
            .collect();
        for eid in ids {
            self.reschedule(eid);
        }
        Ok(())
    }

    /// Deletes a config, moving everything governed by it to the default.
    pub fn delete_config(&mut self, id: ConfigId) -> Result<(), Error> {
        if id == self.default_config {
            bail!(FailedPrecondition, msg("can't delete the default config"));
        }
        if self.configs.remove(&id).is_none() {
            bail!(NotFound, msg("no config {id}"));
        }
        self.delete_doc(&store::key(store::CONFIG_PREFIX, id));
        let default = self.default_config;
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.config == id)
            .map(|e| e.id)
            .collect();
        for eid in ids {
            if let Some(e) = self.entries.get_mut(&eid) {
                e.config = default;
            }
            self.changed(eid);
            self.reschedule(eid);
        }
        let rules: Vec<AutorecId> = self
            .autorecs
            .iter()
            .filter(|(_, r)| r.config == Some(id))
            .map(|(&rid, _)| rid)
            .collect();
        for rid in rules {
            if let Some(r) = self.autorecs.get_mut(&rid) {
                r.config = None;
            }
            self.save_autorec(rid);
        }
        let rules: Vec<TimerecId> = self
            .timerecs
            .iter()
            .filter(|(_, r)| r.config == Some(id))
            .map(|(&rid, _)| rid)
            .collect();
        for rid in rules {
            if let Some(r) = self.timerecs.get_mut(&rid) {
                r.config = None;
            }
            self.save_timerec(rid);
        }
        Ok(())
    }

    /// Re-runs the scheduling decision after a policy change.
    fn reschedule(&mut self, id: EntryId) {
        match self.entries.get(&id).map(|e| e.sched_state) {
            Some(s) if s.is_finished() => self.retention_timer(id),
            Some(_) => self.set_timer(id),
            None => {}
        }
    }

    // Channels.

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> &BTreeMap<ChannelId, Channel> {
        &self.channels
    }

    /// Adds or replaces a channel, rescheduling entries which aren't recording.
    pub fn upsert_channel(&mut self, ch: Channel) {
        let id = ch.id;
        let name = ch.name.clone();
        self.channels.insert(id, ch);
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.channel == Some(id))
            .map(|e| e.id)
            .collect();
        for eid in ids {
            let Some(e) = self.entries.get_mut(&eid) else {
                continue;
            };
            let state = e.sched_state;
            if e.channel_name != name {
                e.channel_name.clone_from(&name);
                self.changed(eid);
            }
            if self.started && matches!(state, SchedState::Scheduled | SchedState::NoState) {
                self.set_timer(eid);
            }
        }
    }

    /// Removes a channel. Its entries keep the channel's name; active recordings stop.
    pub fn remove_channel(&mut self, id: ChannelId) {
        if self.channels.remove(&id).is_none() {
            return;
        }
        info!(channel = %id, "removing channel");
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.channel == Some(id))
            .map(|e| e.id)
            .collect();
        for eid in ids {
            if self.entries.get(&eid).map(|e| e.sched_state) == Some(SchedState::Recording) {
                self.stop_recording(eid, StreamCode::SourceDeleted, false);
            }
            let Some(e) = self.entries.get_mut(&eid) else {
                continue;
            };
            e.channel = None;
            let state = e.sched_state;
            self.changed(eid);
            if matches!(state, SchedState::Scheduled | SchedState::NoState) {
                self.set_timer(eid);
            }
        }
        let rules: Vec<AutorecId> = self
            .autorecs
            .iter()
            .filter(|(_, r)| r.channel == Some(id))
            .map(|(&rid, _)| rid)
            .collect();
        for rid in rules {
            if let Some(r) = self.autorecs.get_mut(&rid) {
                r.channel = None;
                r.enabled = false;
            }
            self.save_autorec(rid);
        }
        let rules: Vec<TimerecId> = self
            .timerecs
            .iter()
            .filter(|(_, r)| r.channel == Some(id))
            .map(|(&rid, _)| rid)
            .collect();
        for rid in rules {
            if let Some(r) = self.timerecs.get_mut(&rid) {
                r.channel = None;
            }
            self.save_timerec(rid);
            self.timerec_purge_spawn(rid);
        }
    }

    // Conflicts.

    /// The window an entry occupies a tuner for, padding included.
    fn occupied_window(&self, e: &DvrEntry) -> Range<Time> {
        let (pre, post) = self.padding(e);
        e.start_time(pre, None)..e.stop_time(post)
    }

    /// Returns scheduled and recording entries whose padded windows overlap `window`,
    /// optionally restricted to one channel.
    pub fn find_overlaps(
        &self,
        channel: Option<ChannelId>,
        window: Range<Time>,
        exclude: Option<EntryId>,
    ) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| {
                matches!(e.sched_state, SchedState::Scheduled | SchedState::Recording)
                    && Some(e.id) != exclude
                    && (channel.is_none() || e.channel == channel)
                    && conflict::overlaps(&self.occupied_window(e), &window)
            })
            .map(|e| e.id)
            .collect()
    }

    /// Checks whether a recording on `channel` over `window` could get a tuner.
    pub fn check_conflict(
        &self,
        channel: ChannelId,
        window: Range<Time>,
        exclude: Option<EntryId>,
    ) -> Result<ConflictState, Error> {
        let Some(candidate) = self.channels.get(&channel) else {
            bail!(NotFound, msg("invalid channel"));
        };
        let mut holders: Vec<&DvrEntry> = self
            .find_overlaps(None, window, exclude)
            .into_iter()
            .filter_map(|id| self.entries.get(&id))
            .collect();
        holders.sort_by(|a, b| b.seq.cmp(&a.seq));
        let holders: Vec<(EntryId, &Channel)> = holders
            .into_iter()
            .filter_map(|e| Some((e.id, self.channels.get(&e.channel?)?)))
            .collect();
        Ok(conflict::check(&holders, candidate))
    }
}

/// The database: the in-memory registry guarded by one lock.
pub struct Database<C: Clocks + Clone = RealClocks> {
    db: Mutex<LockedDatabase>,

    /// This is kept separately from the `LockedDatabase` to allow the `lock()` operation itself
    /// to access it. It doesn't need a `Mutex` anyway; it's `Sync`, and all operations work on
    /// `&self`.
    clocks: C,
}

// Helpers for Database::lock(). Closures don't implement Fn.
fn acquisition() -> &'static str {
    "database lock acquisition"
}
fn operation() -> &'static str {
    "database operation"
}

impl<C: Clocks + Clone> Database<C> {
    /// Opens the database, loading everything persisted in `store`.
    pub fn new(
        clocks: C,
        store: Box<dyn Store>,
        collab: Collaborators,
        options: Options,
    ) -> Result<Arc<Self>, Error> {
        let db = Arc::new_cyclic(|weak: &Weak<Database<C>>| {
            let host: Weak<dyn Host> = weak.clone();
            let shared: Arc<dyn Clocks> = Arc::new(clocks.clone());
            Database {
                db: Mutex::new(LockedDatabase::new(shared, host, store, collab, options)),
                clocks,
            }
        });
        db.lock().load()?;
        Ok(db)
    }

    #[inline(always)]
    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    /// Locks the database; the returned reference is the only way to perform (read or write)
    /// operations.
    pub fn lock(&self) -> DatabaseGuard<'_> {
        let timer = TimerGuard::new(&self.clocks, acquisition);
        let db = self.db.lock();
        drop(timer);
        let clocks: &dyn Clocks = &self.clocks;
        DatabaseGuard {
            db,
            _timer: TimerGuard::new(clocks, operation),
        }
    }
}

impl<C: Clocks + Clone> Host for Database<C> {
    fn lock(&self) -> DatabaseGuard<'_> {
        Database::lock(self)
    }
}

/// Exclusive access to the [`LockedDatabase`].
///
/// On drop, releases the lock and then joins any recording threads stopped meanwhile.
pub struct DatabaseGuard<'db> {
    db: MutexGuard<'db, LockedDatabase>,
    _timer: TimerGuard<'db, dyn Clocks, &'static str, fn() -> &'static str>,
}

impl Drop for DatabaseGuard<'_> {
    fn drop(&mut self) {
        if self.db.pending_joins.is_empty() || thread::panicking() {
            return;
        }
        let joins = std::mem::take(&mut self.db.pending_joins);
        MutexGuard::unlocked(&mut self.db, || {
            for j in joins {
                let name = j.thread().name().unwrap_or("recording").to_owned();
                if j.join().is_err() {
                    warn!(thread = %name, "recording thread panicked");
                }
            }
        });
    }
}

impl std::ops::Deref for DatabaseGuard<'_> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.db
    }
}

impl std::ops::DerefMut for DatabaseGuard<'_> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.db
    }
}
