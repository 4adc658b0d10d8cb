// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving the DVR.
//!
//! [`TestDvr`] wires a [`Database`] on simulated clocks to in-memory stand-ins for the guide,
//! the tuner subsystem, access control and the muxer, so tests can drive a recording from
//! the outside.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration as StdDuration;

use base::clock::{Clocks, SimulatedClocks};
use base::time::{Duration, Time};
use base::{bail, Error, FastHashMap, Mutex};
use bytes::Bytes;
use jiff::tz::TimeZone;

use crate::access::{Access, AccessControl};
use crate::channel::{Channel, ChannelId};
use crate::config::Options;
use crate::entry::{DvrEntry, EntryId};
use crate::epg::{Broadcast, BroadcastId, Epg};
use crate::mux::{Container, FileMuxer, Muxer, MuxerFactory};
use crate::notify::Event;
use crate::space::{DiskSpace, SpaceInfo};
use crate::store::MemStore;
use crate::streaming::{
    ElementaryStream, Packet, StreamKind, StreamMessage, StreamStart, StreamingQueue, Subscriber,
    Subscription,
};
use crate::{Collaborators, Database};

static INIT: Once = Once::new();

/// Friday, 2024-03-01 00:00:00 UTC.
pub const T0: Time = Time(1_709_251_200);

pub const CH1: ChannelId = ChannelId(1);
pub const CH2: ChannelId = ChannelId(2);

/// How long [`wait_until`] polls before giving up.
const WAIT_LIMIT: StdDuration = StdDuration::from_secs(10);

/// Performs global initialization for tests.
///    * set up logging. (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set
///      in the program's environment prior to running.)
///    * use UTC for local time so tests that care about calendar time get the expected
///      results regardless of machine setup.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        base::time::set_global_zone(TimeZone::UTC);
    });
}

/// A stream start with one H.264 video stream (index 0) and one AAC audio stream (index 1).
pub fn start_msg() -> StreamMessage {
    StreamMessage::Start(Arc::new(StreamStart {
        source_name: "test".to_owned(),
        streams: vec![
            ElementaryStream {
                index: 0,
                kind: StreamKind::Video,
                codec: "H264".to_owned(),
                language: None,
            },
            ElementaryStream {
                index: 1,
                kind: StreamKind::Audio,
                codec: "AAC".to_owned(),
                language: Some("eng".to_owned()),
            },
        ],
    }))
}

fn packet(stream: u32, dts: i64, data: &[u8]) -> StreamMessage {
    StreamMessage::Packet(Packet {
        stream,
        dts: Some(dts),
        pts: Some(dts),
        commercial: None,
        errors: 0,
        data: Bytes::copy_from_slice(data),
    })
}

pub fn video_packet(dts: i64, data: &[u8]) -> StreamMessage {
    packet(0, dts, data)
}

pub fn audio_packet(dts: i64, data: &[u8]) -> StreamMessage {
    packet(1, dts, data)
}

pub fn broadcast(id: u32, channel: ChannelId, start: Time, stop: Time, title: &str) -> Broadcast {
    Broadcast {
        id: BroadcastId(id),
        channel,
        start,
        stop,
        title: title.into(),
        ..Default::default()
    }
}

/// Polls `f` until it returns true. Panics if that takes unreasonably long.
pub fn wait_until<F: FnMut() -> bool>(mut f: F) {
    let deadline = std::time::Instant::now() + WAIT_LIMIT;
    while !f() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not met within {WAIT_LIMIT:?}"
        );
        std::thread::sleep(StdDuration::from_millis(1));
    }
}

/// A guide which holds whatever broadcasts the test adds.
#[derive(Default)]
pub struct TestEpg(Mutex<BTreeMap<BroadcastId, Broadcast>>);

impl TestEpg {
    /// Adds or replaces a broadcast, returning it for convenience.
    pub fn add(&self, b: Broadcast) -> Broadcast {
        self.0.lock().insert(b.id, b.clone());
        b
    }

    pub fn remove(&self, id: BroadcastId) {
        self.0.lock().remove(&id);
    }
}

impl Epg for TestEpg {
    fn broadcast(&self, id: BroadcastId) -> Option<Broadcast> {
        self.0.lock().get(&id).cloned()
    }

    fn schedule(&self, channel: ChannelId, after: Time) -> Vec<Broadcast> {
        let mut v: Vec<Broadcast> = self
            .0
            .lock()
            .values()
            .filter(|b| b.channel == channel && b.stop > after)
            .cloned()
            .collect();
        v.sort_by_key(|b| (b.start, b.id));
        v
    }
}

/// The test's handle on one tuner subscription.
#[derive(Clone)]
pub struct MockSub {
    pub channel: ChannelId,
    pub weight: u32,

    /// Deliver messages here to feed the recording.
    pub queue: Arc<StreamingQueue>,
    unsubscribed: Arc<AtomicBool>,
}

impl MockSub {
    pub fn unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

struct MockSubscription(Arc<AtomicBool>);

impl Subscription for MockSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A tuner subsystem which hands every subscription to the test.
#[derive(Default)]
pub struct TestSubscriber {
    subs: Mutex<Vec<MockSub>>,
    fail_next: AtomicBool,
}

impl TestSubscriber {
    /// The most recent subscription, if any.
    pub fn last(&self) -> Option<MockSub> {
        self.subs.lock().last().cloned()
    }

    /// Makes the next subscription attempt fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Subscriber for TestSubscriber {
    fn subscribe(
        &self,
        channel: &Channel,
        weight: u32,
        _profile: &str,
        target: Arc<StreamingQueue>,
    ) -> Result<Box<dyn Subscription>, Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!(Unavailable, msg("no free tuner for {}", channel.name));
        }
        let unsubscribed = Arc::new(AtomicBool::new(false));
        self.subs.lock().push(MockSub {
            channel: channel.id,
            weight,
            queue: target,
            unsubscribed: unsubscribed.clone(),
        });
        Ok(Box::new(MockSubscription(unsubscribed)))
    }
}

/// Access control with per-user overrides; everyone else is unrestricted.
#[derive(Default)]
pub struct TestAccess(Mutex<FastHashMap<String, Access>>);

impl TestAccess {
    pub fn deny(&self, username: &str) {
        self.0.lock().insert(
            username.to_owned(),
            Access {
                can_record: false,
                ..Access::unrestricted(username)
            },
        );
    }

    pub fn limit(&self, username: &str, dvr_conn_limit: u32) {
        self.0.lock().insert(
            username.to_owned(),
            Access {
                dvr_conn_limit,
                ..Access::unrestricted(username)
            },
        );
    }
}

impl AccessControl for TestAccess {
    fn lookup(&self, username: &str) -> Option<Access> {
        Some(
            self.0
                .lock()
                .get(username)
                .cloned()
                .unwrap_or_else(|| Access::unrestricted(username)),
        )
    }
}

#[derive(Default)]
struct MuxLog {
    written_dts: Mutex<Vec<i64>>,
    markers: AtomicU32,
    fail_reconfigure: AtomicBool,
}

/// Creates [`FileMuxer`]s which also log what passes through them.
#[derive(Default)]
pub struct TestMuxers(Arc<MuxLog>);

impl TestMuxers {
    /// The (rebased) decode timestamps of all packets written so far.
    pub fn written_dts(&self) -> Vec<i64> {
        self.0.written_dts.lock().clone()
    }

    pub fn markers(&self) -> u32 {
        self.0.markers.load(Ordering::SeqCst)
    }

    /// Makes the next reconfiguration fail.
    pub fn fail_reconfigure(&self) {
        self.0.fail_reconfigure.store(true, Ordering::SeqCst);
    }
}

impl MuxerFactory for TestMuxers {
    fn create(&self, container: Container) -> Box<dyn Muxer> {
        Box::new(LoggingMuxer {
            inner: FileMuxer::new(container),
            log: self.0.clone(),
        })
    }
}

struct LoggingMuxer {
    inner: FileMuxer,
    log: Arc<MuxLog>,
}

impl Muxer for LoggingMuxer {
    fn open(&mut self, path: &Path, start: &StreamStart) -> Result<(), Error> {
        self.inner.open(path, start)
    }

    fn reconfigure(&mut self, start: &StreamStart) -> Result<(), Error> {
        if self.log.fail_reconfigure.swap(false, Ordering::SeqCst) {
            bail!(Unimplemented, msg("reconfiguration refused"));
        }
        self.inner.reconfigure(start)
    }

    fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        self.inner.write(pkt)?;
        self.log.written_dts.lock().push(pkt.dts.unwrap_or(-1));
        Ok(())
    }

    fn add_marker(&mut self) -> Result<(), Error> {
        self.log.markers.fetch_add(1, Ordering::SeqCst);
        self.inner.add_marker()
    }

    fn close(&mut self) -> Result<u64, Error> {
        self.inner.close()
    }
}

/// Storage whose free space the test sets. Every path is on one filesystem unless marked
/// otherwise. Starts with plenty free.
pub struct TestSpace {
    info: Mutex<SpaceInfo>,
    other: Mutex<Vec<PathBuf>>,
}

impl Default for TestSpace {
    fn default() -> Self {
        TestSpace {
            info: Mutex::new(SpaceInfo {
                avail: 1 << 40,
                total: 1 << 40,
                fsid: 1,
            }),
            other: Mutex::new(Vec::new()),
        }
    }
}

impl TestSpace {
    pub fn set(&self, avail: u64, total: u64) {
        let mut i = self.info.lock();
        i.avail = avail;
        i.total = total;
    }

    /// Reports `path` as being on a different filesystem.
    pub fn other_filesystem(&self, path: &Path) {
        self.other.lock().push(path.to_owned());
    }
}

impl DiskSpace for TestSpace {
    fn stat(&self, path: &Path) -> Result<SpaceInfo, Error> {
        let mut i = *self.info.lock();
        if self.other.lock().iter().any(|p| p == path) {
            i.fsid = 2;
        }
        Ok(i)
    }
}

/// A database on simulated clocks with two channels, [`CH1`] ("One") and [`CH2`] ("Two"),
/// recording into a temporary directory.
pub struct TestDvr {
    pub db: Arc<Database<SimulatedClocks>>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub store: MemStore,
    pub epg: Arc<TestEpg>,
    pub subscriber: Arc<TestSubscriber>,
    pub access: Arc<TestAccess>,
    pub muxers: Arc<TestMuxers>,
    pub space: Arc<TestSpace>,
    tmpdir: Arc<tempfile::TempDir>,
}

impl TestDvr {
    /// Creates a started database at [`T0`] with an empty store.
    pub fn new() -> Self {
        let tmpdir = Arc::new(
            tempfile::Builder::new()
                .prefix("pvr-dvr-test")
                .tempdir()
                .unwrap(),
        );
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(T0.0).unwrap());
        Self::open(clocks, MemStore::new(), Arc::new(TestEpg::default()), tmpdir)
    }

    fn open(
        clocks: SimulatedClocks,
        store: MemStore,
        epg: Arc<TestEpg>,
        tmpdir: Arc<tempfile::TempDir>,
    ) -> Self {
        let subscriber = Arc::new(TestSubscriber::default());
        let access = Arc::new(TestAccess::default());
        let muxers = Arc::new(TestMuxers::default());
        let space = Arc::new(TestSpace::default());
        let collab = Collaborators {
            epg: epg.clone(),
            access: access.clone(),
            subscriber: subscriber.clone(),
            muxers: muxers.clone(),
            space: space.clone(),
        };
        let options = Options {
            storage_dir: tmpdir.path().to_owned(),
            ..Default::default()
        };
        let db = Database::new(clocks, Box::new(store.clone()), collab, options).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let mut l = db.lock();
            let e = events.clone();
            l.add_listener(Box::new(move |ev| e.lock().push(ev.clone())));
            l.upsert_channel(Channel::new(CH1.0, "One"));
            l.upsert_channel(Channel::new(CH2.0, "Two"));
            l.start();
        }
        TestDvr {
            db,
            events,
            store,
            epg,
            subscriber,
            access,
            muxers,
            space,
            tmpdir,
        }
    }

    /// Opens a second database on the same store, guide and storage directory, as if the
    /// process had restarted at the current simulated time.
    pub fn reopen(&self) -> TestDvr {
        let clocks = SimulatedClocks::new(self.db.clocks().realtime());
        Self::open(
            clocks,
            self.store.clone(),
            self.epg.clone(),
            self.tmpdir.clone(),
        )
    }

    /// The default config's storage directory.
    pub fn storage(&self) -> PathBuf {
        self.tmpdir.path().to_owned()
    }

    /// Advances the simulated clock to `when`, firing each timer at its own deadline along
    /// the way.
    pub fn advance_to(&self, when: Time) {
        let clocks = self.db.clocks();
        loop {
            let mut l = self.db.lock();
            let now = l.now();
            let next = l
                .timers
                .next_deadline()
                .filter(|&d| d <= when)
                .unwrap_or(when);
            if next > now {
                clocks.sleep((next - now).to_std());
            }
            l.run_due_timers();
            if next >= when {
                break;
            }
        }
    }

    pub fn advance(&self, d: Duration) {
        let now = self.db.lock().now();
        self.advance_to(now + d);
    }

    /// Waits for the entry to satisfy `pred`, as seen under the database lock.
    pub fn wait_for<F: Fn(&DvrEntry) -> bool>(&self, id: EntryId, pred: F) {
        wait_until(|| self.db.lock().entry(id).is_some_and(&pred));
    }

    /// Joins recording threads which have been told to exit.
    pub fn join_workers(&self) {
        drop(self.db.lock());
    }
}

impl Default for TestDvr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestDvr {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let mut l = self.db.lock();
        l.shutdown();
        l.clear_listeners();
    }
}
