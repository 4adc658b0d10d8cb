// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Deadline-ordered timers and the thread which fires them.
//!
//! Each [`Slot`] holds at most one armed timer; re-arming a slot replaces its timer. Replaced
//! and disarmed timers stay in the heap until they reach the top, where they're recognized by
//! their stale sequence number and skipped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{mpsc, Arc};
use std::thread;

use base::clock::Clocks;
use base::time::Time;
use base::{err, Error, FastHashMap};
use tracing::{debug, info};

use crate::entry::EntryId;

/// Longest the timer thread sleeps before re-checking for shutdown.
const MAX_SLEEP: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Slot {
    /// The entry's one lifecycle timer.
    Entry(EntryId),

    /// A deferred destruction of the entry.
    Destroy(EntryId),
    EpgNotify,
    TimerecCheck,
    SpaceCheck,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Action {
    StartRecording,
    StopRecording,
    RemoveFiles,
    Expire,

    /// Re-evaluates rerecording of a finished entry, then its retention.
    Rerecord,
    Destroy,
    EpgNotify,
    TimerecCheck,
    SpaceCheck,
}

struct Armed {
    when: Time,
    seq: u64,
    action: Action,
}

struct Planned {
    when: Time,
    seq: u64,
    slot: Slot,
}

// Planned is meant for placement in a max-heap which should return the soonest timer, breaking
// ties by arming order. A Planned is greater than another if it's due _earlier_.
impl Ord for Planned {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Planned {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Planned {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Planned {}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Planned>,
    armed: FastHashMap<Slot, Armed>,
    next_seq: u64,

    /// Signalled when a timer is armed ahead of the previous earliest deadline.
    waker: Option<mpsc::Sender<()>>,
}

impl TimerQueue {
    pub(crate) fn set_waker(&mut self, waker: mpsc::Sender<()>) {
        self.waker = Some(waker);
    }

    pub fn arm(&mut self, slot: Slot, action: Action, when: Time) {
        let earliest = self.peek_deadline();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(slot, Armed { when, seq, action });
        self.heap.push(Planned { when, seq, slot });
        if earliest.map(|e| when < e).unwrap_or(true) {
            if let Some(w) = &self.waker {
                let _ = w.send(());
            }
        }
    }

    pub fn disarm(&mut self, slot: Slot) {
        self.armed.remove(&slot);
    }

    /// Returns the armed timer of `slot`, if any.
    pub fn get(&self, slot: Slot) -> Option<(Time, Action)> {
        self.armed.get(&slot).map(|a| (a.when, a.action))
    }

    fn is_current(&self, p: &Planned) -> bool {
        self.armed.get(&p.slot).map(|a| a.seq == p.seq).unwrap_or(false)
    }

    /// The earliest deadline of any armed timer, possibly counting a stale one.
    fn peek_deadline(&self) -> Option<Time> {
        self.heap.peek().map(|p| p.when)
    }

    /// The earliest deadline of any armed timer.
    pub fn next_deadline(&mut self) -> Option<Time> {
        while let Some(p) = self.heap.peek() {
            if self.is_current(p) {
                return Some(p.when);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns the earliest timer due at `now`, if any.
    pub fn pop_due(&mut self, now: Time) -> Option<(Slot, Action)> {
        while let Some(p) = self.heap.peek() {
            if p.when > now {
                return None;
            }
            let Some(p) = self.heap.pop() else {
                break;
            };
            if !self.is_current(&p) {
                continue;
            }
            let armed = self.armed.remove(&p.slot)?;
            return Some((p.slot, armed.action));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// Starts the timer thread, which fires due timers until shutdown is requested.
///
/// The lock must not be held on `db` when this is called.
pub fn start_timer_thread<C>(
    db: Arc<crate::Database<C>>,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<thread::JoinHandle<()>, Error>
where
    C: Clocks + Clone,
{
    let (tx, rx) = mpsc::channel();
    db.lock().timers_mut().set_waker(tx);
    thread::Builder::new()
        .name("dvr-timers".to_owned())
        .spawn(move || run(&db, &rx, &shutdown_rx))
        .map_err(|e| err!(Internal, msg("unable to start timer thread"), source(e)))
}

fn run<C: Clocks + Clone>(
    db: &crate::Database<C>,
    rx: &mpsc::Receiver<()>,
    shutdown_rx: &base::shutdown::Receiver,
) {
    info!("starting");
    let clocks = db.clocks();
    while shutdown_rx.check().is_ok() {
        let wait = {
            let mut l = db.lock();
            l.run_due_timers();
            let now = Time::from(clocks.realtime());
            l.timers_mut().next_deadline().map(|d| (d - now).to_std())
        };
        let wait = wait.map(|w| w.min(MAX_SLEEP)).unwrap_or(MAX_SLEEP);
        debug!(?wait, "sleeping");
        if let Err(mpsc::RecvTimeoutError::Disconnected) = clocks.recv_timeout(rx, wait) {
            break;
        }
    }
    info!("ending");
}
