// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Change notifications for outside observers.

use std::collections::BTreeSet;

use crate::autorec::AutorecId;
use crate::entry::EntryId;
use crate::epg::BroadcastId;
use crate::timerec::TimerecId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    EntryAdded(EntryId),
    EntryChanged(EntryId),
    EntryDeleted(EntryId),

    /// The recording status of a broadcast's entry changed. Coalesced per broadcast and
    /// sent from the timer thread.
    EpgUpdated(BroadcastId),
    AutorecAdded(AutorecId),
    AutorecDeleted(AutorecId),
    TimerecAdded(TimerecId),
    TimerecDeleted(TimerecId),
}

/// A listener is called with the database lock held, so it must not call back into the
/// database.
pub type Listener = Box<dyn FnMut(&Event) + Send>;

#[derive(Default)]
pub(crate) struct Notifier {
    listeners: Vec<Listener>,
    pending_epg: BTreeSet<BroadcastId>,
}

impl Notifier {
    pub(crate) fn add_listener(&mut self, l: Listener) {
        self.listeners.push(l);
    }

    pub(crate) fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    pub(crate) fn send(&mut self, event: Event) {
        for l in &mut self.listeners {
            l(&event);
        }
    }

    /// Queues an [`Event::EpgUpdated`]. Returns true if nothing was queued before, in which
    /// case the caller should arrange for [`Notifier::flush_epg`] to be called.
    pub(crate) fn queue_epg(&mut self, b: BroadcastId) -> bool {
        let was_empty = self.pending_epg.is_empty();
        self.pending_epg.insert(b);
        was_empty
    }

    pub(crate) fn flush_epg(&mut self) {
        for b in std::mem::take(&mut self.pending_epg) {
            self.send(Event::EpgUpdated(b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn epg_coalesces() {
        let seen = Arc::new(base::Mutex::new(Vec::new()));
        let mut n = Notifier::default();
        let s = seen.clone();
        n.add_listener(Box::new(move |e| s.lock().push(e.clone())));
        assert!(n.queue_epg(BroadcastId(2)));
        assert!(!n.queue_epg(BroadcastId(1)));
        assert!(!n.queue_epg(BroadcastId(2)));
        n.send(Event::EntryAdded(EntryId(uuid::Uuid::nil())));
        n.flush_epg();
        assert_eq!(
            &*seen.lock(),
            &[
                Event::EntryAdded(EntryId(uuid::Uuid::nil())),
                Event::EpgUpdated(BroadcastId(1)),
                Event::EpgUpdated(BroadcastId(2)),
            ]
        );
        assert!(n.queue_epg(BroadcastId(3)));
    }
}
