// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tuner conflict detection.
//!
//! This is a greedy allocator, not an optimal one. Each channel is represented by its first
//! service only; each entry takes the first device that will have it. Callers get a yes/no
//! answer plus the entries which hold the device the candidate would have needed.

use std::ops::Range;

use base::time::Time;
use tracing::debug;

use crate::channel::{Channel, ServiceKind};
use crate::entry::EntryId;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConflictState {
    #[default]
    NoConflict,

    /// The candidate can't be allocated. Holds the entries occupying the device its
    /// preferred service maps to; empty if the channel has no services at all.
    ConflictDetected(Vec<EntryId>),
}

impl ConflictState {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictState::ConflictDetected(_))
    }
}

/// Returns true iff the half-open ranges share at least one instant.
pub fn overlaps(a: &Range<Time>, b: &Range<Time>) -> bool {
    a.start < b.end && b.start < a.end
}

#[derive(Debug, Eq, PartialEq)]
enum Device<'a> {
    Adapter(&'a str),
    Iptv,
    Analog(&'a str),
}

struct Bucket<'a> {
    device: Device<'a>,

    /// The mux currently tuned, for DVB adapters.
    mux: Option<&'a str>,
    holders: Vec<EntryId>,
}

#[derive(Default)]
struct Allocator<'a> {
    buckets: Vec<Bucket<'a>>,
}

impl<'a> Allocator<'a> {
    fn device_of(kind: &'a ServiceKind) -> (Device<'a>, Option<&'a str>) {
        match kind {
            ServiceKind::Dvb { adapter, mux } => {
                (Device::Adapter(adapter.as_str()), Some(mux.as_str()))
            }
            ServiceKind::Iptv => (Device::Iptv, None),
            ServiceKind::Analog { device } => (Device::Analog(device.as_str()), None),
        }
    }

    /// Tries to place `holder` on the device for `kind`. Returns the index of the bucket
    /// which was either used or found busy.
    fn allocate(&mut self, holder: EntryId, kind: &'a ServiceKind) -> Result<usize, usize> {
        let (device, mux) = Self::device_of(kind);
        let Some(i) = self.buckets.iter().position(|b| b.device == device) else {
            self.buckets.push(Bucket {
                device,
                mux,
                holders: vec![holder],
            });
            return Ok(self.buckets.len() - 1);
        };
        let b = &mut self.buckets[i];
        let shareable = match b.device {
            Device::Iptv => true,
            Device::Adapter(_) => b.mux == mux,
            Device::Analog(_) => false,
        };
        if !shareable {
            return Err(i);
        }
        b.holders.push(holder);
        Ok(i)
    }
}

/// Checks whether `candidate` could be tuned alongside `holders`.
///
/// `holders` are the entries already overlapping the candidate's window, in allocation
/// order. An entry that can't itself be placed is skipped.
pub fn check<'a>(holders: &[(EntryId, &'a Channel)], candidate: &'a Channel) -> ConflictState {
    let mut alloc = Allocator::default();
    for &(id, ch) in holders {
        let Some(s) = ch.services.first() else {
            continue;
        };
        if let Err(i) = alloc.allocate(id, &s.kind) {
            // Already in conflict itself; it holds nothing the candidate could contend for.
            debug!(%id, busy = ?alloc.buckets[i].device, "overlapping entry unplaced");
        }
    }
    let Some(s) = candidate.services.first() else {
        return ConflictState::ConflictDetected(Vec::new());
    };

    // The candidate has no id of its own; use a placeholder which never escapes.
    let placeholder = EntryId(uuid::Uuid::nil());
    match alloc.allocate(placeholder, &s.kind) {
        Ok(_) => ConflictState::NoConflict,
        Err(i) => ConflictState::ConflictDetected(alloc.buckets[i].holders.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dvb(id: u32, adapter: &str, mux: &str) -> Channel {
        Channel::new(id, &format!("dvb {id}")).with_service(
            "svc",
            ServiceKind::Dvb {
                adapter: adapter.to_owned(),
                mux: mux.to_owned(),
            },
        )
    }

    #[test]
    fn overlap_shapes() {
        let r = |a, b| Time(a)..Time(b);
        assert!(overlaps(&r(0, 10), &r(2, 3))); // containment
        assert!(overlaps(&r(0, 10), &r(-5, 1))); // partial before
        assert!(overlaps(&r(0, 10), &r(9, 20))); // partial after
        assert!(!overlaps(&r(0, 10), &r(10, 20))); // touching
        assert!(!overlaps(&r(0, 10), &r(-10, 0)));
    }

    #[test]
    fn adapter_shares_within_mux_only() {
        let a = dvb(1, "adapter0", "m1");
        let b = dvb(2, "adapter0", "m2");
        let c = dvb(3, "adapter0", "m1");
        let (ida, idb) = (EntryId::generate(), EntryId::generate());

        // B is newer so it's placed first and takes the adapter.
        assert_eq!(
            check(&[(idb, &b), (ida, &a)], &c),
            ConflictState::ConflictDetected(vec![idb])
        );
        assert_eq!(check(&[(ida, &a)], &c), ConflictState::NoConflict);
    }

    #[test]
    fn second_adapter_is_independent() {
        let a = dvb(1, "adapter0", "m1");
        let b = dvb(2, "adapter1", "m2");
        assert_eq!(
            check(&[(EntryId::generate(), &a)], &b),
            ConflictState::NoConflict
        );
    }

    #[test]
    fn iptv_always_allocates() {
        let ch = Channel::new(1, "iptv").with_service("s", ServiceKind::Iptv);
        let holders: Vec<_> = (0..10).map(|_| (EntryId::generate(), &ch)).collect();
        assert_eq!(check(&holders, &ch), ConflictState::NoConflict);
    }

    #[test]
    fn analog_holds_one() {
        let kind = ServiceKind::Analog {
            device: "/dev/video0".to_owned(),
        };
        let a = Channel::new(1, "a").with_service("s", kind.clone());
        let b = Channel::new(2, "b").with_service("s", kind);
        let id = EntryId::generate();
        assert_eq!(
            check(&[(id, &a)], &b),
            ConflictState::ConflictDetected(vec![id])
        );
        assert!(check(&[(id, &a)], &a).is_conflict());
    }

    #[test]
    fn unplaced_holder_is_skipped() {
        let kind = ServiceKind::Analog {
            device: "/dev/video0".to_owned(),
        };
        let a = Channel::new(1, "a").with_service("s", kind.clone());
        let b = Channel::new(2, "b").with_service("s", kind);
        let (ida, idb) = (EntryId::generate(), EntryId::generate());

        // B can't get the device A holds, so only A is reported.
        assert_eq!(
            check(&[(ida, &a), (idb, &b)], &b),
            ConflictState::ConflictDetected(vec![ida])
        );
    }

    #[test]
    fn no_services() {
        let ch = Channel::new(1, "empty");
        assert_eq!(check(&[], &ch), ConflictState::ConflictDetected(Vec::new()));
    }
}
