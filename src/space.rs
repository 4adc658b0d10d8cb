// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Storage space maintenance.
//!
//! Files of finished entries whose removal policy is [`Removal::MaintainedSpace`] stay until
//! a DVR config's storage runs short while that config is recording. The periodic check then
//! deletes the oldest such files on the same filesystem until the config's thresholds hold
//! again.

use std::path::Path;

use base::time::Time;
use base::{err, Error};
use tracing::{debug, info, warn};

use crate::config::ConfigId;
use crate::db::LockedDatabase;
use crate::entry::{EntryId, SchedState};
use crate::retention::Removal;

const MIB: u64 = 1 << 20;

/// Maximum number of entries whose files one cleanup removes.
const MAX_REMOVALS: usize = 10;

/// Space of the filesystem holding some path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceInfo {
    /// Bytes available to unprivileged users.
    pub avail: u64,
    pub total: u64,

    /// Distinguishes filesystems; 0 if unknown.
    pub fsid: u64,
}

impl SpaceInfo {
    fn used(&self) -> u64 {
        self.total.saturating_sub(self.avail)
    }
}

/// Reports free space. [`Statvfs`] asks the kernel; tests substitute their own.
pub trait DiskSpace: Send + Sync {
    fn stat(&self, path: &Path) -> Result<SpaceInfo, Error>;
}

pub struct Statvfs;

impl DiskSpace for Statvfs {
    fn stat(&self, path: &Path) -> Result<SpaceInfo, Error> {
        let s = nix::sys::statvfs::statvfs(path).map_err(|e| {
            err!(
                Unavailable,
                msg("unable to statvfs {}", path.display()),
                source(e)
            )
        })?;
        let frag = s.fragment_size() as u64;
        Ok(SpaceInfo {
            avail: frag.saturating_mul(s.blocks_available() as u64),
            total: frag.saturating_mul(s.blocks() as u64),
            fsid: s.filesystem_id() as u64,
        })
    }
}

/// Byte thresholds of one config.
#[derive(Copy, Clone, Debug)]
struct Thresholds {
    /// Free space to keep.
    free: u64,

    /// Maximum space in use; 0 for no limit.
    used: u64,
}

impl Thresholds {
    fn short(&self, info: &SpaceInfo) -> bool {
        info.avail < self.free || (self.used > 0 && info.used() > self.used)
    }
}

impl LockedDatabase {
    /// Checks the storage of every enabled config, cleaning up the first one which is short
    /// of space and being recorded to.
    pub(crate) fn space_check(&mut self) {
        let candidates: Vec<(ConfigId, Thresholds)> = self
            .configs
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(&id, c)| {
                (
                    id,
                    Thresholds {
                        free: c.cleanup_threshold_free.saturating_mul(MIB),
                        used: c.cleanup_threshold_used.saturating_mul(MIB),
                    },
                )
            })
            .filter(|(_, t)| t.free > 0 || t.used > 0)
            .collect();
        for (cid, thresholds) in candidates {
            let storage = &self.configs[&cid].storage;
            let info = match self.collab.space.stat(storage) {
                Ok(i) => i,
                Err(err) => {
                    debug!(config = %cid, %err, "skipping space check");
                    continue;
                }
            };
            if !thresholds.short(&info) {
                continue;
            }
            let recording = self
                .entries
                .values()
                .any(|e| e.config == cid && e.sched_state == SchedState::Recording);
            if !recording {
                continue;
            }
            if info.total < thresholds.free {
                warn!(
                    config = %cid,
                    total_mib = info.total / MIB,
                    free_mib = thresholds.free / MIB,
                    "storage is smaller than the free space to keep"
                );
            }
            self.space_cleanup(cid, thresholds, info);
            break;
        }
    }

    /// Removes files of the oldest maintained-space recordings of `cid` until `thresholds`
    /// hold, returning the bytes freed.
    fn space_cleanup(
        &mut self,
        cid: ConfigId,
        thresholds: Thresholds,
        mut info: SpaceInfo,
    ) -> u64 {
        let now = self.now();
        let mut freed = 0;
        let mut removed = 0;
        while thresholds.short(&info) {
            if removed == MAX_REMOVALS {
                warn!(config = %cid, freed, "unable to free enough storage space this time");
                break;
            }
            let Some((id, size)) = self.oldest_maintained(cid, now, info.fsid) else {
                warn!(config = %cid, freed, "no more recordings to remove for space");
                break;
            };
            info!(%id, config = %cid, size, "removing recording to free storage space");
            self.on_remove_files(id);
            info.avail = info.avail.saturating_add(size);
            freed += size;
            removed += 1;
        }
        freed
    }

    /// Finds the finished maintained-space entry of `cid` with files on filesystem `fsid`
    /// which stopped first, returning it with the total size of its files.
    fn oldest_maintained(&self, cid: ConfigId, now: Time, fsid: u64) -> Option<(EntryId, u64)> {
        let mut best: Option<(Time, EntryId, u64)> = None;
        for e in self.entries.values() {
            if e.config != cid
                || !matches!(e.sched_state, SchedState::Completed | SchedState::MissedTime)
                || e.file_removed
            {
                continue;
            }
            if e.removal.resolve(self.config_of(e).removal) != Removal::MaintainedSpace {
                continue;
            }
            let stop = e.stop_time(self.padding(e).1);
            if stop > now || best.is_some_and(|(t, _, _)| t <= stop) {
                continue;
            }
            let size: u64 = e.files.iter().map(|f| f.size).sum();
            let Some(first) = e.files.first() else {
                continue;
            };
            if size == 0 {
                continue;
            }
            match self.collab.space.stat(&first.filename) {
                Ok(i) if i.fsid != 0 && i.fsid == fsid => best = Some((stop, e.id, size)),
                Ok(_) => {}
                Err(err) => debug!(id = %e.id, %err, "skipping recording for space"),
            }
        }
        best.map(|(_, id, size)| (id, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FileRecord;
    use crate::retention::Retention;
    use crate::testutil::{self, TestDvr, T0};
    use crate::NewEntry;
    use base::time::{DAY, HOUR, MINUTE};

    /// Adds a completed entry which stopped at `stop`, with one file claiming `mib` MiB.
    fn completed(t: &TestDvr, title: &str, stop: Time, removal: Removal, mib: u64) -> EntryId {
        let path = t.storage().join(format!("{title}.ts"));
        std::fs::write(&path, b"ts").unwrap();
        let mut l = t.db.lock();
        let mut n = NewEntry::new(testutil::CH1, stop - HOUR, stop, title);
        n.removal = removal;
        let id = l.create(n).unwrap().unwrap();
        let e = l.entries.get_mut(&id).unwrap();
        e.sched_state = SchedState::Completed;
        e.files.push(FileRecord {
            filename: path,
            size: mib * MIB,
            start: stop - HOUR,
            stop,
            info: String::new(),
        });
        id
    }

    fn set_thresholds(t: &TestDvr, free: u64, used: u64) {
        let mut l = t.db.lock();
        let id = l.default_config_id();
        let mut c = l.config(id).unwrap().clone();
        c.cleanup_threshold_free = free;
        c.cleanup_threshold_used = used;
        l.update_config(id, c).unwrap();
    }

    fn removed(t: &TestDvr, id: EntryId) -> bool {
        t.db.lock().entry(id).unwrap().file_removed
    }

    #[test]
    fn oldest_maintained_recordings_removed_while_recording() {
        testutil::init();
        let t = TestDvr::new();
        set_thresholds(&t, 100, 0);
        t.space.set(50 * MIB, 1000 * MIB);
        let forever = completed(&t, "a", T0 - 4 * DAY, Removal::Forever, 500);
        let elsewhere = completed(&t, "b", T0 - 3 * DAY, Removal::MaintainedSpace, 30);
        t.space.other_filesystem(&t.storage().join("b.ts"));
        let oldest = completed(&t, "c", T0 - 2 * DAY, Removal::MaintainedSpace, 30);
        t.db.lock().entries.get_mut(&oldest).unwrap().retention = Retention::OnRemove;
        let older = completed(&t, "d", T0 - DAY, Removal::MaintainedSpace, 30);
        let newest = completed(&t, "e", T0 - HOUR, Removal::MaintainedSpace, 30);

        // Nothing is recording, so short space is left alone.
        t.db.lock().space_check();
        for id in [forever, elsewhere, oldest, older, newest] {
            assert!(!removed(&t, id));
        }

        let rec = t
            .db
            .lock()
            .create(NewEntry::new(testutil::CH2, T0 + HOUR, T0 + 2 * HOUR, "Live"))
            .unwrap()
            .unwrap();
        t.space.set(1 << 40, 1 << 40);
        t.advance_to(T0 + HOUR);
        assert_eq!(t.db.lock().entry(rec).unwrap().sched_state, SchedState::Recording);
        assert!(!removed(&t, oldest));

        // The next periodic check finds the storage short.
        t.space.set(50 * MIB, 1000 * MIB);
        t.advance(MINUTE);
        t.space.set(1 << 40, 1 << 40);

        // 50 + 30 + 30 MiB clears the 100 MiB threshold after two removals.
        assert!(t.db.lock().entry(oldest).is_none());
        assert!(!t.storage().join("c.ts").exists());
        assert!(removed(&t, older));
        assert!(!t.storage().join("d.ts").exists());
        assert!(!removed(&t, newest));
        assert!(!removed(&t, forever));
        assert!(!removed(&t, elsewhere));
        assert!(t.storage().join("b.ts").exists());
    }

    #[test]
    fn used_space_limit() {
        testutil::init();
        let t = TestDvr::new();
        set_thresholds(&t, 0, 900);
        let old = completed(&t, "old", T0 - DAY, Removal::MaintainedSpace, 40);
        let new = completed(&t, "new", T0 - HOUR, Removal::MaintainedSpace, 40);
        t.db
            .lock()
            .create(NewEntry::new(testutil::CH2, T0 + HOUR, T0 + 2 * HOUR, "Live"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + HOUR);
        t.space.set(50 * MIB, 1000 * MIB);
        t.db.lock().space_check();

        // 950 MiB in use drops to 910, then 870.
        assert!(removed(&t, old));
        assert!(removed(&t, new));

        // Once under the limit, a further check leaves things be.
        let newer = completed(&t, "newer", T0, Removal::MaintainedSpace, 40);
        t.space.set(130 * MIB, 1000 * MIB);
        t.db.lock().space_check();
        assert!(!removed(&t, newer));
    }

    #[test]
    fn disabled_without_thresholds() {
        testutil::init();
        let t = TestDvr::new();
        set_thresholds(&t, 0, 0);
        t.space.set(0, 1000 * MIB);
        let id = completed(&t, "x", T0 - DAY, Removal::MaintainedSpace, 40);
        t.db
            .lock()
            .create(NewEntry::new(testutil::CH2, T0 + HOUR, T0 + 2 * HOUR, "Live"))
            .unwrap()
            .unwrap();
        t.advance_to(T0 + HOUR + 5 * MINUTE);
        assert!(!removed(&t, id));
    }
}
