// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Retention and removal policies, and the instants at which they take effect.
//!
//! *Retention* governs how long the entry (the log) is kept; *removal* governs how long its
//! files are kept. Both count from the entry's stop time.

use base::time::{Time, DAY};
use serde::{Deserialize, Serialize};

/// How long a finished entry is kept.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Retention {
    /// Use the DVR config's policy.
    #[default]
    Config,
    Days(u32),

    /// Keep the entry until its files are removed.
    OnRemove,
    Forever,
}

/// How long a finished entry's files are kept.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Removal {
    /// Use the DVR config's policy.
    #[default]
    Config,
    Days(u32),

    /// Keep until the config's storage runs short while recording; see [`crate::space`].
    MaintainedSpace,
    Forever,
}

impl Retention {
    /// Resolves `Config` against the config's policy.
    pub fn resolve(self, config: Retention) -> Retention {
        match (self, config) {
            (Retention::Config, Retention::Config) => Retention::Forever,
            (Retention::Config, c) => c,
            (r, _) => r,
        }
    }
}

impl Removal {
    pub fn resolve(self, config: Removal) -> Removal {
        match (self, config) {
            (Removal::Config, Removal::Config) => Removal::Forever,
            (Removal::Config, c) => c,
            (r, _) => r,
        }
    }
}

fn days_after(stop: Time, days: u32) -> Time {
    stop.saturating_add(DAY * i64::from(days))
}

/// Returns when the entry should be expired, or `None` if that isn't time-based.
pub fn log_expiry(stop: Time, retention: Retention) -> Option<Time> {
    match retention {
        Retention::Days(d) => Some(days_after(stop, d)),
        Retention::Config | Retention::OnRemove | Retention::Forever => None,
    }
}

/// Returns when the entry's files should be removed, or `None` if that isn't time-based.
pub fn file_expiry(stop: Time, removal: Removal) -> Option<Time> {
    match removal {
        Removal::Days(d) => Some(days_after(stop, d)),
        Removal::Config | Removal::MaintainedSpace | Removal::Forever => None,
    }
}

/// The next retention step for a finished entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Plan {
    /// Arm a timer to remove the files at the given time.
    RemoveFilesAt(Time),

    /// The removal time has passed: remove the files now, then plan again.
    RemoveFilesNow,

    /// Arm a timer to destroy the entry at the given time.
    ExpireAt(Time),

    /// Nothing is time-based; keep everything.
    Keep,
}

/// Decides the next retention step. `retention` and `removal` must already be resolved.
///
/// Files go first; the log's own expiry is only considered once no files remain (or their
/// removal isn't time-based).
pub fn plan(
    now: Time,
    stop: Time,
    retention: Retention,
    removal: Removal,
    has_files: bool,
) -> Plan {
    if has_files {
        if let Some(t) = file_expiry(stop, removal) {
            return if t > now {
                Plan::RemoveFilesAt(t)
            } else {
                Plan::RemoveFilesNow
            };
        }
    }
    match log_expiry(stop, retention) {
        Some(t) => Plan::ExpireAt(t),
        None => Plan::Keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP: Time = Time(1_000_000);

    #[test]
    fn resolve() {
        assert_eq!(
            Retention::Config.resolve(Retention::Days(3)),
            Retention::Days(3)
        );
        assert_eq!(
            Retention::Days(1).resolve(Retention::Days(3)),
            Retention::Days(1)
        );
        assert_eq!(
            Retention::Config.resolve(Retention::Config),
            Retention::Forever
        );
        assert_eq!(
            Removal::Config.resolve(Removal::MaintainedSpace),
            Removal::MaintainedSpace
        );
    }

    #[test]
    fn expiries() {
        assert_eq!(log_expiry(STOP, Retention::Days(2)), Some(Time(1_172_800)));
        assert_eq!(log_expiry(STOP, Retention::OnRemove), None);
        assert_eq!(file_expiry(STOP, Removal::Days(0)), Some(STOP));
        assert_eq!(file_expiry(STOP, Removal::Forever), None);
        assert_eq!(log_expiry(Time::MAX, Retention::Days(1)), Some(Time::MAX));
    }

    #[test]
    fn plans() {
        let now = Time(1_050_000);
        assert_eq!(
            plan(now, STOP, Retention::Days(30), Removal::Days(1), true),
            Plan::RemoveFilesAt(Time(1_086_400))
        );
        assert_eq!(
            plan(now, STOP, Retention::Days(30), Removal::Days(0), true),
            Plan::RemoveFilesNow
        );
        assert_eq!(
            plan(now, STOP, Retention::Days(30), Removal::Days(0), false),
            Plan::ExpireAt(Time(3_592_000))
        );
        assert_eq!(
            plan(now, STOP, Retention::Forever, Removal::Forever, true),
            Plan::Keep
        );
        assert_eq!(
            plan(now, STOP, Retention::OnRemove, Removal::MaintainedSpace, true),
            Plan::Keep
        );
    }
}
