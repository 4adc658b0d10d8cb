// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock times and durations at the one-second resolution used by schedules.

use std::fmt;
use std::ops;
use std::sync::OnceLock;

use jiff::tz::TimeZone;
use jiff::{Timestamp, Zoned};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const MINUTE: Duration = Duration(60);
pub const HOUR: Duration = Duration(3600);
pub const DAY: Duration = Duration(86_400);

static GLOBAL_ZONE: OnceLock<RwLock<TimeZone>> = OnceLock::new();

fn zone_cell() -> &'static RwLock<TimeZone> {
    GLOBAL_ZONE.get_or_init(|| RwLock::new(TimeZone::system()))
}

/// Returns the zone used for all local-time calculations (daily timers, weekday filters,
/// calendar-based duplicate detection, log output).
pub fn global_zone() -> TimeZone {
    zone_cell().read().clone()
}

/// Overrides the zone returned by [`global_zone`]. Used by tests.
pub fn set_global_zone(tz: TimeZone) {
    *zone_cell().write() = tz;
}

/// A time specified as whole seconds since 1970-01-01 00:00:00 UTC.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    pub fn as_secs(self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Time(self.0.saturating_add(d.0))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Time(self.0.saturating_sub(d.0))
    }

    /// Returns this time in the [`global_zone`], or `None` if out of jiff's supported range.
    pub fn to_zoned(self) -> Option<Zoned> {
        Timestamp::from_second(self.0)
            .ok()
            .map(|ts| ts.to_zoned(global_zone()))
    }

    pub fn from_zoned(z: &Zoned) -> Self {
        Time(z.timestamp().as_second())
    }
}

impl From<Timestamp> for Time {
    fn from(ts: Timestamp) -> Self {
        Time(ts.as_second())
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_zoned() {
            Some(z) => write!(f, "{}", z.strftime("%Y-%m-%dT%H:%M:%S%:z")),
            None => write!(f, "@{}", self.0),
        }
    }
}

/// A duration specified in whole seconds. May be negative.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Duration(pub i64);

impl Duration {
    pub const ZERO: Self = Duration(0);

    pub fn from_minutes(m: i64) -> Self {
        Duration(m * 60)
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }

    /// Converts to a `std::time::Duration`, mapping negative values to zero.
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.max(0) as u64)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut secs = self.0;
        if secs < 0 {
            f.write_str("-")?;
            secs = -secs;
        }
        let (days, hours, mins, secs) = (
            secs / 86_400,
            (secs / 3600) % 24,
            (secs / 60) % 60,
            secs % 60,
        );
        let mut have_written = false;
        for (n, unit) in [(days, "day"), (hours, "hour"), (mins, "minute"), (secs, "second")] {
            if n == 0 {
                continue;
            }
            write!(
                f,
                "{}{} {}{}",
                if have_written { " " } else { "" },
                n,
                unit,
                if n == 1 { "" } else { "s" }
            )?;
            have_written = true;
        }
        if !have_written {
            f.write_str("0 seconds")?;
        }
        Ok(())
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Duration;
    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl ops::Mul<Duration> for i64 {
    type Output = Duration;
    fn mul(self, rhs: Duration) -> Duration {
        Duration(self * rhs.0)
    }
}

impl ops::Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}
