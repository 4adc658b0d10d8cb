// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Who may record, and how much at once.

use crate::streaming::StreamCode;

/// Permissions of one user, as supplied by the access-control subsystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Access {
    pub username: String,
    pub can_record: bool,

    /// Maximum number of simultaneous recordings owned by this user; 0 means unlimited.
    pub dvr_conn_limit: u32,
}

impl Access {
    pub fn unrestricted(username: &str) -> Self {
        Access {
            username: username.to_owned(),
            can_record: true,
            dvr_conn_limit: 0,
        }
    }

    /// Checks whether a new recording may start given `active` recordings already running
    /// for this user.
    pub fn check_recording(&self, active: u32) -> Result<(), StreamCode> {
        if !self.can_record {
            return Err(StreamCode::UserAccess);
        }
        if self.dvr_conn_limit > 0 && active >= self.dvr_conn_limit {
            return Err(StreamCode::UserLimit);
        }
        Ok(())
    }
}

pub trait AccessControl: Send + Sync {
    /// Looks up the access of the named user. An empty name is the system itself.
    fn lookup(&self, username: &str) -> Option<Access>;
}

/// Grants every user unlimited recording.
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn lookup(&self, username: &str) -> Option<Access> {
        Some(Access::unrestricted(username))
    }
}
