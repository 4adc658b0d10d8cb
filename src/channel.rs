// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Channels and the services (tuner inputs) which carry them.

use base::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(
    Copy, Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// How a service reaches the recorder; determines which physical device it occupies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceKind {
    /// A DVB service. All services on one mux can share an adapter.
    Dvb { adapter: String, mux: String },

    /// An IP stream. Unlimited concurrency.
    Iptv,

    /// An analog capture device, which holds exactly one service at a time.
    Analog { device: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Service {
    pub name: String,
    pub kind: ServiceKind,
}

#[derive(Clone, Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub enabled: bool,

    /// Services in order of preference.
    pub services: Vec<Service>,

    /// Names of the channel tags this channel belongs to.
    pub tags: Vec<String>,

    /// Padding overrides; zero means "use the DVR config's".
    pub extra_pre: Duration,
    pub extra_post: Duration,
}

impl Channel {
    pub fn new(id: u32, name: &str) -> Self {
        Channel {
            id: ChannelId(id),
            name: name.to_owned(),
            enabled: true,
            services: Vec::new(),
            tags: Vec::new(),
            extra_pre: Duration::ZERO,
            extra_post: Duration::ZERO,
        }
    }

    pub fn with_service(mut self, name: &str, kind: ServiceKind) -> Self {
        self.services.push(Service {
            name: name.to_owned(),
            kind,
        });
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
