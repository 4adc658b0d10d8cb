// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The persisted form of entries.
//!
//! Scheduling state is not stored: it's recomputed from the times, the files and the
//! `noResched` flag when the database loads.

use base::time::{Duration, Time};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::autorec::AutorecId;
use crate::channel::ChannelId;
use crate::config::ConfigId;
use crate::entry::{DvrEntry, EntryId, FileRecord, NewEntry, Priority};
use crate::epg::{BroadcastId, LangStr};
use crate::retention::{Removal, Retention};
use crate::streaming::StreamCode;
use crate::timerec::TimerecId;

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDoc {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created: Time,
    pub start: Time,
    pub stop: Time,
    #[serde(default)]
    pub start_extra: Duration,
    #[serde(default)]
    pub stop_extra: Duration,
    #[serde(default)]
    pub channel: Option<ChannelId>,
    #[serde(default)]
    pub channel_name: String,

    /// `None` or an unknown id selects the default config.
    #[serde(default)]
    pub config: Option<ConfigId>,

    #[serde(default)]
    pub title: LangStr,
    #[serde(default)]
    pub subtitle: LangStr,
    #[serde(default)]
    pub summary: LangStr,
    #[serde(default)]
    pub description: LangStr,
    #[serde(default)]
    pub content_type: u8,
    #[serde(default)]
    pub episode: String,
    #[serde(default)]
    pub episode_uri: Option<String>,
    #[serde(default)]
    pub copyright_year: u16,
    #[serde(default)]
    pub dvb_eid: u16,
    #[serde(default)]
    pub broadcast: Option<BroadcastId>,
    #[serde(default)]
    pub files: Vec<FileRecord>,

    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub removal: Removal,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub comment: String,

    #[serde(default)]
    pub autorec: Option<AutorecId>,
    #[serde(default)]
    pub timerec: Option<TimerecId>,
    #[serde(default)]
    pub parent: Option<EntryId>,
    #[serde(default)]
    pub child: Option<EntryId>,

    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub data_errors: u32,
    #[serde(default)]
    pub last_error: StreamCode,
    #[serde(default, rename = "noResched")]
    pub dont_reschedule: bool,
    #[serde(default, rename = "noRerecord")]
    pub dont_rerecord: bool,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub play_pos: Duration,
    #[serde(default)]
    pub file_removed: bool,

    /// Fields written by other versions, preserved on rewrite.
    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}

impl EntryDoc {
    pub fn from_entry(e: &DvrEntry) -> Self {
        EntryDoc {
            enabled: e.enabled,
            created: e.created,
            start: e.start,
            stop: e.stop,
            start_extra: e.start_extra,
            stop_extra: e.stop_extra,
            channel: e.channel,
            channel_name: e.channel_name.clone(),
            config: Some(e.config),
            title: e.title.clone(),
            subtitle: e.subtitle.clone(),
            summary: e.summary.clone(),
            description: e.description.clone(),
            content_type: e.content_type,
            episode: e.episode.clone(),
            episode_uri: e.episode_uri.clone(),
            copyright_year: e.copyright_year,
            dvb_eid: e.dvb_eid,
            broadcast: e.broadcast,
            files: e.files.clone(),
            priority: e.priority,
            retention: e.retention,
            removal: e.removal,
            owner: e.owner.clone(),
            creator: e.creator.clone(),
            comment: e.comment.clone(),
            autorec: e.autorec,
            timerec: e.timerec,
            parent: e.parent,
            child: e.child,
            errors: e.errors,
            data_errors: e.data_errors,
            last_error: e.last_error,
            dont_reschedule: e.dont_reschedule,
            dont_rerecord: e.dont_rerecord,
            play_count: e.play_count,
            play_pos: e.play_pos,
            file_removed: e.file_removed,
            unknown: e.unknown.clone(),
        }
    }

    /// Builds the in-memory entry. `config` is the already-resolved config id.
    pub(crate) fn into_entry(self, id: EntryId, seq: u64, config: ConfigId) -> DvrEntry {
        let mut n = NewEntry::new(self.channel.unwrap_or_default(), self.start, self.stop, "");
        n.enabled = self.enabled;
        let mut e = DvrEntry::new(id, seq, self.created, config, n);
        e.start_extra = self.start_extra;
        e.stop_extra = self.stop_extra;
        e.channel = self.channel;
        e.channel_name = self.channel_name;
        e.title = self.title;
        e.subtitle = self.subtitle;
        e.summary = self.summary;
        e.description = self.description;
        e.content_type = self.content_type;
        e.episode = self.episode;
        e.episode_uri = self.episode_uri;
        e.copyright_year = self.copyright_year;
        e.dvb_eid = self.dvb_eid;
        e.broadcast = self.broadcast;
        e.files = self.files;
        e.priority = self.priority;
        e.retention = self.retention;
        e.removal = self.removal;
        e.owner = self.owner;
        e.creator = self.creator;
        e.comment = self.comment;
        e.autorec = self.autorec;
        e.timerec = self.timerec;
        e.parent = self.parent;
        e.child = self.child;
        e.errors = self.errors;
        e.data_errors = self.data_errors;
        e.last_error = self.last_error;
        e.dont_reschedule = self.dont_reschedule;
        e.dont_rerecord = self.dont_rerecord;
        e.play_count = self.play_count;
        e.play_pos = self.play_pos;
        e.file_removed = self.file_removed;
        e.unknown = self.unknown;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_doc_fills_defaults() {
        let d: EntryDoc = serde_json::from_str(r#"{"start": 1000, "stop": 2000}"#).unwrap();
        assert!(d.enabled);
        assert_eq!(d.priority, Priority::NotSet);
        assert_eq!(d.retention, Retention::Config);
        assert_eq!(d.last_error, StreamCode::Ok);
        assert!(d.files.is_empty());
    }

    #[test]
    fn round_trip() {
        let text = r#"{
            "enabled": false,
            "created": 5,
            "start": 1000,
            "stop": 2000,
            "startExtra": 300,
            "stopExtra": 0,
            "channel": 7,
            "channelName": "One",
            "config": null,
            "title": {"eng": "News", "ger": "Nachrichten"},
            "subtitle": {},
            "summary": {},
            "description": {},
            "contentType": 2,
            "episode": "S01E02",
            "episodeUri": "crid://x/1",
            "copyrightYear": 1999,
            "dvbEid": 17,
            "broadcast": 99,
            "files": [{"filename": "/r/a.ts", "size": 10, "start": 1000, "stop": 2000, "info": "h264"}],
            "priority": "high",
            "retention": {"days": 3},
            "removal": "forever",
            "owner": "bob",
            "creator": "web",
            "comment": "",
            "autorec": null,
            "timerec": null,
            "parent": null,
            "child": null,
            "errors": 1,
            "dataErrors": 2,
            "lastError": "badSource",
            "noResched": true,
            "noRerecord": false,
            "playCount": 3,
            "playPos": 60,
            "fileRemoved": false,
            "someFutureField": [1, 2]
        }"#;
        let doc: EntryDoc = serde_json::from_str(text).unwrap();
        let config = ConfigId::generate();
        let e = doc.clone().into_entry(EntryId::generate(), 0, config);
        assert_eq!(e.title.get(Some("eng")), Some("News"));
        assert_eq!(e.retention, Retention::Days(3));
        assert_eq!(e.last_error, StreamCode::BadSource);
        let mut expected = doc;
        expected.config = Some(config);
        assert_eq!(EntryDoc::from_entry(&e), expected);
        assert!(EntryDoc::from_entry(&e).unknown.contains_key("someFutureField"));
    }
}
