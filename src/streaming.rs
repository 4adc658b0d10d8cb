// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Messages from a tuner subscription to a recording, and the queue carrying them.

use std::collections::VecDeque;
use std::sync::Arc;

use base::{bail, Condvar, Error, Mutex};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;

/// Outcome codes for subscriptions and recordings. `Ok` is the only success.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamCode {
    #[default]
    Ok,
    UndefinedError,
    SourceReconfigured,
    BadSource,
    SourceDeleted,
    SubscriptionOverridden,
    InvalidTarget,
    UserAccess,
    UserLimit,
    WeakStream,
    Aborted,
    NoFreeAdapter,
    MuxNotEnabled,
    TuningFailed,
    SvcNotEnabled,
    BadSignal,
    NoSource,
    NoService,
    NoDescrambler,
    NoAccess,
    NoInput,
    NoSpace,
    DataTimeout,
}

impl StreamCode {
    pub fn is_ok(self) -> bool {
        self == StreamCode::Ok
    }

    /// Returns true for codes that count against a recording's error total. A reconfigured
    /// source is expected to restart on its own.
    pub fn is_error(self) -> bool {
        !matches!(self, StreamCode::Ok | StreamCode::SourceReconfigured)
    }

    pub fn text(self) -> &'static str {
        match self {
            StreamCode::Ok => "OK",
            StreamCode::UndefinedError => "Unknown error",
            StreamCode::SourceReconfigured => "Source reconfigured",
            StreamCode::BadSource => "Source quality is bad",
            StreamCode::SourceDeleted => "Source deleted",
            StreamCode::SubscriptionOverridden => "Subscription overridden",
            StreamCode::InvalidTarget => "Invalid target",
            StreamCode::UserAccess => "User access error",
            StreamCode::UserLimit => "User limit reached",
            StreamCode::WeakStream => "Weak stream",
            StreamCode::Aborted => "Aborted by user",
            StreamCode::NoFreeAdapter => "No free adapter",
            StreamCode::MuxNotEnabled => "Mux not enabled",
            StreamCode::TuningFailed => "Tuning failed",
            StreamCode::SvcNotEnabled => "No service enabled",
            StreamCode::BadSignal => "Signal quality too poor",
            StreamCode::NoSource => "No source available",
            StreamCode::NoService => "No service assigned to channel",
            StreamCode::NoDescrambler => "No descrambler",
            StreamCode::NoAccess => "No access",
            StreamCode::NoInput => "No input detected",
            StreamCode::NoSpace => "Not enough disk space",
            StreamCode::DataTimeout => "Data timeout",
        }
    }
}

impl std::fmt::Display for StreamCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ElementaryStream {
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub language: Option<String>,
}

/// Describes the elementary streams which follow a [`StreamMessage::Start`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamStart {
    pub source_name: String,
    pub streams: Vec<ElementaryStream>,
}

impl StreamStart {
    /// The stream whose timestamps anchor the recording: the first video stream, else the
    /// first audio stream.
    pub fn reference_stream(&self) -> Option<u32> {
        self.streams
            .iter()
            .find(|s| s.kind == StreamKind::Video)
            .or_else(|| self.streams.iter().find(|s| s.kind == StreamKind::Audio))
            .map(|s| s.index)
    }

    /// A one-line summary for the file record.
    pub fn summary(&self) -> String {
        let mut out = self.source_name.clone();
        for s in &self.streams {
            out.push_str(if out.is_empty() { "" } else { ", " });
            out.push_str(&s.codec);
            if let Some(l) = &s.language {
                out.push('/');
                out.push_str(l);
            }
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub stream: u32,
    pub dts: Option<i64>,
    pub pts: Option<i64>,

    /// The broadcaster's commercial flag, if any.
    pub commercial: Option<bool>,

    /// Transport errors observed while receiving this packet.
    pub errors: u32,
    pub data: Bytes,
}

/// Transport status flags reported by a subscription.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransportStatus {
    pub packets: bool,
    pub grace_period: bool,
    pub errors: bool,
    pub no_descrambler: bool,
    pub no_access: bool,
    pub no_input: bool,
}

impl TransportStatus {
    /// Maps the flags to an error code, or `None` if the stream is healthy or still settling.
    pub fn code(&self) -> Option<StreamCode> {
        if self.packets {
            return None;
        }
        if !(self.grace_period || self.errors || self.no_input) {
            return None;
        }
        Some(if self.no_access {
            StreamCode::NoAccess
        } else if self.no_descrambler {
            StreamCode::NoDescrambler
        } else if self.no_input {
            StreamCode::NoInput
        } else {
            StreamCode::UndefinedError
        })
    }
}

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Start(Arc<StreamStart>),
    Packet(Packet),
    Stop(StreamCode),
    ServiceStatus(TransportStatus),
    NoStart(StreamCode),

    /// Tells the recording thread to exit. Sent only by the recorder itself.
    Exit,
}

/// FIFO of [`StreamMessage`]s with its own lock, independent of the database lock.
#[derive(Default)]
pub struct StreamingQueue {
    messages: Mutex<VecDeque<StreamMessage>>,
    cond: Condvar,
}

impl StreamingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(StreamingQueue::default())
    }

    pub fn deliver(&self, msg: StreamMessage) {
        self.messages.lock().push_back(msg);
        self.cond.notify_one();
    }

    /// Blocks until a message is available and returns it.
    pub fn next(&self) -> StreamMessage {
        let mut l = self.messages.lock();
        loop {
            if let Some(m) = l.pop_front() {
                return m;
            }
            self.cond.wait(&mut l);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

/// An active tuner subscription. Dropping it without `unsubscribe` leaks the tuner.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

/// The tuner subsystem.
pub trait Subscriber: Send + Sync {
    /// Subscribes to `channel` at `weight`; messages are delivered to `target` until
    /// unsubscribed.
    fn subscribe(
        &self,
        channel: &Channel,
        weight: u32,
        profile: &str,
        target: Arc<StreamingQueue>,
    ) -> Result<Box<dyn Subscription>, Error>;
}

/// A [`Subscriber`] with no tuners attached; every subscription fails.
pub struct NoTuners;

impl Subscriber for NoTuners {
    fn subscribe(
        &self,
        channel: &Channel,
        _weight: u32,
        _profile: &str,
        _target: Arc<StreamingQueue>,
    ) -> Result<Box<dyn Subscription>, Error> {
        bail!(Unavailable, msg("no tuner can receive {}", channel.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn es(index: u32, kind: StreamKind, codec: &str) -> ElementaryStream {
        ElementaryStream {
            index,
            kind,
            codec: codec.to_owned(),
            language: None,
        }
    }

    #[test]
    fn reference_stream_prefers_video() {
        let mut s = StreamStart {
            source_name: "test".to_owned(),
            streams: vec![es(1, StreamKind::Audio, "aac"), es(2, StreamKind::Video, "h264")],
        };
        assert_eq!(s.reference_stream(), Some(2));
        s.streams.remove(1);
        assert_eq!(s.reference_stream(), Some(1));
        s.streams.clear();
        assert_eq!(s.reference_stream(), None);
    }

    #[test]
    fn transport_status_codes() {
        let mut st = TransportStatus {
            packets: true,
            errors: true,
            ..Default::default()
        };
        assert_eq!(st.code(), None);
        st.packets = false;
        assert_eq!(st.code(), Some(StreamCode::UndefinedError));
        st.no_descrambler = true;
        assert_eq!(st.code(), Some(StreamCode::NoDescrambler));
        st.no_access = true;
        assert_eq!(st.code(), Some(StreamCode::NoAccess));
    }

    #[test]
    fn queue_is_fifo_across_threads() {
        let q = StreamingQueue::new();
        let q2 = q.clone();
        let h = std::thread::spawn(move || {
            let mut got = Vec::new();
            loop {
                match q2.next() {
                    StreamMessage::Stop(c) => got.push(c),
                    StreamMessage::Exit => return got,
                    _ => {}
                }
            }
        });
        q.deliver(StreamMessage::Stop(StreamCode::BadSource));
        q.deliver(StreamMessage::Stop(StreamCode::Ok));
        q.deliver(StreamMessage::Exit);
        assert_eq!(h.join().unwrap(), vec![StreamCode::BadSource, StreamCode::Ok]);
    }
}
