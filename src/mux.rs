// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Container backends which write a recording's packets to storage.

use std::fs;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use base::{bail, err, Error};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::streaming::{Packet, StreamStart};

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Container {
    #[default]
    MpegTs,
    Matroska,

    /// Writes the source's packets untouched.
    Pass,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::MpegTs | Container::Pass => "ts",
            Container::Matroska => "mkv",
        }
    }

    /// Whether the container can absorb a change of elementary streams mid-file.
    fn reconfigurable(self) -> bool {
        !matches!(self, Container::Matroska)
    }
}

/// Writes one recording file. Owned by the recording thread.
pub trait Muxer: Send {
    fn open(&mut self, path: &Path, start: &StreamStart) -> Result<(), Error>;

    /// Adapts to a new set of elementary streams without closing the file.
    fn reconfigure(&mut self, start: &StreamStart) -> Result<(), Error>;

    fn write(&mut self, pkt: &Packet) -> Result<(), Error>;

    /// Marks a programme/commercial boundary.
    fn add_marker(&mut self) -> Result<(), Error>;

    /// Flushes and closes the file, returning its size in bytes.
    fn close(&mut self) -> Result<u64, Error>;
}

pub trait MuxerFactory: Send + Sync {
    fn create(&self, container: Container) -> Box<dyn Muxer>;
}

/// Writes packet payloads sequentially to a plain file.
pub struct FileMuxer {
    container: Container,
    out: Option<BufWriter<fs::File>>,
    start: Option<StreamStart>,
    bytes: u64,
    markers: u32,
}

impl FileMuxer {
    pub fn new(container: Container) -> Self {
        FileMuxer {
            container,
            out: None,
            start: None,
            bytes: 0,
            markers: 0,
        }
    }

    pub fn markers(&self) -> u32 {
        self.markers
    }
}

impl Muxer for FileMuxer {
    fn open(&mut self, path: &Path, start: &StreamStart) -> Result<(), Error> {
        if self.out.is_some() {
            bail!(FailedPrecondition, msg("muxer already open"));
        }
        let f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| err!(Unavailable, msg("unable to create {}", path.display()), source(e)))?;
        debug!(path = %path.display(), "opened recording file");
        self.out = Some(BufWriter::new(f));
        self.start = Some(start.clone());
        Ok(())
    }

    fn reconfigure(&mut self, start: &StreamStart) -> Result<(), Error> {
        let Some(cur) = &self.start else {
            bail!(FailedPrecondition, msg("muxer not open"));
        };
        if cur.streams != start.streams && !self.container.reconfigurable() {
            bail!(
                Unimplemented,
                msg("{:?} can't change streams mid-file", self.container)
            );
        }
        self.start = Some(start.clone());
        Ok(())
    }

    fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        let Some(out) = &mut self.out else {
            bail!(FailedPrecondition, msg("muxer not open"));
        };
        out.write_all(&pkt.data)
            .map_err(|e| err!(Unavailable, msg("write failed"), source(e)))?;
        self.bytes += pkt.data.len() as u64;
        Ok(())
    }

    fn add_marker(&mut self) -> Result<(), Error> {
        self.markers += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<u64, Error> {
        let Some(out) = self.out.take() else {
            return Ok(self.bytes);
        };
        let f = out
            .into_inner()
            .map_err(|e| err!(Unavailable, msg("flush failed"), source(e.into_error())))?;
        f.sync_all()
            .map_err(|e| err!(Unavailable, msg("sync failed"), source(e)))?;
        Ok(self.bytes)
    }
}

/// Creates a [`FileMuxer`] for every container.
pub struct FileMuxerFactory;

impl MuxerFactory for FileMuxerFactory {
    fn create(&self, container: Container) -> Box<dyn Muxer> {
        Box::new(FileMuxer::new(container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{ElementaryStream, StreamKind};
    use bytes::Bytes;

    fn start(codecs: &[&str]) -> StreamStart {
        StreamStart {
            source_name: "test".to_owned(),
            streams: codecs
                .iter()
                .enumerate()
                .map(|(i, c)| ElementaryStream {
                    index: i as u32,
                    kind: StreamKind::Video,
                    codec: (*c).to_owned(),
                    language: None,
                })
                .collect(),
        }
    }

    fn pkt(data: &'static [u8]) -> Packet {
        Packet {
            stream: 0,
            dts: Some(0),
            pts: Some(0),
            commercial: None,
            errors: 0,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn writes_and_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.ts");
        let mut m = FileMuxer::new(Container::MpegTs);
        m.open(&path, &start(&["h264"])).unwrap();
        m.write(&pkt(b"hello ")).unwrap();
        m.add_marker().unwrap();
        m.write(&pkt(b"world")).unwrap();
        assert_eq!(m.close().unwrap(), 11);
        assert_eq!(m.markers(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.ts");
        std::fs::write(&path, b"x").unwrap();
        let mut m = FileMuxer::new(Container::MpegTs);
        let e = m.open(&path, &start(&["h264"])).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unavailable);
    }

    #[test]
    fn matroska_rejects_stream_change() {
        let tmp = tempfile::tempdir().unwrap();
        let mut m = FileMuxer::new(Container::Matroska);
        m.open(&tmp.path().join("a.mkv"), &start(&["h264"])).unwrap();
        m.reconfigure(&start(&["h264"])).unwrap();
        m.reconfigure(&start(&["hevc"])).unwrap_err();

        let mut m = FileMuxer::new(Container::MpegTs);
        m.open(&tmp.path().join("a.ts"), &start(&["h264"])).unwrap();
        m.reconfigure(&start(&["hevc"])).unwrap();
    }
}
