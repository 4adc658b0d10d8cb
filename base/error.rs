// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::error::Error as StdError;
use std::fmt;

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// An error with a coarse [`ErrorKind`], an optional message, and an optional source.
///
/// Construct with the [`err!`](crate::err) and [`bail!`](crate::bail) macros.
pub struct Error(Box<ErrorInner>);

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedSource>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn with_msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn with_source<E: Into<BoxedSource>>(mut self, source: E) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` of this error and every error in its source chain, for logging.
    pub fn chain(&self) -> impl fmt::Display + '_ {
        ErrorChain(self)
    }
}

struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, "\ncaused by: {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            None => fmt::Display::fmt(&self.0.kind, f),
            Some(m) => write!(f, "{}: {}", self.0.kind, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source.as_deref().map(|s| s as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for descriptions of
/// each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    /// Example:
    /// ```
    /// use pvr_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<BoxedSource>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_source(e))
    }
}

/// Constructs an [`Error`] of the given kind, with optional `msg(...)` and `source(...)`.
///
/// ```
/// use pvr_base::err;
/// let e = err!(NotFound, msg("no such channel {}", 42));
/// assert_eq!(e.kind(), pvr_base::ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no such channel 42");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident $(, msg($($msg:tt)+))? $(, source($src:expr))? $(,)?) => {{
        #[allow(unused_mut)]
        let mut e = $crate::Error::new($crate::ErrorKind::$kind);
        $( e = e.with_msg(format!($($msg)+)); )?
        $( e = e.with_source($src); )?
        e
    }};
}

/// Returns early with an [`Error`]; takes the same arguments as [`err!`](crate::err).
///
/// ```
/// use pvr_base::bail;
/// let e = || -> Result<(), pvr_base::Error> {
///     bail!(PermissionDenied, msg("user {:?} may not record", "bob"));
/// }().unwrap_err();
/// assert_eq!(e.kind(), pvr_base::ErrorKind::PermissionDenied);
/// ```
#[macro_export]
macro_rules! bail {
    ($($t:tt)+) => {
        return Err($crate::err!($($t)+).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = crate::err!(Internal, msg("unable to save"), source(io));
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert_eq!(
            e.chain().to_string(),
            "Internal: unable to save\ncaused by: disk on fire"
        );
    }

    #[test]
    fn kind_only() {
        let e = crate::err!(Aborted);
        assert_eq!(e.to_string(), "Aborted");
        assert!(e.msg().is_none());
    }
}
