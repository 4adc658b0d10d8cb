// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sets up the `tracing` subscriber used by the recorder and its tests.

use tracing::error;
use tracing_core::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::{
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    Layer,
};

struct FormatSystemd;

/// Formats event timestamps in the zone used for schedules, so log lines line up with
/// the start and stop times they mention.
struct ZonedTimer;

impl FormatTime for ZonedTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
        let now = jiff::Timestamp::now().to_zoned(crate::time::global_zone());
        write!(w, "{}", now.strftime(TIME_FORMAT))
    }
}

fn systemd_prefix(level: Level) -> &'static str {
    if level >= Level::TRACE {
        "<7>" // SD_DEBUG
    } else if level >= Level::DEBUG {
        "<6>" // SD_INFO
    } else if level >= Level::INFO {
        "<5>" // SD_NOTICE
    } else if level >= Level::WARN {
        "<4>" // SD_WARN
    } else {
        "<3>" // SD_ERROR
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for FormatSystemd
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let normalized_meta = event.normalized_metadata();
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        let prefix = systemd_prefix(*meta.level());

        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed-thread");
        write!(writer, "{prefix}{thread_name} ")?;
        if let Some(scope) = ctx.event_scope() {
            let mut seen = false;

            for span in scope.from_root() {
                write!(writer, "{}", span.metadata().name())?;
                seen = true;

                let ext = span.extensions();
                if let Some(fields) = &ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                writer.write_char(':')?;
            }

            if seen {
                writer.write_char(' ')?;
            }
        }

        write!(writer, "{}: ", meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Custom panic hook that logs instead of directly writing to stderr.
///
/// This means it includes a timestamp, follows [OpenTelemetry Semantic
/// Conventions for Exceptions](https://opentelemetry.io/docs/reference/specification/logs/semantic_conventions/exceptions/),
/// etc.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

/// Output format, selected by the `PVR_FORMAT` environment variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Format {
    /// Human-readable lines with local timestamps and thread names.
    Human,

    /// Lines with a syslog priority prefix and no timestamp, for journald.
    Systemd,

    /// One JSON object per event.
    Json,
}

impl Format {
    fn from_env() -> Self {
        match std::env::var("PVR_FORMAT").as_deref() {
            Ok("systemd") => Format::Systemd,
            Ok("json") => Format::Json,
            _ => Format::Human,
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("PVR_LOG")
        .from_env_lossy()
}

fn set_global<S>(sub: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("unable to bridge log records into tracing: {e}");
    }
    if let Err(e) = tracing::subscriber::set_global_default(sub) {
        eprintln!("unable to install tracing subscriber: {e}");
    }
}

/// Installs the process-wide subscriber.
///
/// Filtering follows `PVR_LOG` (`EnvFilter` syntax, default `info`). A panic hook which
/// logs panics is installed unless `PVR_PANIC_HOOK` is `false` or `0`.
pub fn install() {
    let filter = env_filter();
    let layer = tracing_subscriber::fmt::Layer::new().with_writer(std::io::stderr);
    match Format::from_env() {
        Format::Systemd => set_global(
            tracing_subscriber::registry().with(
                layer
                    .with_ansi(false)
                    .event_format(FormatSystemd)
                    .with_filter(filter),
            ),
        ),
        Format::Json => set_global(
            tracing_subscriber::registry()
                .with(layer.with_thread_names(true).json().with_filter(filter)),
        ),
        Format::Human => set_global(
            tracing_subscriber::registry().with(
                layer
                    .with_timer(ZonedTimer)
                    .with_thread_names(true)
                    .with_filter(filter),
            ),
        ),
    }

    let use_panic_hook = std::env::var("PVR_PANIC_HOOK")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);
    if use_panic_hook {
        std::panic::set_hook(Box::new(&panic_hook));
    }
}

/// Installs a subscriber which writes through the test harness's capture.
pub fn install_for_tests() {
    set_global(
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_test_writer()
                .with_timer(ZonedTimer)
                .with_thread_names(true)
                .with_filter(env_filter()),
        ),
    );
}
