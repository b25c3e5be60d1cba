use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Once;

use slate_config::Environment;
use thiserror::Error;
use tracing::error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Directory the production log files are written to, relative to the
/// service's working directory.
const LOG_DIR: &str = "logs";

/// How many rotated files are kept per service before the oldest is pruned.
const MAX_LOG_FILES: usize = 5;

/// Errors raised while wiring up telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("could not create the rolling log appender: {0}")]
    Appender(#[from] InitError),

    #[error("could not bridge `log` records into tracing: {0}")]
    LogBridge(#[from] tracing_log::log_tracer::SetLoggerError),

    #[error("could not install the global subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),

    #[error("could not determine the runtime environment: {0}")]
    Environment(#[from] std::io::Error),
}

/// Keeps the non-blocking file appender alive.
///
/// Dropping the guard flushes buffered log lines to disk, so the service
/// holds it until shutdown. Console logging has nothing to flush and carries
/// `None`.
#[must_use]
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the tracing subscriber for a SLATE service.
///
/// Production and staging write structured JSON to daily-rotated files under
/// `logs/`; development pretty-prints to the console. `RUST_LOG` overrides
/// the default `info` filter. `log` records from libraries and panics are
/// routed into the same stream.
pub fn init_tracing(service: &str) -> Result<TelemetryGuard, TelemetryError> {
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if Environment::detect()?.logs_to_files() {
        let appender = rolling::Builder::new()
            .filename_prefix(service)
            .filename_suffix("log")
            .rotation(rolling::Rotation::DAILY)
            .max_log_files(MAX_LOG_FILES)
            .build(LOG_DIR)?;
        // Non-blocking writer so logging never stalls request handling.
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .event_format(fmt::format().with_ansi(false).with_target(false))
            .with_writer(writer)
            .json()
            .with_current_span(true)
            .with_span_list(true);
        set_global_default(Registry::default().with(filter).with(file_layer))?;

        Some(guard)
    } else {
        let console_layer = fmt::layer()
            .pretty()
            .with_file(false)
            .with_line_number(false);
        set_global_default(Registry::default().with(filter).with(console_layer))?;

        None
    };

    install_panic_hook();

    Ok(TelemetryGuard {
        _file_guard: file_guard,
    })
}

static TEST_TRACING: Once = Once::new();

/// Turns tracing on for a test binary when `ENABLE_TRACING` is set:
/// ```bash
/// ENABLE_TRACING=1 cargo test test_name
/// ```
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_err() {
            return;
        }
        // Console output; file logging is useless inside a test run.
        Environment::Dev.install();
        let guard = init_tracing("test").expect("failed to initialize test tracing");
        std::mem::forget(guard);
    });
}

/// Routes panics through `tracing` before the previous hook runs, so they
/// land in the same stream as everything else.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        let location = info.location().map(ToString::to_string);

        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            error!(
                panic.message = message,
                panic.location = location,
                panic.backtrace = %backtrace,
                "service panicked",
            );
        } else {
            error!(
                panic.message = message,
                panic.location = location,
                "service panicked; set RUST_BACKTRACE=1 to capture backtraces",
            );
        }

        previous(info);
    }));
}
