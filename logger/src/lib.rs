use thiserror::Error;
use time::{format_description::BorrowedFormatItem, macros::format_description};
use tracing_subscriber::fmt::time::UtcTime;

/// Timestamp layout shared by the stdout and file subscribers.
const TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

// Re-export the macros so dependent crates log through a single import.
pub use tracing::{debug, error, info, trace, warn};

/// Default filter directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggerError {
    #[error("invalid filter directive: {source}")]
    Filter {
        #[from]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to install global subscriber: {source}")]
    Install {
        #[from]
        source: tracing_subscriber::util::TryInitError,
    },
}

fn env_filter(fallback: &str) -> Result<tracing_subscriber::EnvFilter, LoggerError> {
    match std::env::var("RUST_LOG") {
        Ok(directives) => Ok(tracing_subscriber::EnvFilter::try_new(directives)?),
        Err(_) => Ok(tracing_subscriber::EnvFilter::try_new(fallback)?),
    }
}

/// Install a stdout subscriber with the given fallback filter.
///
/// Returns the appender worker guard; dropping it flushes and stops the
/// background writer, so hold it for the lifetime of the process.
#[cfg(feature = "stdout")]
pub fn try_init(fallback_filter: &str) -> Result<tracing_appender::non_blocking::WorkerGuard, LoggerError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(fallback_filter)?)
        .with_timer(UtcTime::new(TIME_FORMAT))
        .with_writer(writer)
        .finish()
        .try_init()?;
    Ok(guard)
}

/// Stdout subscriber with the [`DEFAULT_FILTER`]; panics if a global
/// subscriber is already installed.
#[cfg(feature = "stdout")]
pub fn init() -> tracing_appender::non_blocking::WorkerGuard {
    try_init(DEFAULT_FILTER).expect("logger initialization failed")
}

/// Build the daily-rolling file dispatcher plus its writer guard.
#[cfg(feature = "file")]
fn file_dispatch(
    directory: impl AsRef<std::path::Path>,
    file_prefix: &str,
    fallback_filter: &str,
) -> Result<(tracing::Dispatch, tracing_appender::non_blocking::WorkerGuard), LoggerError> {
    let appender = tracing_appender::rolling::daily(directory, file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(fallback_filter)?)
        .with_timer(UtcTime::new(TIME_FORMAT))
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    Ok((tracing::Dispatch::new(subscriber), guard))
}

/// Install a daily-rolling file subscriber under `directory`.
#[cfg(feature = "file")]
pub fn try_init_file(
    directory: impl AsRef<std::path::Path>,
    file_prefix: &str,
    fallback_filter: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LoggerError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let (dispatch, guard) = file_dispatch(directory, file_prefix, fallback_filter)?;
    dispatch.try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_directive_is_rejected() {
        let parse_err = tracing_subscriber::EnvFilter::try_new("not a [valid] directive==")
            .expect_err("directive should not parse");
        let err = LoggerError::from(parse_err);
        assert!(matches!(err, LoggerError::Filter { .. }));
    }

    #[cfg(feature = "file")]
    #[test]
    fn test_file_dispatch_writes_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatch, guard) = file_dispatch(dir.path(), "transport.log", "trace").unwrap();

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("file appender smoke line");
        });
        // Dropping the guard flushes the non-blocking writer.
        drop(guard);

        let mut contents = String::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            contents.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        assert!(contents.contains("file appender smoke line"));
    }

    #[cfg(feature = "stdout")]
    #[test]
    fn test_second_install_fails() {
        let first = try_init(DEFAULT_FILTER);
        assert!(first.is_ok());
        let second = try_init(DEFAULT_FILTER);
        assert!(matches!(second, Err(LoggerError::Install { .. })));
    }
}
