use std::io;
use thiserror::Error;

/// Errors surfaced by the TCP transport.
///
/// Only `Setup` and `NotConnected` are failures a caller must handle;
/// candidate and resolution failures are absorbed by the connect path and
/// manifest as the `Failed` state, and read-side failures manifest as a
/// stream-ended notification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// An adopted socket could not be prepared (non-blocking mode or peer
    /// address lookup failed). Fatal to construction.
    #[error("socket adoption failed: {source}")]
    Setup {
        #[source]
        source: io::Error,
    },

    /// The hostname/service pair resolved to no usable candidate.
    #[error("resolution failed for \"{host}:{service}\": {source}")]
    Resolution {
        host: String,
        service: String,
        #[source]
        source: io::Error,
    },

    /// `send` was called outside the connected window.
    #[error("connection is not open")]
    NotConnected,

    /// A write hit a non-recoverable socket error.
    #[error("connection closed: {source}")]
    Closed {
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn setup(source: io::Error) -> Self {
        Self::Setup { source }
    }

    pub fn resolution(
        host: impl Into<String>,
        service: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self::Resolution {
            host: host.into(),
            service: service.into(),
            source,
        }
    }

    pub fn closed(source: io::Error) -> Self {
        Self::Closed { source }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
