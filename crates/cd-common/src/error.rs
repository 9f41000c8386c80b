use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;

use strum::Display;

/// The closed taxonomy from which every component classifies failures.
///
/// All [`Error`]s carry an [`ErrorKind`] and an optional source. Only the
/// outermost handler (the bus consumer loop, or an HTTP handler on the read
/// model) classifies into this set; everything below wraps with context.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ErrorKind {
    // Admission: reported to caller, message acknowledged, no retry.
    QuotaExhausted,
    RateLimited,
    ConcurrencyExceeded,

    // Transient I/O: retried with bounded exponential backoff.
    BusUnavailable,
    StoreUnavailable,
    RegistryUnavailable,
    CacheUnavailable,

    // Logic: terminal, no retry.
    MalformedMessage,
    MissingRequiredField,
    IncompatibleStrategy,
    FrameworkUnknown,

    // Operational: terminal for the current attempt.
    Timeout,
    SizeExceeded,
    HealthCheckFailed,
    CanaryAnalysisFailed,

    // Fatal: process exits.
    ConfigurationInvalid,
    SchemaMismatch,

    // Not part of the taxonomy proper, but needed at the boundary.
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind should be retried by its caller.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::BusUnavailable
                | ErrorKind::StoreUnavailable
                | ErrorKind::RegistryUnavailable
                | ErrorKind::CacheUnavailable
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigurationInvalid | ErrorKind::SchemaMismatch
        )
    }
}

/// The error type used at every crate boundary in the control plane.
///
/// Mirrors the `gateway`/`deployer` pattern: a closed `kind` plus an opaque
/// boxed source, so the type itself never leaks a downstream dependency's
/// error type into a public signature.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::source(ErrorKind::StoreUnavailable, err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
