//! Error types for the tiled-imagery crate.

use std::fmt;
use std::path::PathBuf;

/// Result type for tiled-imagery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while selecting, loading or retrieving tiles.
#[derive(Debug)]
pub enum Error {
    /// A caller passed an argument the operation cannot accept.
    InvalidArgument {
        /// Stable message key, e.g. `nullValue.SectorIsNull`.
        key: &'static str,
        /// Human readable detail.
        detail: String,
    },
    /// A configuration record is missing a value or holds an unusable one.
    Config {
        /// The configuration key at fault.
        key: &'static str,
        /// Description of the problem.
        detail: String,
    },
    /// File-store I/O failed.
    Io {
        /// The operation that failed.
        context: &'static str,
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// HTTP request failed.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// A resource URL could not be built for a tile.
    MalformedUrl {
        /// The URL text that failed to parse.
        url: String,
        /// The parser's message.
        message: String,
    },
    /// A textual payload arrived where binary tile data was expected.
    TextContent {
        /// Where the content came from.
        source_name: String,
        /// The reported content type.
        content_type: String,
    },
    /// A retrieval completed without any payload.
    EmptyContent {
        /// Where the content came from.
        source_name: String,
    },
    /// The network, the host, or the retrieval path is not available.
    Unavailable {
        /// What was unavailable.
        what: String,
    },
    /// The operation was cancelled before it completed.
    Cancelled,
}

impl Error {
    pub(crate) fn invalid_argument(key: &'static str, detail: impl Into<String>) -> Self {
        Error::InvalidArgument {
            key,
            detail: detail.into(),
        }
    }

    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument { key, detail } => write!(f, "{key}: {detail}"),
            Error::Config { key, detail } => {
                write!(f, "invalid configuration value for {key}: {detail}")
            }
            Error::Io {
                context,
                path,
                source,
            } => write!(f, "{context} failed for {}: {source}", path.display()),
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::MalformedUrl { url, message } => {
                write!(f, "malformed resource url {url}: {message}")
            }
            Error::TextContent {
                source_name,
                content_type,
            } => write!(
                f,
                "{source_name} returned {content_type} content instead of tile data"
            ),
            Error::EmptyContent { source_name } => {
                write!(f, "{source_name} returned no content")
            }
            Error::Unavailable { what } => write!(f, "{what} is unavailable"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config {
            key: "ConstructionParameters",
            detail: e.to_string(),
        }
    }
}
