use crate::codec::Algorithm;
use thiserror::Error;

/// Errors raised while building a [`Config`](crate::Config).
///
/// These are returned before any request is served; a server should refuse to
/// start with a configuration that fails to build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The name does not match any supported content coding.
    #[error("unknown compression algorithm: {0:?}")]
    UnknownAlgorithm(String),

    /// The compression level is outside the codec's accepted range.
    #[error("compression level {level} for {algorithm} is outside {min}..={max}")]
    LevelOutOfRange {
        /// Algorithm the level was given for.
        algorithm: Algorithm,
        /// Rejected level.
        level: i32,
        /// Lowest accepted level.
        min: i32,
        /// Highest accepted level.
        max: i32,
    },

    /// The algorithm is enabled but its cargo feature was not compiled in.
    #[error("compression algorithm {0} is not available in this build")]
    Unavailable(Algorithm),
}

/// Reasons a request body cannot be decoded.
///
/// Both variants are answered with `415 Unsupported Media Type` before the
/// wrapped service runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The request names a content coding that is unknown or disabled.
    #[error("unsupported content encoding: {0:?}")]
    UnsupportedEncoding(String),

    /// The request lists more codings than the configured decode steps.
    #[error("request body has {found} content encodings, at most {max} are decoded")]
    TooManyEncodings {
        /// Number of codings listed by the request.
        found: usize,
        /// Configured maximum.
        max: usize,
    },
}
