//! HTTP content-encoding middleware for Tower.
//!
//! This crate provides a Tower layer that compresses HTTP response bodies with
//! Brotli, Gzip, Deflate, or Zstd based on the client's `Accept-Encoding`
//! header, and decodes compressed request bodies before they reach the
//! wrapped service.
//!
//! # Example
//!
//! ```ignore
//! use http_content_encoding::{Algorithm, CompressionLayer, Config};
//! use tower::ServiceBuilder;
//!
//! let config = Config::builder()
//!     .min_size(1024)
//!     .compression_level(Algorithm::Gzip, 6)
//!     .metrics_handler(|m| tracing::info!(?m, "response"))
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::with_config(config))
//!     .service(my_service);
//! ```
//!
//! # Negotiation
//!
//! The best enabled algorithm is picked by `q` value, then by configured
//! priority, then by the fixed order `br`, `gzip`, `deflate`, `zstd`. Entries
//! with `q=0` are refused, `*` covers every algorithm not named explicitly, and
//! a malformed `q` counts as `1`.
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - No enabled encoding is acceptable to the client, or the request is excluded
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Type` starts with `image/` (except `image/svg+xml`)
//! - `Content-Type` starts with `application/grpc` (except `application/grpc-web`)
//! - `Content-Length` is below the minimum size threshold (default: 512 bytes)
//! - The body ends before reaching the minimum size
//!
//! Response bodies are buffered until they reach the minimum size. A body that
//! ends first is sent as-is with an exact length; otherwise the buffered bytes
//! and everything after them go through the encoder.
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to the algorithm used
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//! - `Vary` header includes `Accept-Encoding`
//!
//! # Request Decoding
//!
//! Request bodies with a `Content-Encoding` are decoded on the fly, at most
//! [`DEFAULT_MAX_DECODE_STEPS`] codings deep unless configured otherwise.
//! Unknown or disabled codings get `415 Unsupported Media Type` with an
//! `Accept-Encoding` header listing what is supported.
//!
//! Decoded request bodies are not size limited by this crate. A body size limit
//! must be applied by a layer inside this one, where it sees decoded bytes.
//!
//! # Metrics
//!
//! A configured [`MetricsHandler`] receives exactly one [`MetricsData`] per
//! response, including responses that fail or are dropped midway.

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod decompress;
mod error;
mod future;
mod layer;
mod metrics;
mod negotiate;
mod service;

pub use body::CompressionBody;
pub use codec::Algorithm;
pub use config::{
    AlgorithmSettings, Config, ConfigBuilder, DEFAULT_MAX_DECODE_STEPS, DEFAULT_MIN_SIZE,
    ExcludePredicate,
};
pub use decompress::{DecompressionBody, decode_request_body};
pub use error::{ConfigError, DecodeError};
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use metrics::{MetricsData, MetricsHandler};
pub use negotiate::{negotiate, select_encoding};
pub use service::CompressionService;
