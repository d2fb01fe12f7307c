use crate::error::ConfigError;
use bytes::{Bytes, BytesMut};
use compression_codecs::{DecodeV2, EncodeV2};
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::str::FromStr;

#[cfg(any(feature = "brotli", feature = "gzip", feature = "deflate"))]
use compression_core::Level;

#[cfg(feature = "brotli")]
use compression_codecs::brotli::{
    BrotliDecoder, BrotliEncoder, params::EncoderParams as BrotliParams,
};
#[cfg(feature = "gzip")]
use compression_codecs::gzip::{GzipDecoder, GzipEncoder};
#[cfg(feature = "deflate")]
use compression_codecs::zlib::{ZlibDecoder, ZlibEncoder};
#[cfg(feature = "zstd")]
use compression_codecs::zstd::{ZstdDecoder, ZstdEncoder};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

#[cfg(feature = "zstd")]
const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Supported content codings.
///
/// Variants are declared in fallback order: when two candidates tie on both
/// quality and configured priority, the earlier variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Brotli (`br`).
    Brotli,
    /// Gzip (`gzip`).
    Gzip,
    /// Zlib-wrapped deflate (`deflate`).
    Deflate,
    /// Zstandard (`zstd`).
    Zstd,
}

impl Algorithm {
    /// Every algorithm, in fallback order.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Brotli,
        Algorithm::Gzip,
        Algorithm::Deflate,
        Algorithm::Zstd,
    ];

    /// Returns the Content-Encoding header value for this algorithm.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Algorithm::Brotli => "br",
            Algorithm::Gzip => "gzip",
            Algorithm::Deflate => "deflate",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Matches a coding token from `Accept-Encoding` or `Content-Encoding`.
    ///
    /// Matching is ASCII case-insensitive and accepts the `brotli` and `x-gzip`
    /// aliases.
    pub fn from_token(token: &str) -> Option<Algorithm> {
        let token = token.trim();
        Self::ALL
            .into_iter()
            .find(|algorithm| token.eq_ignore_ascii_case(algorithm.content_encoding()))
            .or_else(|| {
                if token.eq_ignore_ascii_case("brotli") {
                    Some(Algorithm::Brotli)
                } else if token.eq_ignore_ascii_case("x-gzip") {
                    Some(Algorithm::Gzip)
                } else {
                    None
                }
            })
    }

    /// Position in the fixed fallback order; lower is preferred.
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Priority used when the configuration does not set one.
    pub(crate) fn default_priority(self) -> i32 {
        (Self::ALL.len() - 1 - self.index()) as i32
    }

    /// Range of compression levels the codec accepts.
    pub fn level_range(&self) -> RangeInclusive<i32> {
        match self {
            Algorithm::Brotli => 0..=11,
            Algorithm::Gzip | Algorithm::Deflate => 0..=9,
            Algorithm::Zstd => 1..=22,
        }
    }

    /// Whether the codec was compiled into this build.
    pub fn is_available(&self) -> bool {
        match self {
            Algorithm::Brotli => cfg!(feature = "brotli"),
            Algorithm::Gzip => cfg!(feature = "gzip"),
            Algorithm::Deflate => cfg!(feature = "deflate"),
            Algorithm::Zstd => cfg!(feature = "zstd"),
        }
    }

    /// Creates an encoder, using the codec default when `level` is `None`.
    pub(crate) fn encoder(&self, level: Option<i32>) -> io::Result<Encoder> {
        let inner: Box<dyn EncodeV2 + Send> = match self {
            #[cfg(feature = "brotli")]
            Algorithm::Brotli => {
                let params = match level {
                    Some(quality) => BrotliParams::default().quality(Level::Precise(quality)),
                    None => BrotliParams::default(),
                };
                Box::new(BrotliEncoder::new(params))
            }
            #[cfg(feature = "gzip")]
            Algorithm::Gzip => Box::new(GzipEncoder::new(flate_level(level).into())),
            #[cfg(feature = "deflate")]
            Algorithm::Deflate => Box::new(ZlibEncoder::new(flate_level(level).into())),
            #[cfg(feature = "zstd")]
            Algorithm::Zstd => Box::new(ZstdEncoder::new(level.unwrap_or(DEFAULT_ZSTD_LEVEL))),
            #[allow(unreachable_patterns)]
            _ => return Err(self.unavailable()),
        };
        Ok(Encoder::new(inner))
    }

    /// Creates a decoder for one stage of request body decoding.
    pub(crate) fn decoder(&self) -> io::Result<Decoder> {
        let inner: Box<dyn DecodeV2 + Send> = match self {
            #[cfg(feature = "brotli")]
            Algorithm::Brotli => Box::new(BrotliDecoder::new()),
            #[cfg(feature = "gzip")]
            Algorithm::Gzip => Box::new(GzipDecoder::new()),
            #[cfg(feature = "deflate")]
            Algorithm::Deflate => Box::new(ZlibDecoder::new()),
            #[cfg(feature = "zstd")]
            Algorithm::Zstd => Box::new(ZstdDecoder::new()),
            #[allow(unreachable_patterns)]
            _ => return Err(self.unavailable()),
        };
        Ok(Decoder::new(inner))
    }

    fn unavailable(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            ConfigError::Unavailable(*self),
        )
    }
}

#[cfg(any(feature = "gzip", feature = "deflate"))]
fn flate_level(level: Option<i32>) -> Level {
    level.map_or(Level::Default, Level::Precise)
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::from_token(s).ok_or_else(|| ConfigError::UnknownAlgorithm(s.to_owned()))
    }
}

/// Push-style compressor: bytes in, compressed bytes out.
pub(crate) struct Encoder {
    inner: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
}

impl Encoder {
    fn new(inner: Box<dyn EncodeV2 + Send>) -> Self {
        Self {
            inner,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }

    /// Compresses a chunk, returning whatever output the codec produced so far.
    pub(crate) fn encode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let mut input_buf = PartialBuffer::new(input);
        let mut all_output = BytesMut::new();

        while input_buf.written_len() < input.len() {
            let consumed = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.inner.encode(&mut input_buf, &mut output)?;

            let written = output.written_len();
            all_output.extend_from_slice(&self.output_buffer[..written]);

            if written == 0 && input_buf.written_len() == consumed {
                return Err(io::Error::other("encoder made no progress"));
            }
        }

        Ok(all_output.freeze())
    }

    /// Emits everything compressed so far without ending the stream.
    pub(crate) fn flush(&mut self) -> io::Result<Bytes> {
        self.drain(|encoder, output| encoder.flush(output))
    }

    /// Ends the stream, emitting the codec's trailing bytes.
    pub(crate) fn finish(&mut self) -> io::Result<Bytes> {
        self.drain(|encoder, output| encoder.finish(output))
    }

    fn drain<F>(&mut self, mut step: F) -> io::Result<Bytes>
    where
        F: FnMut(&mut (dyn EncodeV2 + Send), &mut WriteBuffer<'_>) -> io::Result<bool>,
    {
        let mut all_output = BytesMut::new();
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = step(self.inner.as_mut(), &mut output)?;
            let written = output.written_len();
            all_output.extend_from_slice(&self.output_buffer[..written]);
            if done {
                return Ok(all_output.freeze());
            }
        }
    }
}

/// Push-style decompressor for a single content coding.
///
/// Concatenated members (multi-member gzip, consecutive zstd frames) decode as
/// one stream.
pub(crate) struct Decoder {
    inner: Box<dyn DecodeV2 + Send>,
    output_buffer: Vec<u8>,
    finished: bool,
    // Set after a member ended and the codec was reset for another one.
    restarted: bool,
}

impl Decoder {
    fn new(inner: Box<dyn DecodeV2 + Send>) -> Self {
        Self {
            inner,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            finished: false,
            restarted: false,
        }
    }

    /// Decodes a chunk of the compressed stream.
    ///
    /// Bytes following a complete member that do not start another member are
    /// rejected as `InvalidData`.
    pub(crate) fn decode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let mut input_buf = PartialBuffer::new(input);
        let mut all_output = BytesMut::new();
        let mut output_full = false;

        loop {
            let exhausted = input_buf.written_len() >= input.len();
            if self.finished {
                if exhausted {
                    break;
                }
                self.inner.reinit()?;
                self.finished = false;
                self.restarted = true;
            }
            if exhausted && !output_full {
                break;
            }

            let consumed = input_buf.written_len();
            let restarted = self.restarted;
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self
                .inner
                .decode(&mut input_buf, &mut output)
                .map_err(|e| member_error(restarted, e))?;

            let written = output.written_len();
            all_output.extend_from_slice(&self.output_buffer[..written]);
            output_full = written == self.output_buffer.len();
            if written > 0 || done {
                self.restarted = false;
            }

            if done {
                all_output.extend_from_slice(&self.finish()?);
                continue;
            }
            if !exhausted && written == 0 && input_buf.written_len() == consumed {
                return Err(io::Error::other("decoder made no progress"));
            }
        }

        Ok(all_output.freeze())
    }

    /// Flushes the decoder at end of input. Calling it again is a no-op.
    ///
    /// A stream cut short fails with `UnexpectedEof` whatever the codec.
    pub(crate) fn finish(&mut self) -> io::Result<Bytes> {
        let mut all_output = BytesMut::new();
        while !self.finished {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.finished = match self.inner.finish(&mut output) {
                Ok(done) => done,
                Err(e) if self.restarted => return Err(member_error(true, e)),
                Err(e) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, e)),
            };
            let written = output.written_len();
            all_output.extend_from_slice(&self.output_buffer[..written]);
        }
        Ok(all_output.freeze())
    }
}

/// Reports bytes after a finished member that failed to parse as trailing data.
fn member_error(restarted: bool, error: io::Error) -> io::Error {
    if restarted {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("trailing data after end of compressed stream: {error}"),
        )
    } else {
        error
    }
}
