use crate::codec::{Algorithm, Decoder};
use crate::config::Config;
use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, header};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Wraps a request body with the decoders its `Content-Encoding` calls for.
///
/// Returns the body untouched when decoding is disabled or the request is not
/// encoded. Unknown or disabled codings, and chains longer than the configured
/// decode steps, are rejected rather than passed through partially decoded.
///
/// Decoded size is not bounded here; a body size limit has to run after this
/// step.
pub fn decode_request_body<B>(
    body: B,
    headers: &HeaderMap,
    config: &Config,
) -> Result<DecompressionBody<B>, DecodeError> {
    if !config.decompress_requests() {
        return Ok(DecompressionBody::passthrough(body));
    }

    let algorithms = content_encodings(headers, config)?;
    if algorithms.is_empty() {
        return Ok(DecompressionBody::passthrough(body));
    }

    // Codings are listed in the order they were applied, so the last one is
    // undone first.
    let mut stages = Vec::with_capacity(algorithms.len());
    for algorithm in algorithms.iter().rev() {
        let decoder = algorithm
            .decoder()
            .map_err(|_| DecodeError::UnsupportedEncoding(algorithm.to_string()))?;
        stages.push(decoder);
    }

    tracing::debug!(stages = stages.len(), "decoding request body");
    Ok(DecompressionBody::decoding(body, stages))
}

/// Parses the request's `Content-Encoding` into the algorithms to undo.
fn content_encodings(headers: &HeaderMap, config: &Config) -> Result<Vec<Algorithm>, DecodeError> {
    let mut tokens = Vec::new();
    for value in headers.get_all(header::CONTENT_ENCODING) {
        let value = value.to_str().map_err(|_| {
            DecodeError::UnsupportedEncoding(String::from_utf8_lossy(value.as_bytes()).into_owned())
        })?;
        tokens.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("identity")),
        );
    }

    if tokens.len() > config.max_decode_steps() {
        return Err(DecodeError::TooManyEncodings {
            found: tokens.len(),
            max: config.max_decode_steps(),
        });
    }

    tokens
        .into_iter()
        .map(|token| {
            Algorithm::from_token(token)
                .filter(|algorithm| config.is_enabled(*algorithm))
                .ok_or_else(|| DecodeError::UnsupportedEncoding(token.to_owned()))
        })
        .collect()
}

pin_project! {
    /// A request body that may be decoded on the fly.
    ///
    /// Codec errors surface from `poll_frame` as `io::Error`s once the broken
    /// bytes are read.
    pub struct DecompressionBody<B> {
        #[pin]
        inner: B,
        stages: Vec<Decoder>,
        trailers: Option<HeaderMap>,
        done: bool,
    }
}

impl<B> DecompressionBody<B> {
    /// Creates a body that forwards the inner body unchanged.
    pub fn passthrough(inner: B) -> Self {
        Self::decoding(inner, Vec::new())
    }

    fn decoding(inner: B, stages: Vec<Decoder>) -> Self {
        Self {
            inner,
            stages,
            trailers: None,
            done: false,
        }
    }

    /// Returns whether any decoder is applied.
    pub fn is_decoding(&self) -> bool {
        !self.stages.is_empty()
    }
}

impl<B> fmt::Debug for DecompressionBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecompressionBody")
            .field("stages", &self.stages.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Runs a chunk through every stage in order.
fn decode_chunk(stages: &mut [Decoder], chunk: Bytes) -> io::Result<Bytes> {
    let mut data = chunk;
    for stage in stages.iter_mut() {
        if data.is_empty() {
            break;
        }
        data = stage.decode(&data)?;
    }
    Ok(data)
}

/// Finishes each stage, feeding its tail through the stages after it.
fn finish_stages(stages: &mut [Decoder]) -> io::Result<Bytes> {
    let mut all_output = BytesMut::new();
    for i in 0..stages.len() {
        let (current, rest) = stages[i..].split_at_mut(1);
        let tail = current[0].finish()?;
        all_output.extend_from_slice(&decode_chunk(rest, tail)?);
    }
    Ok(all_output.freeze())
}

impl<B> Body for DecompressionBody<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                None => {
                    *this.done = true;
                    match finish_stages(&mut this.stages[..]) {
                        Ok(tail) if !tail.is_empty() => {
                            return Poll::Ready(Some(Ok(Frame::data(tail))));
                        }
                        Ok(_) => continue,
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        let chunk = data.copy_to_bytes(data.remaining());
                        match decode_chunk(&mut this.stages[..], chunk) {
                            Ok(out) if out.is_empty() => continue,
                            Ok(out) => return Poll::Ready(Some(Ok(Frame::data(out)))),
                            Err(e) => {
                                *this.done = true;
                                return Poll::Ready(Some(Err(e)));
                            }
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            // Trailers end the body; flush the decoders first.
                            *this.trailers = Some(trailers);
                            *this.done = true;
                            match finish_stages(&mut this.stages[..]) {
                                Ok(tail) if !tail.is_empty() => {
                                    return Poll::Ready(Some(Ok(Frame::data(tail))));
                                }
                                Ok(_) => continue,
                                Err(e) => {
                                    this.trailers.take();
                                    return Poll::Ready(Some(Err(e)));
                                }
                            }
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if self.stages.is_empty() && !self.done {
            return self.inner.is_end_stream();
        }
        self.done && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.stages.is_empty() {
            self.inner.size_hint()
        } else {
            // Decoded size is unknown
            SizeHint::default()
        }
    }
}
