use crate::codec::Encoder;
use crate::metrics::MetricsGuard;
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// How the inner body ended while the response was still being buffered.
pub(crate) enum Tail {
    /// Plain end of stream.
    End,
    /// The body finished with trailers.
    Trailers(HeaderMap),
    /// The body failed.
    Error(io::Error),
}

/// A response body that may be compressed.
///
/// Depending on what happened before the headers were sent, this either
/// streams the inner body through an encoder, forwards it unchanged, or
/// replays a short buffered body. Sizes are tracked for the metrics reporter,
/// which fires once when the body ends or is dropped.
pub struct CompressionBody<B> {
    inner: Option<Pin<Box<B>>>,
    pending: VecDeque<Result<Frame<Bytes>, io::Error>>,
    compressed: Option<CompressedBody>,
    metrics: MetricsGuard,
}

/// Encoder state for a body that swapped into compression.
struct CompressedBody {
    encoder: Encoder,
    always_flush: bool,
    finished: bool,
    pending_trailers: Option<HeaderMap>,
}

impl CompressedBody {
    /// Compresses a chunk of input data.
    fn compress_chunk(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let output = self.encoder.encode(input)?;
        if !self.always_flush {
            return Ok(output);
        }

        let flushed = self.encoder.flush()?;
        if output.is_empty() {
            return Ok(flushed);
        }
        let mut all_output = Vec::with_capacity(output.len() + flushed.len());
        all_output.extend_from_slice(&output);
        all_output.extend_from_slice(&flushed);
        Ok(all_output.into())
    }
}

impl<B> CompressionBody<B> {
    /// Forwards the inner body unchanged.
    pub(crate) fn passthrough(inner: Pin<Box<B>>, metrics: MetricsGuard) -> Self {
        Self {
            inner: Some(inner),
            pending: VecDeque::new(),
            compressed: None,
            metrics,
        }
    }

    /// Replays a body that ended before reaching the compression threshold.
    pub(crate) fn flushed(buffered: Bytes, tail: Tail, metrics: MetricsGuard) -> Self {
        let mut pending = VecDeque::new();
        if !buffered.is_empty() {
            pending.push_back(Ok(Frame::data(buffered)));
        }
        match tail {
            Tail::End => {}
            Tail::Trailers(trailers) => pending.push_back(Ok(Frame::trailers(trailers))),
            Tail::Error(e) => pending.push_back(Err(e)),
        }

        Self {
            inner: None,
            pending,
            compressed: None,
            metrics,
        }
    }

    /// Compresses `buffered` followed by the rest of the inner body.
    pub(crate) fn compressed(
        inner: Pin<Box<B>>,
        encoder: Encoder,
        always_flush: bool,
        buffered: Bytes,
        metrics: MetricsGuard,
    ) -> Self {
        let mut body = Self {
            inner: Some(inner),
            pending: VecDeque::new(),
            compressed: Some(CompressedBody {
                encoder,
                always_flush,
                finished: false,
                pending_trailers: None,
            }),
            metrics,
        };
        if !buffered.is_empty() {
            body.push_chunk(buffered);
        }
        body
    }

    /// A body with no content, used for responses generated by the middleware.
    pub(crate) fn empty(metrics: MetricsGuard) -> Self {
        Self {
            inner: None,
            pending: VecDeque::new(),
            compressed: None,
            metrics,
        }
    }

    /// Returns whether the body is streaming through an encoder.
    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn always_flush(&self) -> Option<bool> {
        self.compressed.as_ref().map(|c| c.always_flush)
    }

    /// Queues a data chunk read from the inner body, compressing it if needed.
    fn push_chunk(&mut self, chunk: Bytes) {
        let Some(compressed) = self.compressed.as_mut() else {
            if !chunk.is_empty() {
                self.pending.push_back(Ok(Frame::data(chunk)));
            }
            return;
        };

        match compressed.compress_chunk(&chunk) {
            Ok(output) if output.is_empty() => {}
            Ok(output) => self.pending.push_back(Ok(Frame::data(output))),
            Err(e) => self.abort(e),
        }
    }

    /// Stops reading the inner body and queues the encoder's tail.
    fn finish_encoder(&mut self) {
        let Some(compressed) = self.compressed.as_mut() else {
            return;
        };
        if compressed.finished {
            return;
        }
        compressed.finished = true;

        match compressed.encoder.finish() {
            Ok(output) => {
                if !output.is_empty() {
                    self.pending.push_back(Ok(Frame::data(output)));
                }
                // Trailers go after the compressed data.
                if let Some(trailers) = compressed.pending_trailers.take() {
                    self.pending.push_back(Ok(Frame::trailers(trailers)));
                }
            }
            Err(e) => self.pending.push_back(Err(e)),
        }
    }

    /// Ends the body with an error; nothing else is read or encoded.
    fn abort(&mut self, error: io::Error) {
        self.inner = None;
        if let Some(compressed) = self.compressed.as_mut() {
            compressed.finished = true;
        }
        self.pending.push_back(Err(error));
    }
}

impl<B> fmt::Debug for CompressionBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionBody")
            .field("compressed", &self.is_compressed())
            .field("pending_frames", &self.pending.len())
            .field("inner_done", &self.inner.is_none())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl<B> Body for CompressionBody<B>
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
        let this = self.get_mut();

        loop {
            if let Some(item) = this.pending.pop_front() {
                if let Ok(frame) = &item {
                    if let Some(data) = frame.data_ref() {
                        this.metrics.record_transport(data.len());
                    }
                }
                return Poll::Ready(Some(item));
            }

            let Some(inner) = this.inner.as_mut() else {
                if this.compressed.as_ref().is_some_and(|c| !c.finished) {
                    this.finish_encoder();
                    continue;
                }
                this.metrics.finish();
                return Poll::Ready(None);
            };

            match inner.as_mut().poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.inner = None;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.abort(io::Error::other(e.into()));
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(mut data) => {
                        let chunk = data.copy_to_bytes(data.remaining());
                        this.metrics.record_original(chunk.len());
                        this.push_chunk(chunk);
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            match this.compressed.as_mut() {
                                Some(compressed) => {
                                    // Buffer trailers and finish compression first
                                    compressed.pending_trailers = Some(trailers);
                                    this.inner = None;
                                }
                                None => this.pending.push_back(Ok(Frame::trailers(trailers))),
                            }
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        match (&self.inner, &self.compressed) {
            (Some(inner), None) => inner.is_end_stream(),
            (Some(_), Some(_)) => false,
            (None, compressed) => compressed.as_ref().is_none_or(|c| c.finished),
        }
    }

    fn size_hint(&self) -> SizeHint {
        if self.compressed.is_some() {
            // Compressed size is unknown
            return SizeHint::default();
        }

        let pending: u64 = self
            .pending
            .iter()
            .filter_map(|item| item.as_ref().ok()?.data_ref())
            .map(|data| data.len() as u64)
            .sum();

        match &self.inner {
            None => SizeHint::with_exact(pending),
            Some(inner) => {
                let inner = inner.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower() + pending);
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper + pending);
                }
                hint
            }
        }
    }
}
