use crate::body::{CompressionBody, Tail};
use crate::codec::Algorithm;
use crate::config::Config;
use crate::metrics::MetricsGuard;
use bytes::{Buf, BufMut, BytesMut};
use http::response::Parts;
use http::{HeaderMap, Response, StatusCode, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Future for compression service responses.
    ///
    /// Once the inner service responds, the body is buffered until it reaches
    /// the configured minimum size or ends. Only then are the response headers
    /// final, so this future resolves after that decision has been made.
    /// Streaming responses that flush every chunk skip the buffering.
    pub struct ResponseFuture<F, B> {
        #[pin]
        kind: Kind<F, B>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<F, B> {
        Waiting {
            #[pin]
            inner: F,
            accepted: Option<Algorithm>,
            config: Arc<Config>,
            metrics: Option<MetricsGuard>,
            buffering: Option<Buffering<B>>,
        },
        Rejected {
            response: Option<Response<CompressionBody<B>>>,
        },
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(
        inner: F,
        accepted: Option<Algorithm>,
        config: Arc<Config>,
        metrics: MetricsGuard,
    ) -> Self {
        Self {
            kind: Kind::Waiting {
                inner,
                accepted,
                config,
                metrics: Some(metrics),
                buffering: None,
            },
        }
    }

    /// A response produced without calling the inner service.
    pub(crate) fn rejected(response: Response<CompressionBody<B>>) -> Self {
        Self {
            kind: Kind::Rejected {
                response: Some(response),
            },
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Rejected { response } => Poll::Ready(Ok(response
                .take()
                .expect("ResponseFuture polled after completion"))),
            KindProj::Waiting {
                inner,
                accepted,
                config,
                metrics,
                buffering,
            } => {
                if buffering.is_none() {
                    let response = ready!(inner.poll(cx))?;
                    let (mut parts, body) = response.into_parts();
                    let body = Box::pin(body);

                    let algorithm = accepted.filter(|_| should_compress(&parts.headers, config));
                    let Some(algorithm) = algorithm else {
                        let metrics = take_metrics(metrics);
                        let body = CompressionBody::passthrough(body, metrics);
                        return Poll::Ready(Ok(Response::from_parts(parts, body)));
                    };

                    // The length on the wire is only known once the body is read.
                    parts.headers.remove(header::CONTENT_LENGTH);
                    *buffering = Some(Buffering {
                        always_flush: is_always_flush(&parts.headers),
                        parts,
                        body,
                        algorithm,
                        buffer: BytesMut::new(),
                        tail: None,
                        metrics: take_metrics(metrics),
                    });
                }

                if let Some(state) = buffering.as_mut() {
                    // Streaming responses swap right away so their headers aren't held back.
                    if !state.always_flush {
                        ready!(state.poll_fill(cx, config.min_size()));
                    }
                }
                let state = buffering
                    .take()
                    .expect("ResponseFuture polled after completion");
                Poll::Ready(Ok(state.into_response(config)))
            }
        }
    }
}

fn take_metrics(metrics: &mut Option<MetricsGuard>) -> MetricsGuard {
    metrics.take().unwrap_or_else(|| MetricsGuard::new(None))
}

/// A response whose headers are held back while its body is buffered.
struct Buffering<B> {
    parts: Parts,
    body: Pin<Box<B>>,
    algorithm: Algorithm,
    buffer: BytesMut,
    tail: Option<Tail>,
    always_flush: bool,
    metrics: MetricsGuard,
}

impl<B> Buffering<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Reads frames until the buffer reaches `min_size` or the body ends.
    fn poll_fill(&mut self, cx: &mut Context<'_>, min_size: usize) -> Poll<()> {
        loop {
            match ready!(self.body.as_mut().poll_frame(cx)) {
                None => {
                    self.tail = Some(Tail::End);
                    return Poll::Ready(());
                }
                Some(Err(e)) => {
                    self.tail = Some(Tail::Error(io::Error::other(e.into())));
                    return Poll::Ready(());
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        self.metrics.record_original(data.remaining());
                        self.buffer.put(data);
                        if self.buffer.len() >= min_size {
                            return Poll::Ready(());
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.tail = Some(Tail::Trailers(trailers));
                            return Poll::Ready(());
                        }
                    }
                },
            }
        }
    }

    /// Finalizes headers and builds the body for the buffered response.
    fn into_response(self, config: &Config) -> Response<CompressionBody<B>> {
        let Buffering {
            mut parts,
            body,
            algorithm,
            buffer,
            tail,
            always_flush,
            mut metrics,
        } = self;
        let buffered = buffer.freeze();

        if let Some(tail) = tail {
            tracing::debug!(
                buffered = buffered.len(),
                min_size = config.min_size(),
                "response ended below compression threshold"
            );
            let body = CompressionBody::flushed(buffered, tail, metrics);
            return Response::from_parts(parts, body);
        }

        let encoder = match algorithm.encoder(config.settings(algorithm).level) {
            Ok(encoder) => encoder,
            Err(e) => {
                tracing::error!(%algorithm, error = %e, "failed to initialize encoder");
                let mut response = Response::new(CompressionBody::empty(metrics));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return response;
            }
        };

        parts.headers.insert(
            header::CONTENT_ENCODING,
            header::HeaderValue::from_static(algorithm.content_encoding()),
        );

        // Ranges don't apply to the encoded representation
        parts.headers.remove(header::ACCEPT_RANGES);

        add_vary_accept_encoding(&mut parts.headers);
        metrics.set_encoding(algorithm);

        tracing::debug!(
            %algorithm,
            buffered = buffered.len(),
            always_flush,
            "compressing response"
        );
        let body = CompressionBody::compressed(body, encoder, always_flush, buffered, metrics);
        Response::from_parts(parts, body)
    }
}

/// Whether a response is eligible for compression at all.
fn should_compress(headers: &HeaderMap, config: &Config) -> bool {
    !has_content_encoding(headers)
        && !has_content_range(headers)
        && !is_uncompressible_content_type(headers)
        && !is_below_min_size(headers, config.min_size())
}

/// Checks if Content-Encoding header is already present.
fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_ENCODING)
}

/// Checks if Content-Range header is present (range response).
fn has_content_range(headers: &HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("Accept-Encoding"),
    );
}

/// Checks if the content type should not be compressed.
fn is_uncompressible_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    // Skip all images except SVG
    if content_type.starts_with("image/") {
        return !content_type.starts_with("image/svg+xml");
    }

    // Skip gRPC except grpc-web
    if content_type.starts_with("application/grpc") {
        return !content_type.starts_with("application/grpc-web");
    }

    false
}

/// Checks for x-accel-buffering: no header or streaming content types.
fn is_always_flush(headers: &HeaderMap) -> bool {
    headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"))
        || is_streaming_content_type(headers)
}

/// Checks if the content type requires always flushing (e.g., streaming).
fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
        })
}

/// Checks if a declared Content-Length is below the minimum size.
fn is_below_min_size(headers: &HeaderMap, min_size: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len < min_size)
}
