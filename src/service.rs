use crate::body::CompressionBody;
use crate::config::Config;
use crate::decompress::{DecompressionBody, decode_request_body};
use crate::future::ResponseFuture;
use crate::metrics::MetricsGuard;
use crate::negotiate::negotiate;
use http::{HeaderValue, Request, Response, StatusCode, header};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that decodes request bodies and compresses response bodies.
///
/// Requests whose `Content-Encoding` cannot be decoded are answered with
/// `415 Unsupported Media Type` without reaching the inner service.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> CompressionService<S> {
    /// Creates a new compression service wrapping the given inner service.
    pub fn new(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<DecompressionBody<ReqBody>>, Response = Response<ResBody>>,
    ResBody: Body,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let metrics = MetricsGuard::new(self.config.metrics_handler());
        let (mut parts, body) = req.into_parts();

        let body = match decode_request_body(body, &parts.headers, &self.config) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, path = %parts.uri.path(), "rejecting encoded request body");
                return ResponseFuture::rejected(unsupported_encoding(&self.config, metrics));
            }
        };
        if body.is_decoding() {
            // The handler sees the decoded representation.
            parts.headers.remove(header::CONTENT_ENCODING);
            parts.headers.remove(header::CONTENT_LENGTH);
        }

        let accepted = negotiate(&parts, &self.config);
        let inner = self.inner.call(Request::from_parts(parts, body));

        ResponseFuture::new(inner, accepted, self.config.clone(), metrics)
    }
}

/// Builds the `415` response advertising the codings the server can decode.
fn unsupported_encoding<B>(config: &Config, metrics: MetricsGuard) -> Response<CompressionBody<B>> {
    let accepted = config
        .enabled_algorithms()
        .map(|algorithm| algorithm.content_encoding())
        .collect::<Vec<_>>()
        .join(", ");

    let mut response = Response::new(CompressionBody::empty(metrics));
    *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
    if let Ok(value) = HeaderValue::from_str(&accepted) {
        response
            .headers_mut()
            .insert(header::ACCEPT_ENCODING, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Algorithm;
    use crate::codec::tests::{compress, decompress};
    use crate::metrics::MetricsData;
    use crate::metrics::tests::recorder;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use std::future::Future;
    use std::io;
    use std::pin::pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{ServiceExt, service_fn};

    const SMALL_BODY: &str = "SMALL BODY";

    fn large_body() -> String {
        "LARGE BODY".repeat(256)
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        let mut future = pin!(future);
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
        }
    }

    type Reports = Arc<Mutex<Vec<MetricsData>>>;

    fn config_with_recorder() -> (Config, Reports) {
        let (handler, reports) = recorder();
        let config = Config::builder()
            .metrics_handler(move |data| handler(data))
            .build()
            .unwrap();
        (config, reports)
    }

    /// Serves `body` for every request.
    fn serve(
        config: Config,
        body: String,
        request: Request<Full<Bytes>>,
    ) -> Response<CompressionBody<Full<Bytes>>> {
        let service = service_fn(move |_req: Request<DecompressionBody<Full<Bytes>>>| {
            let body = body.clone();
            async move { Ok::<_, io::Error>(Response::new(Full::new(Bytes::from(body)))) }
        });
        let service = CompressionService::new(service, Arc::new(config));
        block_on(service.oneshot(request)).unwrap()
    }

    fn get(accept_encoding: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::get("/");
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        builder.body(Full::default()).unwrap()
    }

    fn read_body<B>(body: B) -> Bytes
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Debug,
    {
        block_on(body.collect()).unwrap().to_bytes()
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_small_body_passes_through() {
        let (config, reports) = config_with_recorder();
        let response = serve(config, SMALL_BODY.to_owned(), get(Some("gzip")));

        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(response.headers().get(header::VARY).is_none());
        assert_eq!(read_body(response.into_body()), SMALL_BODY);

        assert_eq!(
            reports.lock().unwrap().as_slice(),
            &[MetricsData {
                original_size: 10,
                compressed_size: 10,
                compression_applied: false,
                encoding_used: "",
            }]
        );
    }

    #[test]
    fn test_large_body_round_trips_each_algorithm() {
        for algorithm in Algorithm::ALL.into_iter().filter(Algorithm::is_available) {
            let (config, reports) = config_with_recorder();
            let response = serve(
                config,
                large_body(),
                get(Some(algorithm.content_encoding())),
            );

            assert_eq!(
                response.headers().get(header::CONTENT_ENCODING).unwrap(),
                algorithm.content_encoding()
            );
            assert_eq!(response.headers().get(header::VARY).unwrap(), "Accept-Encoding");
            assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

            let encoded = read_body(response.into_body());
            assert_eq!(decompress(algorithm, &encoded), large_body().as_bytes());

            let reports = reports.lock().unwrap();
            assert_eq!(reports.len(), 1, "{algorithm}");
            assert_eq!(reports[0].original_size, 2560);
            assert_eq!(reports[0].compressed_size, encoded.len() as u64);
            assert!(reports[0].compressed_size < reports[0].original_size);
            assert!(reports[0].compression_applied);
            assert_eq!(reports[0].encoding_used, algorithm.content_encoding());
        }
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate"))]
    fn test_quality_weighted_negotiation() {
        let response = serve(
            Config::default(),
            large_body(),
            get(Some("br;q=0.5, gzip;q=0.7, deflate;q=0.3")),
        );
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate", feature = "zstd"))]
    fn test_priority_tie_break_prefers_brotli() {
        let response = serve(
            Config::default(),
            large_body(),
            get(Some("gzip, deflate, br, zstd")),
        );
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "br"
        );
    }

    #[test]
    fn test_no_acceptable_encoding_passes_through() {
        let (config, reports) = config_with_recorder();
        let response = serve(config, large_body(), get(Some("doesnotexist")));

        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(response.headers().get(header::VARY).is_none());
        assert_eq!(read_body(response.into_body()), large_body());

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].original_size, 2560);
        assert_eq!(reports[0].compressed_size, 2560);
        assert!(!reports[0].compression_applied);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_excluded_request_passes_through() {
        let config = Config::builder()
            .exclude(|parts| parts.uri.path() == "/")
            .build()
            .unwrap();
        let response = serve(config, large_body(), get(Some("gzip")));
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_inner_content_length_replaced_when_compressing() {
        let service = service_fn(|_req: Request<DecompressionBody<Full<Bytes>>>| async {
            let body = large_body();
            let response = Response::builder()
                .header(header::CONTENT_LENGTH, body.len())
                .body(Full::new(Bytes::from(body)))
                .unwrap();
            Ok::<_, io::Error>(response)
        });
        let service = CompressionService::new(service, Arc::new(Config::default()));
        let response = block_on(service.oneshot(get(Some("gzip")))).unwrap();

        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(response.body().size_hint().exact(), None);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_too_many_request_encodings_rejected() {
        let (config, reports) = config_with_recorder();
        let called = Arc::new(AtomicUsize::new(0));
        let calls = called.clone();
        let service = service_fn(move |_req: Request<DecompressionBody<Full<Bytes>>>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(Response::new(Full::new(Bytes::from(large_body())))) }
        });
        let service = CompressionService::new(service, Arc::new(config));

        let request = Request::post("/")
            .header(header::CONTENT_ENCODING, "gzip, gzip")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Full::new(Bytes::from(compress(Algorithm::Gzip, b"payload"))))
            .unwrap();
        let response = block_on(service.oneshot(request)).unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(
            response
                .headers()
                .get(header::ACCEPT_ENCODING)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("gzip")
        );
        assert!(read_body(response.into_body()).is_empty());
        assert_eq!(called.load(Ordering::SeqCst), 0);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], MetricsData::default());
    }

    #[test]
    fn test_unknown_request_encoding_rejected() {
        let request = Request::post("/")
            .header(header::CONTENT_ENCODING, "compress")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();
        let response = serve(Config::default(), large_body(), request);
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_request_body_decoded_for_handler() {
        let service = service_fn(|req: Request<DecompressionBody<Full<Bytes>>>| async move {
            assert!(req.headers().get(header::CONTENT_ENCODING).is_none());
            assert!(req.headers().get(header::CONTENT_LENGTH).is_none());
            let body = req.into_body().collect().await?.to_bytes();
            Ok::<_, io::Error>(Response::new(Full::new(body)))
        });
        let service = CompressionService::new(service, Arc::new(Config::default()));

        let compressed = compress(Algorithm::Gzip, SMALL_BODY.as_bytes());
        let request = Request::post("/")
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, compressed.len())
            .body(Full::new(Bytes::from(compressed)))
            .unwrap();
        let response = block_on(service.oneshot(request)).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response.into_body()), SMALL_BODY);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_inner_error_reports_metrics_once() {
        let (config, reports) = config_with_recorder();
        let service = service_fn(|_req: Request<DecompressionBody<Full<Bytes>>>| async {
            Err::<Response<Full<Bytes>>, _>(io::Error::other("handler failed"))
        });
        let service = CompressionService::new(service, Arc::new(config));

        let result = block_on(service.oneshot(get(Some("gzip"))));
        assert_eq!(result.unwrap_err().to_string(), "handler failed");

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], MetricsData::default());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_dropped_response_reports_metrics_once() {
        let (config, reports) = config_with_recorder();
        let response = serve(config, large_body(), get(Some("gzip")));
        drop(response);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].compression_applied);
        // The single frame was buffered before the swap; nothing reached the client.
        assert_eq!(reports[0].original_size, 2560);
        assert_eq!(reports[0].compressed_size, 0);
    }
}
