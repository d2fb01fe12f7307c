use crate::codec::Algorithm;
use std::fmt;
use std::sync::Arc;

/// Callback receiving the metrics of each finished response.
pub type MetricsHandler = Arc<dyn Fn(MetricsData) + Send + Sync>;

/// Outcome of a single response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsData {
    /// Bytes produced by the wrapped service.
    pub original_size: u64,
    /// Bytes handed to the transport. Equal to `original_size` when the
    /// response was not compressed.
    pub compressed_size: u64,
    /// Whether the body went through an encoder.
    pub compression_applied: bool,
    /// `Content-Encoding` token used, or empty.
    pub encoding_used: &'static str,
}

/// Accumulates sizes for one response and reports them exactly once.
///
/// Reporting happens on [`finish`](Self::finish) or, failing that, on drop, so
/// aborted and failed responses are still accounted for.
pub(crate) struct MetricsGuard {
    handler: Option<MetricsHandler>,
    original_size: u64,
    transport_size: u64,
    encoding: Option<Algorithm>,
    reported: bool,
}

impl MetricsGuard {
    pub(crate) fn new(handler: Option<MetricsHandler>) -> Self {
        Self {
            handler,
            original_size: 0,
            transport_size: 0,
            encoding: None,
            reported: false,
        }
    }

    pub(crate) fn record_original(&mut self, len: usize) {
        self.original_size += len as u64;
    }

    pub(crate) fn record_transport(&mut self, len: usize) {
        self.transport_size += len as u64;
    }

    pub(crate) fn set_encoding(&mut self, algorithm: Algorithm) {
        self.encoding = Some(algorithm);
    }

    pub(crate) fn data(&self) -> MetricsData {
        match self.encoding {
            Some(algorithm) => MetricsData {
                original_size: self.original_size,
                compressed_size: self.transport_size,
                compression_applied: true,
                encoding_used: algorithm.content_encoding(),
            },
            None => MetricsData {
                original_size: self.original_size,
                compressed_size: self.original_size,
                compression_applied: false,
                encoding_used: "",
            },
        }
    }

    pub(crate) fn finish(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;

        let data = self.data();
        tracing::trace!(
            original_size = data.original_size,
            compressed_size = data.compressed_size,
            compression_applied = data.compression_applied,
            encoding = data.encoding_used,
            "response finished"
        );
        if let Some(handler) = self.handler.take() {
            handler(data);
        }
    }
}

impl Drop for MetricsGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for MetricsGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsGuard")
            .field("original_size", &self.original_size)
            .field("transport_size", &self.transport_size)
            .field("encoding", &self.encoding)
            .field("reported", &self.reported)
            .finish()
    }
}
