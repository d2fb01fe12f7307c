use crate::config::Config;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that negotiates response compression and decodes request bodies.
///
/// All services produced by one layer share the same [`Config`].
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    config: Arc<Config>,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings.
    ///
    /// Every algorithm compiled into the crate is enabled and responses shorter
    /// than [`DEFAULT_MIN_SIZE`](crate::DEFAULT_MIN_SIZE) bytes are sent as-is.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a compression layer from a validated configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Returns the configuration shared by the produced services.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, self.config.clone())
    }
}
