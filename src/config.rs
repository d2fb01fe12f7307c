use crate::codec::Algorithm;
use crate::error::ConfigError;
use crate::metrics::{MetricsData, MetricsHandler};
use http::request::Parts;
use std::fmt;
use std::sync::Arc;

/// Default minimum number of response bytes before compression kicks in.
pub const DEFAULT_MIN_SIZE: usize = 512;

/// Default number of request content codings that will be decoded.
pub const DEFAULT_MAX_DECODE_STEPS: usize = 1;

/// Predicate deciding that a request must never receive a compressed response.
pub type ExcludePredicate = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Per-algorithm settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSettings {
    /// Whether the algorithm may be negotiated or decoded.
    pub enabled: bool,
    /// Compression level; `None` uses the codec default.
    pub level: Option<i32>,
    /// Tie-break weight among candidates with equal quality. Higher wins.
    pub priority: i32,
}

/// Configuration shared by every request passing through the middleware.
///
/// Built once through [`Config::builder`] and never mutated afterwards.
#[derive(Clone)]
pub struct Config {
    algorithms: [AlgorithmSettings; 4],
    min_size: usize,
    max_decode_steps: usize,
    decompress_requests: bool,
    exclude: Option<ExcludePredicate>,
    metrics_handler: Option<MetricsHandler>,
}

impl Config {
    /// Starts a builder populated with the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Settings for `algorithm`.
    pub fn settings(&self, algorithm: Algorithm) -> &AlgorithmSettings {
        &self.algorithms[algorithm.index()]
    }

    /// Whether `algorithm` may be used.
    pub fn is_enabled(&self, algorithm: Algorithm) -> bool {
        self.settings(algorithm).enabled
    }

    /// Enabled algorithms in fallback order.
    pub fn enabled_algorithms(&self) -> impl Iterator<Item = Algorithm> + '_ {
        Algorithm::ALL
            .into_iter()
            .filter(|algorithm| self.is_enabled(*algorithm))
    }

    /// Swap threshold in bytes.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Maximum number of request content codings decoded.
    pub fn max_decode_steps(&self) -> usize {
        self.max_decode_steps
    }

    /// Whether compressed request bodies are decoded.
    pub fn decompress_requests(&self) -> bool {
        self.decompress_requests
    }

    /// Whether the exclusion predicate rules out compression for this request.
    pub fn is_excluded(&self, request: &Parts) -> bool {
        self.exclude.as_ref().is_some_and(|exclude| exclude(request))
    }

    pub(crate) fn metrics_handler(&self) -> Option<MetricsHandler> {
        self.metrics_handler.clone()
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut algorithms = [AlgorithmSettings {
            enabled: false,
            level: None,
            priority: 0,
        }; 4];
        for algorithm in Algorithm::ALL {
            algorithms[algorithm.index()] = AlgorithmSettings {
                enabled: algorithm.is_available(),
                level: None,
                priority: algorithm.default_priority(),
            };
        }

        Self {
            algorithms,
            min_size: DEFAULT_MIN_SIZE,
            max_decode_steps: DEFAULT_MAX_DECODE_STEPS,
            decompress_requests: true,
            exclude: None,
            metrics_handler: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("algorithms", &self.algorithms)
            .field("min_size", &self.min_size)
            .field("max_decode_steps", &self.max_decode_steps)
            .field("decompress_requests", &self.decompress_requests)
            .field("exclude", &self.exclude.is_some())
            .field("metrics_handler", &self.metrics_handler.is_some())
            .finish()
    }
}

/// Builder for [`Config`]. Validation happens in [`ConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Enables or disables an algorithm.
    pub fn enable(mut self, algorithm: Algorithm, enabled: bool) -> Self {
        self.config.algorithms[algorithm.index()].enabled = enabled;
        self
    }

    /// Sets the compression level used when encoding responses.
    pub fn compression_level(mut self, algorithm: Algorithm, level: i32) -> Self {
        self.config.algorithms[algorithm.index()].level = Some(level);
        self
    }

    /// Sets the tie-break priority of an algorithm.
    pub fn priority(mut self, algorithm: Algorithm, priority: i32) -> Self {
        self.config.algorithms[algorithm.index()].priority = priority;
        self
    }

    /// Skips compression for requests matching `predicate`.
    ///
    /// The predicate runs before the inner service, so only request data is
    /// available to it.
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.config.exclude = Some(Arc::new(predicate));
        self
    }

    /// Sets the minimum number of bytes a response must reach to be compressed.
    pub fn min_size(mut self, size: usize) -> Self {
        self.config.min_size = size;
        self
    }

    /// Sets how many chained request content codings are decoded.
    pub fn max_decode_steps(mut self, steps: usize) -> Self {
        self.config.max_decode_steps = steps;
        self
    }

    /// Enables or disables decoding of compressed request bodies.
    pub fn decompress_requests(mut self, enabled: bool) -> Self {
        self.config.decompress_requests = enabled;
        self
    }

    /// Registers a callback receiving one [`MetricsData`] per response.
    ///
    /// The callback runs on the task completing the response and should not
    /// block.
    pub fn metrics_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(MetricsData) + Send + Sync + 'static,
    {
        self.config.metrics_handler = Some(Arc::new(handler));
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        for algorithm in Algorithm::ALL {
            let settings = self.config.settings(algorithm);
            if !settings.enabled {
                continue;
            }
            if !algorithm.is_available() {
                return Err(ConfigError::Unavailable(algorithm));
            }
            if let Some(level) = settings.level {
                let range = algorithm.level_range();
                if !range.contains(&level) {
                    return Err(ConfigError::LevelOutOfRange {
                        algorithm,
                        level,
                        min: *range.start(),
                        max: *range.end(),
                    });
                }
            }
        }
        Ok(self.config)
    }
}
