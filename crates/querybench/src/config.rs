//! Run configuration.
//!
//! Built once at startup (usually from CLI flags) and never mutated afterwards.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("worker thread count must be greater than zero")]
    ZeroThreads,
    #[error("inflight capacity must be greater than zero")]
    ZeroInflight,
    #[error("rate limit must be greater than zero batches per second")]
    ZeroRate,
    #[error("I/O thread count must be greater than zero")]
    ZeroIoThreads,
    #[error("report interval must be greater than zero")]
    ZeroReportInterval,
    #[error("at least one proxy endpoint is required")]
    NoEndpoints,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Settings for the multi-endpoint transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Proxy addresses, `host:port` or a full `http(s)://` base URL.
    pub endpoints: Vec<String>,
    pub token: Option<String>,
    /// How long one endpoint gets before the call is also sent to the next.
    pub switch_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub health_probe_interval: Duration,
    pub request_timeout: Duration,
}

impl TransportConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Bearer token sent with every request. `None` disables auth.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// How long an attempt may run before the call is also sent to the next endpoint.
    pub fn with_switch_timeout(mut self, timeout: Duration) -> Self {
        self.switch_timeout = timeout;
        self
    }

    /// Deadline for one health check; a slower endpoint counts as unhealthy.
    pub fn with_health_probe_timeout(mut self, timeout: Duration) -> Self {
        self.health_probe_timeout = timeout;
        self
    }

    /// Pause between health check rounds.
    pub fn with_health_probe_interval(mut self, interval: Duration) -> Self {
        self.health_probe_interval = interval;
        self
    }

    /// Per-request HTTP timeout applied by the client.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for (name, value) in [
            ("switch timeout", self.switch_timeout),
            ("health probe timeout", self.health_probe_timeout),
            ("health probe interval", self.health_probe_interval),
            ("request timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            token: None,
            switch_timeout: Duration::from_millis(60),
            health_probe_timeout: Duration::from_millis(5000),
            health_probe_interval: Duration::from_secs(5),
            request_timeout: Duration::from_millis(5000),
        }
    }
}

/// Settings for the feeder, worker pool and admission controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub threads: usize,
    /// Runtime worker threads. `None` keeps the tokio default.
    pub io_threads: Option<usize>,
    /// Batches per second. `None` means unpaced.
    pub rate_limit: Option<u32>,
    pub inflight: usize,
    pub report_interval: Duration,
    pub transport: TransportConfig,
}

impl HarnessConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Number of dispatch workers.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Runtime worker threads. `None` keeps the tokio default.
    pub fn with_io_threads(mut self, io_threads: Option<usize>) -> Self {
        self.io_threads = io_threads;
        self
    }

    /// Batches per second. `None` feeds as fast as the queue accepts.
    pub fn with_rate_limit(mut self, rate_limit: Option<u32>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Maximum batches dispatched but not yet completed.
    pub fn with_inflight(mut self, inflight: usize) -> Self {
        self.inflight = inflight;
        self
    }

    /// Period of the metrics report.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Work queue capacity: two batches per worker.
    pub fn queue_capacity(&self) -> usize {
        self.threads.saturating_mul(2)
    }

    /// Sleep between successive enqueues, if paced.
    pub fn pacing(&self) -> Option<Duration> {
        self.rate_limit
            .filter(|&rate| rate > 0)
            .map(|rate| Duration::from_secs(1) / rate)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.inflight == 0 {
            return Err(ConfigError::ZeroInflight);
        }
        if self.rate_limit == Some(0) {
            return Err(ConfigError::ZeroRate);
        }
        if self.io_threads == Some(0) {
            return Err(ConfigError::ZeroIoThreads);
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroReportInterval);
        }
        self.transport.validate()
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads: 12,
            io_threads: None,
            rate_limit: None,
            inflight: 100,
            report_interval: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}
