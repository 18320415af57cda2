//! Command-line surface for querybench.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use querybench::{
    BalancingTransport, BatchStore, Dispatcher, HarnessConfig, Metrics, TransportConfig,
};

/// Replay batches of select-rows queries against a set of proxies.
#[derive(Parser, Debug, Clone)]
#[command(name = "querybench", version, about)]
pub struct Args {
    /// Proxy endpoints (host:port), comma separated
    #[arg(long, required = true, value_delimiter = ',')]
    pub proxy: Vec<String>,

    /// Query file: one query per line, blank line between batches
    #[arg(long)]
    pub input: PathBuf,

    /// Auth token sent to the proxies
    #[arg(long, env = "QUERYBENCH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Milliseconds before a call is also sent to the next proxy
    #[arg(long = "switchtimeout", default_value_t = 60)]
    pub switch_timeout_ms: u64,

    /// Worker count
    #[arg(long, default_value_t = 12)]
    pub threads: usize,

    /// Runtime I/O threads (tokio default when unset)
    #[arg(long = "niothreads")]
    pub io_threads: Option<usize>,

    /// Batches per second (unlimited when unset)
    #[arg(long)]
    pub rps: Option<u32>,

    /// Maximum batches in flight
    #[arg(long, default_value_t = 100)]
    pub inflight: usize,

    /// Health probe timeout in milliseconds
    #[arg(long = "pingtimeout", default_value_t = 5000)]
    pub ping_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[arg(long = "requesttimeout", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Seconds between metrics reports
    #[arg(long = "report-interval", default_value_t = 5)]
    pub report_interval_secs: u64,
}

impl Args {
    pub fn to_config(&self) -> HarnessConfig {
        let transport = TransportConfig::new(
            self.proxy
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty()),
        )
        .with_token(self.token.clone().filter(|t| !t.is_empty()))
        .with_switch_timeout(Duration::from_millis(self.switch_timeout_ms))
        .with_health_probe_timeout(Duration::from_millis(self.ping_timeout_ms))
        .with_request_timeout(Duration::from_millis(self.request_timeout_ms));

        HarnessConfig::new(transport)
            .with_threads(self.threads)
            .with_io_threads(self.io_threads)
            .with_rate_limit(self.rps)
            .with_inflight(self.inflight)
            .with_report_interval(Duration::from_secs(self.report_interval_secs))
    }
}

/// Filter directives for a `QUERYBENCH_LOG` value. Unknown values fall back to `info`.
fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("querybench={level},querybench_cli={level}")
}

/// Initialize tracing with QUERYBENCH_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(
            std::env::var("QUERYBENCH_LOG").ok().as_deref(),
        ))
    };

    let format: Box<dyn Layer<Registry> + Send + Sync> =
        if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
            fmt::layer().json().with_writer(std::io::stderr).boxed()
        } else {
            fmt::layer().with_writer(std::io::stderr).boxed()
        };

    let _ = tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .try_init();
}

/// Load the input, connect to the proxies and run until the process is killed.
pub async fn run(config: HarnessConfig, input: &Path) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let store = BatchStore::load(input)?;
    if store.total_queries() == 0 {
        tracing::warn!(path = %input.display(), "Input holds no queries");
    }

    let transport = BalancingTransport::connect(&config.transport)
        .context("failed to set up proxy transport")?;

    let metrics = Arc::new(Metrics::new());
    let reporter = metrics.spawn_reporter(config.report_interval);

    let dispatcher = Dispatcher::new(&config, store, Arc::new(transport), metrics.clone())?;
    tracing::info!(
        proxies = config.transport.endpoints.len(),
        rps = config.rate_limit,
        "Starting load"
    );
    dispatcher.start().join().await;

    reporter.abort();
    metrics.snapshot().log();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("querybench").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let args = parse(&["--proxy", "p1:80", "--input", "queries.txt"]).unwrap();
        assert_eq!(args.proxy, vec!["p1:80"]);
        assert_eq!(args.input, PathBuf::from("queries.txt"));
        assert_eq!(args.switch_timeout_ms, 60);
        assert_eq!(args.threads, 12);
        assert_eq!(args.io_threads, None);
        assert_eq!(args.rps, None);
        assert_eq!(args.inflight, 100);
        assert_eq!(args.ping_timeout_ms, 5000);
        assert_eq!(args.request_timeout_ms, 5000);
        assert_eq!(args.report_interval_secs, 5);
    }

    #[test]
    fn proxy_list_is_comma_separated() {
        let args = parse(&["--proxy", "p1:80,p2:80,p3:8080", "--input", "q"]).unwrap();
        assert_eq!(args.proxy, vec!["p1:80", "p2:80", "p3:8080"]);
        assert_eq!(args.to_config().transport.endpoints.len(), 3);
    }

    #[test]
    fn missing_required_flags_fail() {
        let err = parse(&["--input", "q"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        let err = parse(&["--proxy", "p1:80"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn flags_map_onto_config() {
        let args = parse(&[
            "--proxy",
            "p1:80, p2:80",
            "--input",
            "q",
            "--token",
            "secret",
            "--switchtimeout",
            "25",
            "--threads",
            "4",
            "--niothreads",
            "2",
            "--rps",
            "200",
            "--inflight",
            "16",
            "--pingtimeout",
            "750",
            "--requesttimeout",
            "1500",
            "--report-interval",
            "10",
        ])
        .unwrap();

        let config = args.to_config();
        assert_eq!(config.threads, 4);
        assert_eq!(config.io_threads, Some(2));
        assert_eq!(config.rate_limit, Some(200));
        assert_eq!(config.pacing(), Some(Duration::from_millis(5)));
        assert_eq!(config.inflight, 16);
        assert_eq!(config.queue_capacity(), 8);
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.transport.endpoints, vec!["p1:80", "p2:80"]);
        assert_eq!(config.transport.token.as_deref(), Some("secret"));
        assert_eq!(config.transport.switch_timeout, Duration::from_millis(25));
        assert_eq!(
            config.transport.health_probe_timeout,
            Duration::from_millis(750)
        );
        assert_eq!(config.transport.request_timeout, Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_numeric_threads_rejected() {
        let err = parse(&["--proxy", "p", "--input", "q", "--threads", "many"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn log_level_maps_onto_both_crates() {
        assert_eq!(
            default_filter(None),
            "querybench=info,querybench_cli=info"
        );
        assert_eq!(
            default_filter(Some("warning")),
            "querybench=warn,querybench_cli=warn"
        );
        assert_eq!(
            default_filter(Some("trace")),
            "querybench=trace,querybench_cli=trace"
        );
        assert_eq!(
            default_filter(Some("loud")),
            "querybench=info,querybench_cli=info"
        );
    }

    #[tokio::test]
    async fn run_fails_on_missing_input() {
        let config = HarnessConfig::new(TransportConfig::new(["127.0.0.1:1"]));
        let err = run(config, Path::new("/nonexistent/querybench/input.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read input"), "{err:#}");
    }

    #[tokio::test]
    async fn run_rejects_invalid_config() {
        let config = HarnessConfig::new(TransportConfig::new(["p:80"])).with_threads(0);
        let err = run(config, Path::new("unused")).await.unwrap_err();
        assert!(format!("{err:#}").contains("worker thread count"));
    }
}
