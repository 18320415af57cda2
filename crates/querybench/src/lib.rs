//! querybench: rate-limited, admission-controlled query load generator.

mod health;
mod version;

pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod feeder;
pub mod metrics;
pub mod queue;
pub mod transport;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit, AdmissionSnapshot};
pub use batch::{Batch, BatchError, BatchStore, parse_batches};
pub use config::{ConfigError, HarnessConfig, TransportConfig};
pub use dispatcher::{DispatchError, DispatchSnapshot, Dispatcher, DispatcherHandle};
pub use feeder::Feeder;
pub use health::{EndpointHealth, EndpointStatus};
pub use metrics::{LatencySummary, Metrics, MetricsSink, MetricsSnapshot};
pub use queue::{QueueError, WorkQueue};
pub use transport::{
    BalancingTransport, CallError, CallFuture, Endpoint, HttpEndpoint, ProbeFuture, QueryResult,
    Transport, TransportError,
};
pub use version::{QUERYBENCH_VERSION, user_agent};
