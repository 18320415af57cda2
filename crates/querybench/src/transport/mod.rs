//! Query transport.
//!
//! `Transport` is what the worker pool talks to: one `submit` per query,
//! returning a future for the remote call. `BalancingTransport` spreads calls
//! over a set of `Endpoint`s with switch-timeout failover; `HttpEndpoint` is
//! the HTTP proxy implementation.

mod balancing;
mod http;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use balancing::BalancingTransport;
pub use http::{HttpEndpoint, build_client};

/// Future of one remote call.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<QueryResult, CallError>> + Send>>;

/// Future of one health probe.
pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<(), CallError>> + Send>>;

/// Successful call outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Address of the endpoint that answered.
    pub endpoint: String,
    /// Response body size.
    pub bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("all {attempts} endpoints failed, last error: {last}")]
    AllEndpointsFailed {
        attempts: usize,
        #[source]
        last: Box<CallError>,
    },
    #[error("no endpoints configured")]
    NoEndpoints,
}

/// Synchronous rejection of a call before anything is sent.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("query is blank")]
    BlankQuery,
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("invalid endpoint address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("auth token is not a valid header value")]
    InvalidToken,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Issues remote calls. Shared by every worker.
pub trait Transport: Send + Sync {
    /// Start one call for `query`.
    ///
    /// Returns `Err` when the call cannot be built at all. The returned future
    /// is `'static` and may be polled on any runtime thread.
    fn submit(&self, query: Arc<str>) -> Result<CallFuture, TransportError>;
}

/// One remote address a `BalancingTransport` can send to.
pub trait Endpoint: Send + Sync {
    fn address(&self) -> &str;

    fn call(&self, query: Arc<str>) -> CallFuture;

    /// Lightweight liveness check.
    fn probe(&self) -> ProbeFuture;
}
