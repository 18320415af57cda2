//! Multi-endpoint transport with switch-timeout failover.
//!
//! Each call starts on one endpoint (round-robin across selectable
//! endpoints). If that attempt has not finished within `switch_timeout`, or
//! fails, the call is also sent to the next endpoint while earlier attempts
//! keep running. The first success wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    CallError, CallFuture, Endpoint, HttpEndpoint, QueryResult, Transport, TransportError,
    build_client,
};
use crate::config::TransportConfig;
use crate::health::{EndpointHealth, EndpointStatus, HealthCell};

struct Member {
    endpoint: Arc<dyn Endpoint>,
    health: HealthCell,
}

struct Shared {
    members: Vec<Member>,
    next: AtomicUsize,
    switch_timeout: Duration,
    probe_timeout: Duration,
}

impl Shared {
    /// Attempt order for one call: selectable endpoints from the round-robin
    /// offset, then unhealthy ones as a last resort.
    fn attempt_order(&self) -> Vec<Arc<dyn Endpoint>> {
        let n = self.members.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;

        let mut order = Vec::with_capacity(n);
        let mut unhealthy = Vec::new();
        for i in 0..n {
            let member = &self.members[(start + i) % n];
            if member.health.get().is_selectable() {
                order.push(Arc::clone(&member.endpoint));
            } else {
                unhealthy.push(Arc::clone(&member.endpoint));
            }
        }
        order.extend(unhealthy);
        order
    }

    async fn probe_all(&self) {
        let probes = self.members.iter().map(|member| async move {
            let outcome = tokio::time::timeout(self.probe_timeout, member.endpoint.probe()).await;
            let health = match outcome {
                Ok(Ok(())) => EndpointHealth::Healthy,
                Ok(Err(e)) => {
                    tracing::debug!(endpoint = member.endpoint.address(), error = %e, "Health probe failed");
                    EndpointHealth::Unhealthy
                }
                Err(_) => {
                    tracing::debug!(
                        endpoint = member.endpoint.address(),
                        timeout_ms = self.probe_timeout.as_millis() as u64,
                        "Health probe timed out"
                    );
                    EndpointHealth::Unhealthy
                }
            };

            let previous = member.health.set(health);
            if previous != health {
                match health {
                    EndpointHealth::Unhealthy => tracing::warn!(
                        endpoint = member.endpoint.address(),
                        ?previous,
                        "Endpoint marked unhealthy"
                    ),
                    _ => tracing::info!(
                        endpoint = member.endpoint.address(),
                        ?previous,
                        "Endpoint healthy"
                    ),
                }
            }
        });
        futures::future::join_all(probes).await;
    }
}

pub struct BalancingTransport {
    shared: Arc<Shared>,
    probes: CancellationToken,
}

impl BalancingTransport {
    pub fn new(
        endpoints: Vec<Arc<dyn Endpoint>>,
        switch_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, TransportError> {
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        let members = endpoints
            .into_iter()
            .map(|endpoint| Member {
                endpoint,
                health: HealthCell::default(),
            })
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                members,
                next: AtomicUsize::new(0),
                switch_timeout,
                probe_timeout,
            }),
            probes: CancellationToken::new(),
        })
    }

    /// Build HTTP endpoints for every configured address. Probes are not started.
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = build_client(config.token.as_deref(), config.request_timeout)?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|address| {
                HttpEndpoint::new(address, client.clone())
                    .map(|endpoint| Arc::new(endpoint) as Arc<dyn Endpoint>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(
            endpoints,
            config.switch_timeout,
            config.health_probe_timeout,
        )
    }

    /// `from_config` plus a running health-probe loop.
    pub fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let transport = Self::from_config(config)?;
        transport.start_health_probes(config.health_probe_interval);
        tracing::info!(
            endpoints = transport.shared.members.len(),
            switch_timeout_ms = config.switch_timeout.as_millis() as u64,
            "Transport ready"
        );
        Ok(transport)
    }

    /// Probe every endpoint each `interval` until the transport is dropped.
    pub fn start_health_probes(&self, interval: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let cancel = self.probes.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => shared.probe_all().await,
                }
            }
            tracing::debug!("Health probe loop stopped");
        })
    }

    /// Run one probe round now.
    pub async fn probe_once(&self) {
        self.shared.probe_all().await;
    }

    pub fn health(&self) -> Vec<EndpointStatus> {
        self.shared
            .members
            .iter()
            .map(|member| EndpointStatus {
                address: member.endpoint.address().to_string(),
                health: member.health.get(),
            })
            .collect()
    }
}

impl Drop for BalancingTransport {
    fn drop(&mut self) {
        self.probes.cancel();
    }
}

impl Transport for BalancingTransport {
    fn submit(&self, query: Arc<str>) -> Result<CallFuture, TransportError> {
        if query.trim().is_empty() {
            return Err(TransportError::BlankQuery);
        }
        let order = self.shared.attempt_order();
        Ok(Box::pin(hedged_call(
            order,
            query,
            self.shared.switch_timeout,
        )))
    }
}

async fn hedged_call(
    order: Vec<Arc<dyn Endpoint>>,
    query: Arc<str>,
    switch_timeout: Duration,
) -> Result<QueryResult, CallError> {
    let attempts = order.len();
    let mut remaining = order.into_iter();
    let mut pending = FuturesUnordered::new();
    let mut last_error = None;

    loop {
        if pending.is_empty() {
            match remaining.next() {
                Some(endpoint) => pending.push(endpoint.call(Arc::clone(&query))),
                None => break,
            }
        }
        let has_more = !remaining.as_slice().is_empty();

        tokio::select! {
            Some(result) = pending.next() => match result {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::debug!(error = %e, "Attempt failed, switching endpoint");
                    last_error = Some(e);
                    if let Some(endpoint) = remaining.next() {
                        pending.push(endpoint.call(Arc::clone(&query)));
                    }
                }
            },
            _ = tokio::time::sleep(switch_timeout), if has_more => {
                if let Some(endpoint) = remaining.next() {
                    tracing::trace!(endpoint = endpoint.address(), "Switch timeout, hedging");
                    pending.push(endpoint.call(Arc::clone(&query)));
                }
            }
        }
    }

    Err(match last_error {
        Some(last) => CallError::AllEndpointsFailed {
            attempts,
            last: Box::new(last),
        },
        None => CallError::NoEndpoints,
    })
}
