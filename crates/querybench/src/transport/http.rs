//! HTTP proxy endpoint.
//!
//! Sends `GET {base}/api/v4/select_rows?query=<q>` and probes `GET {base}/ping`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};

use super::{CallError, CallFuture, Endpoint, ProbeFuture, QueryResult, TransportError};
use crate::version::user_agent;

const SELECT_ROWS_PATH: &str = "api/v4/select_rows";
const PING_PATH: &str = "ping";
const OUTPUT_FORMAT_HEADER: &str = "X-YT-Output-Format";
const OUTPUT_FORMAT_JSON: &str = "\"json\"";

/// Build the client shared by every endpoint of one transport.
///
/// The token, when present, is sent as `Authorization: OAuth <token>`.
pub fn build_client(
    token: Option<&str>,
    request_timeout: Duration,
) -> Result<reqwest::Client, TransportError> {
    let mut headers = HeaderMap::new();

    if let Some(token) = token {
        let mut value = HeaderValue::from_str(&format!("OAuth {token}"))
            .map_err(|_| TransportError::InvalidToken)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if let Ok(value) = HeaderValue::from_str(&user_agent()) {
        headers.insert(USER_AGENT, value);
    }

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(request_timeout)
        .build()?)
}

#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    address: String,
    select_url: Url,
    ping_url: Url,
    client: reqwest::Client,
}

impl HttpEndpoint {
    /// `address` is `host:port` (plain HTTP) or a full `http(s)://` base URL.
    pub fn new(address: &str, client: reqwest::Client) -> Result<Self, TransportError> {
        let base = parse_base(address)?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| TransportError::InvalidAddress {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
        };

        Ok(Self {
            address: address.to_string(),
            select_url: join(SELECT_ROWS_PATH)?,
            ping_url: join(PING_PATH)?,
            client,
        })
    }

    pub fn select_url(&self) -> &Url {
        &self.select_url
    }
}

fn parse_base(address: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let address = address.trim();
    if address.is_empty() {
        return Err(invalid("empty address".to_string()));
    }

    let raw = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let mut url = Url::parse(&raw).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    // Relative joins must extend the base path, not replace its last segment.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl Endpoint for HttpEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn call(&self, query: Arc<str>) -> CallFuture {
        let mut url = self.select_url.clone();
        url.query_pairs_mut().append_pair("query", &query);

        let request = self
            .client
            .get(url)
            .header(OUTPUT_FORMAT_HEADER, OUTPUT_FORMAT_JSON);
        let endpoint = self.address.clone();

        Box::pin(async move {
            let response = request.send().await.map_err(|source| CallError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(CallError::Status {
                    endpoint,
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await.map_err(|source| CallError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

            Ok(QueryResult {
                endpoint,
                bytes: body.len(),
            })
        })
    }

    fn probe(&self) -> ProbeFuture {
        let request = self.client.get(self.ping_url.clone());
        let endpoint = self.address.clone();

        Box::pin(async move {
            let response = request.send().await.map_err(|source| CallError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(CallError::Status {
                    endpoint,
                    status: status.as_u16(),
                })
            }
        })
    }
}
