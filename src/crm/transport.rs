//! HTTP transport for the CRM API.
//!
//! [`CrmTransport`] is the seam between the batching core and the wire:
//! [`HttpTransport`] talks to the real provider over a pooled reqwest client,
//! while [`MockTransport`] serves canned responses for tests and offline runs.

use crate::config::CrmConfig;
use crate::crm::types::CrmError;
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// One outbound CRM call. Implementations map non-2xx responses to
/// [`CrmError::Provider`] and transport-level failures to [`CrmError::Network`].
#[async_trait]
pub trait CrmTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CrmError>;
}

/// Pooled reqwest-backed transport with bearer auth and the provider's
/// `Version` header applied to every call.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| CrmError::InvalidBaseUrl(format!("{}: {}", config.base_url, e)))?;

        if config.api_token.is_empty() {
            return Err(CrmError::Configuration(
                "API token is required; set crm.api_token or LEADFLOW_API_TOKEN".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_token))
            .map_err(|_| CrmError::Configuration("API token is not a valid header value".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        let version = HeaderValue::from_str(&config.api_version)
            .map_err(|_| CrmError::Configuration("api_version is not a valid header value".into()))?;
        headers.insert("Version", version);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(config.tcp_keepalive)
            .user_agent(concat!("leadflow/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| CrmError::Configuration(e.to_string()))?;

        debug!(base_url = %base, "CRM HTTP transport initialized");
        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl CrmTransport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CrmError> {
        let url = self.endpoint(path);
        debug!(%method, %url, "CRM request");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CrmError::Network(e.to_string()))?;

        let status = response.status();
        let payload = match response.json::<Value>().await {
            Ok(value) => value,
            Err(e) => {
                if status.is_success() {
                    warn!(%url, error = %e, "CRM response was not valid JSON");
                }
                json!({ "message": e.to_string() })
            }
        };

        if status.is_success() {
            Ok(payload)
        } else {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error"))
                .to_string();
            Err(CrmError::Provider {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// A recorded call made against a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub at: Instant,
}

struct MockRoute {
    method: Method,
    prefix: String,
    responses: VecDeque<Result<Value, CrmError>>,
}

/// Offline transport serving canned responses, longest-prefix matched on the
/// request path. Unmatched calls answer `{"ok": true}`.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<MockRoute>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response, repeated for every matching call.
    pub fn on(&self, method: Method, path_prefix: &str, response: Value) {
        self.push_route(method, path_prefix, Ok(response));
    }

    /// Register a provider failure for matching calls.
    pub fn fail(&self, method: Method, path_prefix: &str, status: u16, message: &str) {
        self.push_route(
            method,
            path_prefix,
            Err(CrmError::Provider {
                status,
                message: message.to_string(),
            }),
        );
    }

    /// Register a transport-level failure for matching calls.
    pub fn fail_network(&self, method: Method, path_prefix: &str, message: &str) {
        self.push_route(method, path_prefix, Err(CrmError::Network(message.to_string())));
    }

    fn push_route(&self, method: Method, prefix: &str, response: Result<Value, CrmError>) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.prefix == prefix)
        {
            route.responses.push_back(response);
        } else {
            routes.push(MockRoute {
                method,
                prefix: prefix.to_string(),
                responses: VecDeque::from([response]),
            });
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: Method, path_prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.path.starts_with(path_prefix))
            .count()
    }
}

#[async_trait]
impl CrmTransport for MockTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CrmError> {
        self.calls.lock().unwrap().push(MockCall {
            method: method.clone(),
            path: path.to_string(),
            body: body.cloned(),
            at: Instant::now(),
        });

        let mut routes = self.routes.lock().unwrap();
        // Longest matching prefix wins so specific routes shadow catch-alls.
        let route = routes
            .iter_mut()
            .filter(|r| r.method == method && path.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len());

        match route {
            Some(route) => {
                let response = if route.responses.len() > 1 {
                    route.responses.pop_front().unwrap_or(Ok(json!({ "ok": true })))
                } else {
                    route
                        .responses
                        .front()
                        .cloned()
                        .unwrap_or(Ok(json!({ "ok": true })))
                };
                response
            }
            None => Ok(json!({ "ok": true })),
        }
    }
}
