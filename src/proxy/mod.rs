//! Stateless invocation proxy: turns a resolved provider into a callable
//! handle.
//!
//! Every invocation is one self-contained network exchange: a fresh
//! client, the protocol handshake, the tool call, teardown. Nothing is
//! pooled or kept warm between calls; with the mesh behind external load
//! balancers, consecutive calls from the same consumer must be free to
//! land on different replicas.
//!
//! The proxy never retries. On [`ProxyError::ProviderUnreachable`] the
//! caller re-resolves through its next heartbeat and retries at most
//! once against the fresh assignment.

pub mod content;

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::errors::ProxyError;
use crate::registry::types::ResolvedProvider;

pub use content::extract_content;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BOTH: &str = "application/json, text/event-stream";
const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

/// Callable handle for one resolved provider tool.
pub struct InvocationProxy {
    provider: ResolvedProvider,
    timeout: Duration,
}

impl InvocationProxy {
    pub fn new(provider: ResolvedProvider) -> Self {
        Self {
            provider,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for the entire invocation, handshake included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider(&self) -> &ResolvedProvider {
        &self.provider
    }

    /// Calls the provider tool with the given arguments and returns the
    /// normalized result value.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::ProviderUnreachable`] for connect failures, stale
    ///   endpoints, and non-HTTP transports
    /// - [`ProxyError::Timeout`] when the deadline elapses; the in-flight
    ///   request is aborted
    /// - [`ProxyError::Call`] when the provider reports a tool failure
    /// - [`ProxyError::Protocol`] for malformed envelopes
    pub async fn invoke(&self, arguments: Value) -> Result<Value, ProxyError> {
        log::debug!(
            "invoking {} on {} at {}",
            self.provider.tool_name,
            self.provider.agent_id,
            self.provider.endpoint
        );
        let url = self.http_url()?;
        let result = match tokio::time::timeout(self.timeout, self.invoke_inner(&url, arguments))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout {
                tool_name: self.provider.tool_name.clone(),
                timeout_secs: self.timeout.as_secs(),
            }),
        };
        if let Err(ProxyError::ProviderUnreachable { endpoint, reason }) = &result {
            log::error!(
                "provider {} unreachable at {endpoint}: {reason}",
                self.provider.agent_id
            );
        }
        result
    }

    /// Lists the tools the provider currently exposes.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`InvocationProxy::invoke`].
    pub async fn list_tools(&self) -> Result<Vec<Value>, ProxyError> {
        let url = self.http_url()?;
        let listing = async {
            let client = self.build_client()?;
            let session = self.initialize(&client, &url).await?;
            let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
            let envelope = self.post(&client, &url, &payload, session.as_deref()).await?;
            let result = rpc_result(envelope)?;
            Ok(result
                .get("tools")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        };
        match tokio::time::timeout(self.timeout, listing).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout {
                tool_name: self.provider.tool_name.clone(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn invoke_inner(&self, url: &str, arguments: Value) -> Result<Value, ProxyError> {
        let client = self.build_client()?;
        let session = self.initialize(&client, url).await?;

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": self.provider.tool_name, "arguments": arguments},
        });
        let envelope = self.post(&client, url, &payload, session.as_deref()).await?;
        let result = rpc_result(envelope)?;
        content::extract_content(&result)
        // client drops here on every path; the connection is torn down
        // whether the call succeeded or not
    }

    async fn initialize(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<Option<String>, ProxyError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "capmesh-proxy", "version": crate::VERSION},
            },
        });
        let response = client
            .post(url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let envelope = self.read_payload(response).await?;
        rpc_result(envelope)?;

        // Handshake completion notification; providers answer 202 with
        // no body, and a provider that ignores it still serves the call.
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let mut request = client.post(url).header(ACCEPT, ACCEPT_BOTH).json(&note);
        if let Some(id) = &session {
            request = request.header(SESSION_HEADER, id);
        }
        let _ = request.send().await;

        Ok(session)
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        url: &str,
        payload: &Value,
        session: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let mut request = client.post(url).header(ACCEPT, ACCEPT_BOTH).json(payload);
        if let Some(id) = session {
            request = request.header(SESSION_HEADER, id);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        self.read_payload(response).await
    }

    async fn read_payload(&self, response: reqwest::Response) -> Result<Value, ProxyError> {
        let status = response.status();
        if matches!(
            status,
            StatusCode::NOT_FOUND
                | StatusCode::GONE
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ) {
            // Whatever answers at this address no longer speaks for the
            // provider; treat it as a stale endpoint.
            return Err(ProxyError::ProviderUnreachable {
                endpoint: self.provider.endpoint.clone(),
                reason: format!("endpoint answered {status}"),
            });
        }
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(ProxyError::Protocol {
                message: format!("unexpected status {status}"),
            });
        }
        parse_body(&text)
    }

    fn build_client(&self) -> Result<reqwest::Client, ProxyError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Protocol {
                message: format!("client construction failed: {e}"),
            })
    }

    fn http_url(&self) -> Result<String, ProxyError> {
        let endpoint = self.provider.endpoint.trim_end_matches('/');
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ProxyError::ProviderUnreachable {
                endpoint: self.provider.endpoint.clone(),
                reason: "transport not supported by the http proxy".to_string(),
            });
        }
        // Trailing slash avoids a 307 redirect on the provider side.
        Ok(format!("{endpoint}/mcp/"))
    }

    fn transport_error(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::Timeout {
                tool_name: self.provider.tool_name.clone(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            ProxyError::ProviderUnreachable {
                endpoint: self.provider.endpoint.clone(),
                reason: err.to_string(),
            }
        }
    }
}

/// Unwraps a JSON-RPC envelope into its `result`.
fn rpc_result(envelope: Value) -> Result<Value, ProxyError> {
    if let Some(error) = envelope.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ProxyError::Call { message });
    }
    envelope.get("result").cloned().ok_or_else(|| ProxyError::Protocol {
        message: "response carries neither result nor error".to_string(),
    })
}

/// Decodes a response body that may be plain JSON or SSE-framed, taking
/// the first `data:` line that parses.
fn parse_body(text: &str) -> Result<Value, ProxyError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with("event:") || trimmed.starts_with("data:") {
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                if let Ok(value) = serde_json::from_str(data.trim()) {
                    return Ok(value);
                }
            }
        }
        return Err(ProxyError::Protocol {
            message: "no JSON payload in event stream".to_string(),
        });
    }
    serde_json::from_str(text).map_err(|e| ProxyError::Protocol {
        message: format!("response is not JSON: {e}"),
    })
}
