//! Typed HTTP client for the registry wire protocol.
//!
//! This is the agent-runtime side of the protocol: register once at
//! startup, then alternate cheap HEAD checks with full heartbeats when
//! the registry signals a topology change, and unregister on graceful
//! shutdown.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::errors::ClientError;
use crate::registry::types::{
    FastHeartbeatStatus, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
};

/// Client for one registry endpoint.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    /// Creates a client for the registry at `registry_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Network`] when the underlying HTTP client
    /// cannot be constructed.
    pub fn new(registry_url: &str) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url = registry_url.trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Registers the agent with its full tool set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Registry`] carrying the registry's error
    /// envelope on a non-success status.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let url = format!("{}/register", self.base_url);
        log::debug!("registering agent '{}' at {url}", request.agent_id);
        let response = self.client.post(&url).json(request).send().await?;
        Self::parse(response).await
    }

    /// Sends a full heartbeat and returns the resolution deltas.
    ///
    /// # Errors
    ///
    /// A 410 from the registry surfaces as [`ClientError::Registry`]
    /// with status 410; the agent must re-register.
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, ClientError> {
        let url = format!("{}/heartbeat", self.base_url);
        log::debug!("heartbeat for agent '{}'", request.agent_id);
        let response = self.client.post(&url).json(request).send().await?;
        Self::parse(response).await
    }

    /// Cheap HEAD liveness check. The verdict rides in the status code;
    /// there is no body to parse.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on network failure or an unexpected
    /// status; callers typically skip the cycle and retry later.
    pub async fn fast_heartbeat(&self, agent_id: &str) -> Result<FastHeartbeatStatus, ClientError> {
        let url = format!("{}/heartbeat/{}", self.base_url, agent_id);
        let response = self.client.head(&url).send().await?;
        let code = response.status().as_u16();
        FastHeartbeatStatus::from_status_code(code).ok_or(ClientError::Registry {
            status: code,
            message: "unexpected fast heartbeat status".to_string(),
        })
    }

    /// Removes the agent from the registry on graceful shutdown.
    /// Idempotent: an already-gone agent is success.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Registry`] for any other error status.
    pub async fn unregister(&self, agent_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);
        log::debug!("unregistering agent '{agent_id}'");
        let response = self.client.delete(&url).send().await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
            return Ok(());
        }
        Err(Self::error_from(status.as_u16(), response.text().await.unwrap_or_default()))
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            Err(Self::error_from(status.as_u16(), body))
        }
    }

    fn error_from(status: u16, body: String) -> ClientError {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        ClientError::Registry { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::health::HealthPolicy;
    use crate::registry::service::RegistryService;
    use crate::registry::types::{Requirement, ToolSpec, Transport};
    use crate::server::{app_router, AppState};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn spawn_registry() -> String {
        let service = Arc::new(RegistryService::new(
            HealthPolicy::new(60, 120),
            Arc::new(SystemClock),
        ));
        let app = app_router(AppState { registry: service });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn register_request(agent_id: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            endpoint: Some(format!("http://{agent_id}:8080")),
            transports: vec![Transport::Http],
            tools: vec![ToolSpec {
                tool_name: "serve".to_string(),
                capability: "weather".to_string(),
                version: "1.0.0".to_string(),
                tags: Vec::new(),
                dependencies: vec![Requirement::capability("weather")],
            }],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_heartbeat_round_trip() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(&base).unwrap();

        let response = client.register(&register_request("weather-00000001")).await.unwrap();
        assert_eq!(response.status, "success");
        // The sole provider satisfies its own requirement.
        assert_eq!(
            response.resolutions["serve"][&0].as_ref().unwrap().agent_id,
            "weather-00000001"
        );

        let heartbeat = client
            .heartbeat(&HeartbeatRequest {
                agent_id: "weather-00000001".to_string(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(!heartbeat.changed);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent_is_410() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(&base).unwrap();

        let err = client
            .heartbeat(&HeartbeatRequest {
                agent_id: "ghost-00000000".to_string(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        match err {
            ClientError::Registry { status, message } => {
                assert_eq!(status, 410);
                assert!(message.contains("ghost-00000000"));
            }
            other => panic!("expected registry error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fast_heartbeat_statuses() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(&base).unwrap();

        client.register(&register_request("weather-00000001")).await.unwrap();
        assert_eq!(
            client.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::NoChanges
        );

        client.register(&register_request("other-00000002")).await.unwrap();
        assert_eq!(
            client.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::TopologyChanged
        );

        assert_eq!(
            client.fast_heartbeat("ghost-00000000").await.unwrap(),
            FastHeartbeatStatus::AgentUnknown
        );
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(&base).unwrap();

        client.register(&register_request("weather-00000001")).await.unwrap();
        client.unregister("weather-00000001").await.unwrap();
        // Second delete: already gone, still success.
        client.unregister("weather-00000001").await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_error_is_400_with_message() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(&base).unwrap();

        let mut request = register_request("weather-00000001");
        request.tools[0].version = "not-a-version".to_string();
        let err = client.register(&request).await.unwrap_err();
        match err {
            ClientError::Registry { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("version"));
            }
            other => panic!("expected registry error, got {other:?}"),
        }
    }
}
