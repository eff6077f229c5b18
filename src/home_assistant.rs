//! Home Assistant client
//!
//! The engine reaches the smart-home system only through
//! [`HomeAssistantClient`]: a service call, a state read and a state write.
//! [`RestClient`] implements it over the Home Assistant REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::HomeAssistantConfig;

#[derive(Debug, Error)]
pub enum HomeAssistantError {
    #[error("Client initialization failed: {0}")]
    ClientInitialization(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Home Assistant returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid service reference '{0}'")]
    InvalidService(String),
}

/// State object as returned by `/api/states/{entity_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HomeAssistantClient: Send + Sync {
    /// Invokes `domain.service` with a JSON payload.
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, HomeAssistantError>;

    /// Current state, or `None` when the entity does not exist.
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HomeAssistantError>;

    /// Writes the state string of an entity and returns the stored object.
    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
    ) -> Result<EntityState, HomeAssistantError>;
}

/// Splits `light.turn_on` into its domain and service.
pub fn split_service(reference: &str) -> Result<(&str, &str), HomeAssistantError> {
    match reference.split_once('.') {
        Some((domain, service)) if !domain.is_empty() && !service.is_empty() => {
            Ok((domain, service))
        }
        _ => Err(HomeAssistantError::InvalidService(reference.to_string())),
    }
}

pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(config: &HomeAssistantConfig) -> Result<Self, HomeAssistantError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| HomeAssistantError::ClientInitialization(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, HomeAssistantError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HomeAssistantError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HomeAssistantClient for RestClient {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, HomeAssistantError> {
        debug!(domain, service, "Calling Home Assistant service");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/services/{}/{}", domain, service),
            )
            .json(&data)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HomeAssistantError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/states/{}", entity_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
    ) -> Result<EntityState, HomeAssistantError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/api/states/{}", entity_id))
            .json(&serde_json::json!({ "state": state }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_service() {
        assert_eq!(split_service("light.turn_on").unwrap(), ("light", "turn_on"));
        assert!(split_service("light").is_err());
        assert!(split_service(".turn_on").is_err());
        assert!(split_service("light.").is_err());
    }

    #[test]
    fn test_rest_client_trims_base_url() {
        let client = RestClient::new(&HomeAssistantConfig {
            base_url: "http://ha.local:8123/".to_string(),
            token: Some("t".to_string()),
            timeout_ms: 1000,
        })
        .unwrap();
        assert_eq!(client.base_url, "http://ha.local:8123");
    }

    #[test]
    fn test_entity_state_deserializes_without_attributes() {
        let state: EntityState =
            serde_json::from_str(r#"{"entity_id":"light.kitchen","state":"on"}"#).unwrap();
        assert_eq!(state.state, "on");
        assert_eq!(state.attributes, serde_json::Value::Null);
    }
}
