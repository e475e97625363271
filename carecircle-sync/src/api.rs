//! Replay seam to the REST API
//!
//! Each [`ActionType`] maps to one HTTP verb and path template. Placeholders
//! such as `{shiftId}` are filled from the top-level fields of the action's
//! payload, and the payload itself is sent as the JSON body. The action id
//! travels as the `Idempotency-Key` header so the server can collapse
//! at-least-once duplicates.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use thiserror::Error;

use crate::clock::ActionId;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::ActionType;

/// Retry classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying later: network failure, timeout, 5xx, 408, 429
    Transient,
    /// Will fail the same way every time: validation and other 4xx
    Permanent,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("payload does not fit route: {0}")]
    InvalidPayload(String),
}

impl ApiError {
    pub fn class(&self) -> FailureClass {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) => FailureClass::Transient,
            ApiError::Status { status, .. } => match status {
                408 | 429 => FailureClass::Transient,
                500..=599 => FailureClass::Transient,
                _ => FailureClass::Permanent,
            },
            ApiError::InvalidPayload(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP verb and path template of one action type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRoute {
    pub method: Method,
    pub path: &'static str,
}

impl ReplayRoute {
    pub fn for_action(action_type: ActionType) -> Self {
        let (method, path) = match action_type {
            ActionType::MedicationLog => (
                Method::POST,
                "/care-recipients/{careRecipientId}/medications/{medicationId}/logs",
            ),
            ActionType::MedicationLogUpdate => (
                Method::PATCH,
                "/care-recipients/{careRecipientId}/medication-logs/{logId}",
            ),
            ActionType::TimelineEntry => {
                (Method::POST, "/care-recipients/{careRecipientId}/timeline")
            }
            ActionType::TimelineEntryUpdate => (
                Method::PATCH,
                "/care-recipients/{careRecipientId}/timeline/{entryId}",
            ),
            ActionType::ShiftCheckIn => (Method::POST, "/shifts/{shiftId}/check-in"),
            ActionType::ShiftCheckOut => (Method::POST, "/shifts/{shiftId}/check-out"),
        };
        Self { method, path }
    }

    /// Path segments with every placeholder filled from `payload`.
    pub fn resolve_segments(&self, payload: &Value) -> Result<Vec<String>, ApiError> {
        self.path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
                    return Ok(segment.to_string());
                };
                match payload.get(name) {
                    Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
                    Some(Value::Number(value)) => Ok(value.to_string()),
                    _ => Err(ApiError::InvalidPayload(format!(
                        "missing `{name}` for {}",
                        self.path
                    ))),
                }
            })
            .collect()
    }

    /// Filled path, for logging.
    pub fn resolve_path(&self, payload: &Value) -> Result<String, ApiError> {
        Ok(format!("/{}", self.resolve_segments(payload)?.join("/")))
    }
}

/// The single write call the sync core needs from the API
#[async_trait]
pub trait ReplayApi: Send + Sync {
    /// Performs the write for `action_type`. The response body is returned
    /// as-is; callers do not rely on it to update caches.
    async fn execute(
        &self,
        action_type: ActionType,
        payload: &Value,
        idempotency_key: &ActionId,
    ) -> Result<Value, ApiError>;
}

/// reqwest implementation of [`ReplayApi`]
pub struct HttpReplayApi {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpReplayApi {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let base_url = Url::parse(&config.api_base_url)
            .map_err(|e| SyncError::Config(format!("Invalid api_base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "api_base_url cannot carry paths: {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("carecircle-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
            timeout: config.request_timeout,
        })
    }

    fn url_for(&self, route: &ReplayRoute, payload: &Value) -> Result<Url, ApiError> {
        let segments = route.resolve_segments(payload)?;
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidPayload("base url cannot carry paths".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ReplayApi for HttpReplayApi {
    async fn execute(
        &self,
        action_type: ActionType,
        payload: &Value,
        idempotency_key: &ActionId,
    ) -> Result<Value, ApiError> {
        let route = ReplayRoute::for_action(action_type);
        let url = self.url_for(&route, payload)?;

        let mut request = self
            .client
            .request(route.method.clone(), url)
            .header("Idempotency-Key", idempotency_key.as_str())
            .json(payload);

        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(self.timeout)
            } else {
                ApiError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: logger_redacted::redact(&body),
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        let status = |status| ApiError::Status {
            status,
            body: String::new(),
        };
        assert_eq!(status(500).class(), FailureClass::Transient);
        assert_eq!(status(503).class(), FailureClass::Transient);
        assert_eq!(status(408).class(), FailureClass::Transient);
        assert_eq!(status(429).class(), FailureClass::Transient);
        assert_eq!(status(400).class(), FailureClass::Permanent);
        assert_eq!(status(422).class(), FailureClass::Permanent);
        assert_eq!(status(404).class(), FailureClass::Permanent);
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(ApiError::Timeout(Duration::from_secs(15)).is_transient());
        assert!(!ApiError::InvalidPayload("x".into()).is_transient());
    }

    #[test]
    fn test_every_action_type_has_a_route() {
        for action_type in ActionType::ALL {
            let route = ReplayRoute::for_action(action_type);
            assert!(route.path.starts_with('/'));
        }
    }

    #[test]
    fn test_resolve_medication_log() {
        let route = ReplayRoute::for_action(ActionType::MedicationLog);
        let payload = json!({
            "careRecipientId": "cr-9",
            "medicationId": 42,
            "takenAt": "2026-10-16T08:00:00Z"
        });
        assert_eq!(route.method, Method::POST);
        assert_eq!(
            route.resolve_path(&payload).unwrap(),
            "/care-recipients/cr-9/medications/42/logs"
        );
    }

    #[test]
    fn test_missing_placeholder_is_permanent() {
        let route = ReplayRoute::for_action(ActionType::ShiftCheckOut);
        let err = route.resolve_segments(&json!({"shiftId": ""})).unwrap_err();
        assert!(matches!(err, ApiError::InvalidPayload(_)));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn test_url_building_escapes_segments() {
        let config = SyncConfig {
            api_base_url: "https://api.example.test/api/v1/".to_string(),
            ..Default::default()
        };
        let api = HttpReplayApi::new(&config).unwrap();
        let route = ReplayRoute::for_action(ActionType::ShiftCheckIn);
        let url = api.url_for(&route, &json!({"shiftId": "a/b"})).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/api/v1/shifts/a%2Fb/check-in");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = SyncConfig {
            api_base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(HttpReplayApi::new(&config), Err(SyncError::Config(_))));
    }
}
