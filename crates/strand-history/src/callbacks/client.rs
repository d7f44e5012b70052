//! Completion delivery protocol.
//!
//! A completion is POSTed as JSON to the callback URL with the callback's
//! headers. Any 2xx response is success. Any other status is a handler
//! error whose type is derived from the status code; the response body
//! may carry `{"message": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use strand_core::WorkflowKey;

use crate::error::{Error, Result};
use crate::events::{Failure, Payload, WorkflowOutcome};
use crate::state::CallbackTarget;

/// Terminal state reported to the callback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    /// The workflow completed.
    Succeeded,
    /// The workflow failed, terminated, or timed out.
    Failed,
    /// The workflow was canceled.
    Canceled,
}

/// Body of a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Namespace of the closed run.
    pub namespace_id: String,
    /// Workflow ID of the closed run.
    pub workflow_id: String,
    /// Run ID of the closed run.
    pub run_id: String,
    /// Terminal state.
    pub state: CompletionState,
    /// Result, for `succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Failure, for `failed` and `canceled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// When the run closed.
    pub close_time: DateTime<Utc>,
}

impl CompletionRequest {
    /// Builds the request for a run that closed with `outcome`.
    #[must_use]
    pub fn from_outcome(key: &WorkflowKey, outcome: &WorkflowOutcome, close_time: DateTime<Utc>) -> Self {
        let (state, result, failure) = match outcome {
            WorkflowOutcome::Completed { result } => (CompletionState::Succeeded, result.clone(), None),
            WorkflowOutcome::Failed { failure } => {
                (CompletionState::Failed, None, Some(failure.clone()))
            }
            WorkflowOutcome::Canceled { .. } => (
                CompletionState::Canceled,
                None,
                Some(Failure::non_retryable("workflow canceled")),
            ),
            WorkflowOutcome::Terminated { reason } => (
                CompletionState::Failed,
                None,
                Some(Failure::non_retryable(format!("workflow terminated: {reason}"))),
            ),
            WorkflowOutcome::TimedOut => (
                CompletionState::Failed,
                None,
                Some(Failure::non_retryable("workflow timed out")),
            ),
            WorkflowOutcome::ContinuedAsNew { new_run_id } => (
                CompletionState::Failed,
                None,
                Some(Failure::non_retryable(format!(
                    "workflow continued as new run {new_run_id}"
                ))),
            ),
        };
        Self {
            namespace_id: key.namespace_id.to_string(),
            workflow_id: key.workflow_id.to_string(),
            run_id: key.run_id.to_string(),
            state,
            result,
            failure,
            close_time,
        }
    }
}

/// Handler error classification derived from the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerErrorType {
    /// 400.
    BadRequest,
    /// 401.
    Unauthenticated,
    /// 403.
    Unauthorized,
    /// 404.
    NotFound,
    /// 429.
    ResourceExhausted,
    /// 500 and unclassified responses.
    Internal,
    /// 501.
    NotImplemented,
    /// 503.
    Unavailable,
    /// 504 and 520.
    UpstreamTimeout,
}

impl HandlerErrorType {
    /// Classifies a non-success status code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::Unauthenticated,
            403 => Self::Unauthorized,
            404 => Self::NotFound,
            429 => Self::ResourceExhausted,
            501 => Self::NotImplemented,
            503 => Self::Unavailable,
            504 | 520 => Self::UpstreamTimeout,
            402..=499 => Self::BadRequest,
            _ => Self::Internal,
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Internal => "INTERNAL",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }

    /// Returns true if the handler may succeed on a later attempt.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::Internal | Self::Unavailable | Self::UpstreamTimeout
        )
    }
}

impl std::fmt::Display for HandlerErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The target answered with a non-success status.
    #[error("handler error ({error_type}): {message}")]
    Handler {
        /// Classification of the status code.
        error_type: HandlerErrorType,
        /// Message reported by the handler.
        message: String,
    },

    /// The request never produced a response.
    #[error("transport error: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },

    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// The attempt was canceled by shutdown.
    #[error("delivery canceled")]
    Canceled,

    /// The request could not be built from the callback target.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong with the target.
        message: String,
    },
}

impl DeliveryError {
    /// Returns true if the attempt may be retried.
    ///
    /// Local failures are always transient; handler errors follow their type.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Handler { error_type, .. } => error_type.is_retryable(),
            Self::Transport { .. } | Self::Timeout | Self::Canceled => true,
            Self::InvalidRequest { .. } => false,
        }
    }

    /// Outcome label for metrics.
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}

/// Sends completion requests to callback targets.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Delivers `request` to `target`.
    async fn deliver(
        &self,
        target: &CallbackTarget,
        request: &CompletionRequest,
    ) -> std::result::Result<(), DeliveryError>;
}

#[derive(Deserialize)]
struct HandlerErrorBody {
    message: String,
}

/// [`CompletionClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
}

impl HttpCompletionClient {
    /// Creates a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn headers(target: &CallbackTarget) -> std::result::Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::with_capacity(target.headers.len() + 1);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                DeliveryError::InvalidRequest {
                    message: format!("header name {name:?}: {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| DeliveryError::InvalidRequest {
                message: format!("header {name}: {e}"),
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn deliver(
        &self,
        target: &CallbackTarget,
        request: &CompletionRequest,
    ) -> std::result::Result<(), DeliveryError> {
        let headers = Self::headers(target)?;
        let response = self
            .client
            .post(&target.url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transport {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<HandlerErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| {
                if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                } else {
                    body.trim().to_string()
                }
            });
        Err(DeliveryError::Handler {
            error_type: HandlerErrorType::from_status(status.as_u16()),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{NamespaceId, RunId, WorkflowId};

    #[test]
    fn status_classification() {
        assert_eq!(HandlerErrorType::from_status(400), HandlerErrorType::BadRequest);
        assert_eq!(HandlerErrorType::from_status(429), HandlerErrorType::ResourceExhausted);
        assert_eq!(HandlerErrorType::from_status(500), HandlerErrorType::Internal);
        assert_eq!(HandlerErrorType::from_status(520), HandlerErrorType::UpstreamTimeout);
        assert_eq!(HandlerErrorType::from_status(418), HandlerErrorType::BadRequest);
        assert_eq!(HandlerErrorType::from_status(599), HandlerErrorType::Internal);

        assert!(HandlerErrorType::Unavailable.is_retryable());
        assert!(!HandlerErrorType::NotFound.is_retryable());
    }

    #[test]
    fn handler_error_message() {
        let err = DeliveryError::Handler {
            error_type: HandlerErrorType::Internal,
            message: "intentional error".into(),
        };
        assert_eq!(err.to_string(), "handler error (INTERNAL): intentional error");
        assert!(err.is_retryable());
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(
            !DeliveryError::InvalidRequest {
                message: "x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn request_from_outcome() {
        let key = WorkflowKey::new(
            NamespaceId::new("default").unwrap(),
            WorkflowId::new("wf").unwrap(),
            RunId::generate(),
        );
        let now = Utc::now();
        let ok = CompletionRequest::from_outcome(
            &key,
            &WorkflowOutcome::Completed {
                result: Some(serde_json::json!({"total": 3})),
            },
            now,
        );
        assert_eq!(ok.state, CompletionState::Succeeded);
        assert!(ok.failure.is_none());

        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["workflowId"], "wf");
        assert!(json.get("failure").is_none());

        let terminated = CompletionRequest::from_outcome(
            &key,
            &WorkflowOutcome::Terminated {
                reason: "operator".into(),
            },
            now,
        );
        assert_eq!(terminated.state, CompletionState::Failed);
        assert_eq!(
            terminated.failure.unwrap().message,
            "workflow terminated: operator"
        );
    }

    #[test]
    fn invalid_header_is_permanent() {
        let target = CallbackTarget::new("http://localhost/x").with_header("bad header", "v");
        let err = HttpCompletionClient::headers(&target).unwrap_err();
        assert!(!err.is_retryable());
    }
}
