//! Registry client abstraction.
//!
//! The HTTP adapter lives in the api crate. The pipeline only sees the typed
//! contracts defined here, never raw wire payloads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::ErrorClass;
use crate::services::retry::classify_status;

/// A classified registry failure.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{class} registry error{}: {message}", http_suffix(.status))]
pub struct RegistryError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
    /// Minimum wait requested by the registry, from a `Retry-After` header.
    pub retry_after: Option<Duration>,
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl RegistryError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Authentication, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            class: ErrorClass::RateLimited,
            status: Some(429),
            message: "rate limited by registry".to_string(),
            retry_after,
        }
    }

    /// Build from a non-success HTTP response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            class: classify_status(status).unwrap_or(ErrorClass::Transient),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

/// Registry response to a successful create-document call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub document_id: String,
    /// Decoded response body, kept for audit.
    pub response: serde_json::Value,
}

/// Registry-side lifecycle of a document, normalized from its status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Submitted,
    Processing,
    Verified,
    Rejected,
}

impl DocumentState {
    /// Normalize a registry status string. Unknown values are treated as still processing.
    pub fn from_registry_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "NEW" => DocumentState::Submitted,
            "PENDING" | "IN_PROGRESS" | "PROCESSING" => DocumentState::Processing,
            "VERIFIED" | "APPROVED" | "ISSUED" | "MINTED" => DocumentState::Verified,
            "REJECTED" | "FAILED" | "ERROR" | "REVOKED" | "EXPIRED" => DocumentState::Rejected,
            _ => DocumentState::Processing,
        }
    }
}

/// Current status of one registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub state: DocumentState,
    /// Status string exactly as reported by the registry.
    pub raw_status: String,
    pub verification_status: Option<String>,
}

impl DocumentStatus {
    pub fn new(document_id: impl Into<String>, raw_status: impl Into<String>) -> Self {
        let raw_status = raw_status.into();
        Self {
            document_id: document_id.into(),
            state: DocumentState::from_registry_status(&raw_status),
            raw_status,
            verification_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub id: String,
    pub name: Option<String>,
    pub status: Option<String>,
}

/// External registry operations used by the submission pipeline.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Create a document under a policy. Not idempotent on the registry side.
    async fn create_document(
        &self,
        policy_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CreatedDocument, RegistryError>;

    /// Fetch the status of a previously created document.
    async fn get_document_status(
        &self,
        document_id: &str,
        policy_id: &str,
    ) -> Result<DocumentStatus, RegistryError>;

    async fn list_policies(&self) -> Result<Vec<PolicySummary>, RegistryError>;
}

/// Scripted registry client for development and testing.
///
/// Responses are consumed in order; once a script is exhausted the client
/// succeeds with generated document ids and a `VERIFIED` status.
#[derive(Debug, Default)]
pub struct MockRegistryClient {
    create_script: Mutex<VecDeque<Result<CreatedDocument, RegistryError>>>,
    status_script: Mutex<VecDeque<Result<DocumentStatus, RegistryError>>>,
    create_calls: AtomicUsize,
    status_calls: AtomicUsize,
    created_payloads: Mutex<Vec<serde_json::Value>>,
}

impl MockRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose create calls always fail with `error`.
    pub fn failing(error: RegistryError, times: usize) -> Self {
        Self {
            create_script: Mutex::new(std::iter::repeat(Err(error)).take(times).collect()),
            ..Self::default()
        }
    }

    pub async fn push_create(&self, result: Result<CreatedDocument, RegistryError>) {
        self.create_script.lock().await.push_back(result);
    }

    pub async fn push_status(&self, result: Result<DocumentStatus, RegistryError>) {
        self.status_script.lock().await.push_back(result);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub async fn created_payloads(&self) -> Vec<serde_json::Value> {
        self.created_payloads.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RegistryClient for MockRegistryClient {
    async fn create_document(
        &self,
        _policy_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CreatedDocument, RegistryError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.create_script.lock().await.pop_front();
        let result = scripted.unwrap_or_else(|| {
            let document_id = format!("doc-{}", n);
            Ok(CreatedDocument {
                response: serde_json::json!({ "id": document_id }),
                document_id,
            })
        });
        if result.is_ok() {
            self.created_payloads.lock().await.push(payload.clone());
        }
        result
    }

    async fn get_document_status(
        &self,
        document_id: &str,
        _policy_id: &str,
    ) -> Result<DocumentStatus, RegistryError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.status_script.lock().await.pop_front();
        scripted.unwrap_or_else(|| Ok(DocumentStatus::new(document_id, "VERIFIED")))
    }

    async fn list_policies(&self) -> Result<Vec<PolicySummary>, RegistryError> {
        Ok(vec![PolicySummary {
            id: "mock-policy".to_string(),
            name: Some("Mock policy".to_string()),
            status: Some("PUBLISH".to_string()),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(DocumentState::from_registry_status("NEW"), DocumentState::Submitted);
        assert_eq!(
            DocumentState::from_registry_status("in_progress"),
            DocumentState::Processing
        );
        assert_eq!(
            DocumentState::from_registry_status("APPROVED"),
            DocumentState::Verified
        );
        assert_eq!(
            DocumentState::from_registry_status("EXPIRED"),
            DocumentState::Rejected
        );
        assert_eq!(
            DocumentState::from_registry_status("SOMETHING_NEW"),
            DocumentState::Processing
        );
    }

    #[test]
    fn test_error_from_status() {
        let err = RegistryError::from_status(503, "unavailable");
        assert_eq!(err.class, ErrorClass::Transient);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "transient registry error (HTTP 503): unavailable");

        let err = RegistryError::from_status(422, "bad document");
        assert_eq!(err.class, ErrorClass::Validation);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_follows_script_then_succeeds() {
        let client = MockRegistryClient::failing(RegistryError::transient("down"), 1);
        let payload = serde_json::json!({});

        assert!(client.create_document("p", &payload).await.is_err());
        let created = client.create_document("p", &payload).await.unwrap();
        assert_eq!(created.document_id, "doc-2");
        assert_eq!(client.create_calls(), 2);
        assert_eq!(client.created_payloads().await.len(), 1);

        let status = client.get_document_status("doc-2", "p").await.unwrap();
        assert_eq!(status.state, DocumentState::Verified);
    }
}
