//! HTTP adapter for the carbon-credit registry.
//!
//! Owns the registry credential and renews it explicitly: a login yields a
//! refresh token, the refresh endpoint yields an access token, and a 401 on a
//! regular call triggers exactly one renewal and one repeat of that call.
//! Every response is decoded into typed rows before it reaches the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::models::ErrorClass;
use domain::services::{
    CreatedDocument, DocumentStatus, PolicySummary, RegistryClient, RegistryError,
};
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RegistryConfig;

/// Lifetime assumed for tokens that carry no readable expiry.
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 24;

/// Tokens this close to expiry are renewed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Longest slice of an error body kept in messages.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum RegistryClientBuildError {
    #[error("Invalid registry base URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// A token together with the instant it stops being accepted.
#[derive(Debug, Clone)]
struct IssuedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl IssuedToken {
    fn new(value: String, now: DateTime<Utc>) -> Self {
        let expires_at = shared::jwt::peek_expiry(&value)
            .ok()
            .flatten()
            .unwrap_or_else(|| now + chrono::Duration::hours(DEFAULT_TOKEN_LIFETIME_HOURS));
        Self { value, expires_at }
    }

    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

/// Registry account credentials plus the tokens obtained with them.
pub struct RegistryCredential {
    username: String,
    password: String,
    refresh_token: Option<IssuedToken>,
    access_token: Option<IssuedToken>,
}

impl RegistryCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            refresh_token: None,
            access_token: None,
        }
    }

    fn usable_access_token(&self, now: DateTime<Utc>) -> Option<String> {
        self.access_token
            .as_ref()
            .filter(|t| t.usable_at(now))
            .map(|t| t.value.clone())
    }

    fn usable_refresh_token(&self, now: DateTime<Utc>) -> Option<String> {
        self.refresh_token
            .as_ref()
            .filter(|t| t.usable_at(now))
            .map(|t| t.value.clone())
    }
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_access_token", &self.access_token.is_some())
            .finish()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Identifiers the registry may use for a document or block.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRow {
    id: Option<String>,
    uuid: Option<String>,
    block_id: Option<String>,
    status: Option<String>,
    verification_status: Option<String>,
}

impl DocumentRow {
    fn primary_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.uuid.as_deref())
            .or(self.block_id.as_deref())
    }

    fn has_id(&self, document_id: &str) -> bool {
        [&self.id, &self.uuid, &self.block_id]
            .iter()
            .any(|candidate| candidate.as_deref() == Some(document_id))
    }
}

#[derive(Debug, Deserialize)]
struct PolicyRow {
    id: Option<String>,
    name: Option<String>,
    status: Option<String>,
}

/// The registry wraps lists in one of several envelopes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Body { body: Vec<T> },
    Documents { documents: Vec<T> },
}

impl<T> Listing<T> {
    fn into_rows(self) -> Vec<T> {
        match self {
            Listing::Bare(rows) | Listing::Body { body: rows } | Listing::Documents { documents: rows } => {
                rows
            }
        }
    }
}

pub struct HttpRegistryClient {
    client: Client,
    base_url: Url,
    tag_name: String,
    credential: RwLock<RegistryCredential>,
}

impl HttpRegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryClientBuildError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|e| RegistryClientBuildError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryClientBuildError::InvalidUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            tag_name: config.tag_name.clone(),
            credential: RwLock::new(RegistryCredential::new(
                config.username.clone(),
                config.password.clone(),
            )),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// A usable access token, renewing the session if needed.
    async fn bearer(&self) -> Result<String, RegistryError> {
        {
            let credential = self.credential.read().await;
            if let Some(token) = credential.usable_access_token(Utc::now()) {
                return Ok(token);
            }
        }

        let mut credential = self.credential.write().await;
        // Another task may have renewed while we waited for the lock.
        if let Some(token) = credential.usable_access_token(Utc::now()) {
            return Ok(token);
        }
        self.renew(&mut credential).await
    }

    /// Replace an access token the registry has just rejected.
    async fn renew_after_rejection(&self, rejected: &str) -> Result<String, RegistryError> {
        let mut credential = self.credential.write().await;
        let already_renewed = credential
            .access_token
            .as_ref()
            .map(|t| t.value != rejected)
            .unwrap_or(false);
        if already_renewed {
            if let Some(token) = credential.usable_access_token(Utc::now()) {
                return Ok(token);
            }
        }
        credential.access_token = None;
        self.renew(&mut credential).await
    }

    async fn renew(&self, credential: &mut RegistryCredential) -> Result<String, RegistryError> {
        if let Some(refresh_token) = credential.usable_refresh_token(Utc::now()) {
            match self.refresh(credential, &refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) if e.class == ErrorClass::Authentication => {
                    tracing::info!("Registry refresh token rejected, logging in again");
                    credential.refresh_token = None;
                }
                Err(e) => return Err(e),
            }
        }

        self.login(credential).await?;
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or_else(|| RegistryError::authentication("login returned no refresh token"))?;
        self.refresh(credential, &refresh_token).await
    }

    async fn login(&self, credential: &mut RegistryCredential) -> Result<(), RegistryError> {
        tracing::info!(username = %credential.username, "Logging in to registry");
        let response = self
            .client
            .post(self.endpoint(&["api", "v1", "accounts", "login"]))
            .json(&LoginRequest {
                username: &credential.username,
                password: &credential.password,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let body: LoginResponse = decode(check(response).await?, ErrorClass::Authentication).await?;

        let token = body
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::authentication("login returned no refresh token"))?;
        credential.refresh_token = Some(IssuedToken::new(token, Utc::now()));
        Ok(())
    }

    async fn refresh(
        &self,
        credential: &mut RegistryCredential,
        refresh_token: &str,
    ) -> Result<String, RegistryError> {
        let response = self
            .client
            .post(self.endpoint(&["api", "v1", "accounts", "refresh"]))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(transport_error)?;
        let body: RefreshResponse =
            decode(check(response).await?, ErrorClass::Authentication).await?;

        let now = Utc::now();
        let access = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::authentication("refresh returned no access token"))?;
        if let Some(rotated) = body.refresh_token.filter(|t| !t.is_empty()) {
            credential.refresh_token = Some(IssuedToken::new(rotated, now));
        }
        let issued = IssuedToken::new(access, now);
        tracing::debug!(expires_at = %issued.expires_at, "Registry access token renewed");
        let value = issued.value.clone();
        credential.access_token = Some(issued);
        Ok(value)
    }

    /// Send an authorized request. A 401 renews the session and repeats the
    /// request once; a second 401 is returned to the caller.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, RegistryError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.bearer().await?;
        let response = build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        tracing::info!("Registry rejected access token, renewing once");
        let token = self.renew_after_rejection(&token).await?;
        let response = build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await
    }

    async fn documents(&self, policy_id: &str) -> Result<Vec<DocumentRow>, RegistryError> {
        let url = self.endpoint(&["api", "v1", "policies", policy_id, "documents"]);
        let response = self.send_authorized(|client| client.get(url.clone())).await?;
        let listing: Listing<DocumentRow> = decode(response, ErrorClass::Transient).await?;
        Ok(listing.into_rows())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    #[tracing::instrument(skip(self, payload))]
    async fn create_document(
        &self,
        policy_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CreatedDocument, RegistryError> {
        let url = self.endpoint(&[
            "api",
            "v1",
            "policies",
            policy_id,
            "tag",
            &self.tag_name,
            "blocks",
        ]);
        let response = self
            .send_authorized(|client| client.post(url.clone()).json(payload))
            .await?;

        // The registry has accepted the document by now, so a body we cannot read
        // must not be retried into a duplicate.
        let body: serde_json::Value = decode(response, ErrorClass::Validation).await?;
        let row: DocumentRow = serde_json::from_value(body.clone()).map_err(|e| {
            RegistryError::validation(format!("unreadable create response: {}", e))
        })?;
        let document_id = row
            .primary_id()
            .map(str::to_string)
            .ok_or_else(|| RegistryError::validation("create response carried no document id"))?;

        Ok(CreatedDocument {
            document_id,
            response: body,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get_document_status(
        &self,
        document_id: &str,
        policy_id: &str,
    ) -> Result<DocumentStatus, RegistryError> {
        let rows = self.documents(policy_id).await?;
        let row = rows
            .into_iter()
            .find(|row| row.has_id(document_id))
            .ok_or_else(|| {
                RegistryError::transient(format!(
                    "document {} not yet listed under policy {}",
                    document_id, policy_id
                ))
            })?;

        let mut status = DocumentStatus::new(
            document_id,
            row.status.unwrap_or_else(|| "unknown".to_string()),
        );
        status.verification_status = row.verification_status;
        Ok(status)
    }

    async fn list_policies(&self) -> Result<Vec<PolicySummary>, RegistryError> {
        let url = self.endpoint(&["api", "v1", "policies"]);
        let response = self.send_authorized(|client| client.get(url.clone())).await?;
        let listing: Listing<PolicyRow> = decode(response, ErrorClass::Transient).await?;
        Ok(listing
            .into_rows()
            .into_iter()
            .filter_map(|row| {
                row.id.map(|id| PolicySummary {
                    id,
                    name: row.name,
                    status: row.status,
                })
            })
            .collect())
    }
}

fn transport_error(err: reqwest::Error) -> RegistryError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    RegistryError::transient(format!("registry request {}: {}", kind, err))
}

/// Pass successful responses through; classify everything else.
async fn check(response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body
    };

    Err(RegistryError::from_status(status.as_u16(), message).with_retry_after(retry_after))
}

async fn decode<T: DeserializeOwned>(
    response: Response,
    class_on_error: ErrorClass,
) -> Result<T, RegistryError> {
    response.json::<T>().await.map_err(|e| {
        RegistryError::new(class_on_error, format!("unreadable registry response: {}", e))
    })
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
