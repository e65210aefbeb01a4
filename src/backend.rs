//! HTTP client for the text storage backend
//!
//! The recognizer only streams transcripts; persisting them (and the user
//! accounts they belong to) is a plain JSON-over-HTTP API. All calls share a
//! single pooled client.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors that can occur talking to the backend
#[derive(Debug)]
pub enum BackendError {
    /// Network/HTTP error
    NetworkError(String),
    /// Backend returned a non-success status
    ApiError { status: u16, message: String },
    /// Failed to parse a backend response
    ParseError(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NetworkError(e) => write!(f, "Network error: {}", e),
            BackendError::ApiError { status, message } => {
                write!(f, "Backend API error ({}): {}", status, message)
            }
            BackendError::ParseError(e) => write!(f, "Failed to parse backend response: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

/// A registered user account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub texts_count: u64,
    pub created_at: DateTime<Utc>,
}

/// One stored transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextEntry {
    pub created_at: DateTime<Utc>,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct TextsResponse {
    texts: Vec<TextEntry>,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Serialize)]
struct AppendTextRequest<'a> {
    text: &'a str,
}

/// Client for the `/api/users/` endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
}

impl BackendClient {
    /// `base_url` is the scheme+host, e.g. `http://localhost:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List all registered users.
    pub async fn list_users(&self) -> Result<Vec<User>, BackendError> {
        let url = format!("{}/api/users/", self.base_url);
        let response = get_http_client()
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        let body: UsersResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))?;
        Ok(body.users)
    }

    /// Create a user (or log into an existing one; the backend upserts on
    /// username).
    pub async fn create_user(&self, username: &str) -> Result<User, BackendError> {
        let url = format!("{}/api/users/", self.base_url);
        let response = get_http_client()
            .post(&url)
            .json(&CreateUserRequest { username })
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))
    }

    /// Fetch the stored transcripts for one user.
    pub async fn texts(&self, user_id: u64) -> Result<Vec<TextEntry>, BackendError> {
        let url = format!("{}/api/users/{}", self.base_url, user_id);
        let response = get_http_client()
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        let body: TextsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))?;
        Ok(body.texts)
    }

    /// Append a finished transcript to a user's history. Returns the updated
    /// list, newest last.
    pub async fn append_text(
        &self,
        user_id: u64,
        text: &str,
    ) -> Result<Vec<TextEntry>, BackendError> {
        let url = format!("{}/api/users/{}", self.base_url, user_id);
        log::info!("Saving transcript ({} chars) for user {}", text.len(), user_id);
        let response = get_http_client()
            .post(&url)
            .json(&AppendTextRequest { text })
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        let body: TextsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))?;
        Ok(body.texts)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    log::error!("Backend API error ({}): {}", status.as_u16(), message);
    Err(BackendError::ApiError {
        status: status.as_u16(),
        message,
    })
}
