//! API client for the eventdesk REST backend.
//!
//! This module provides the `ApiClient` struct for the authentication
//! endpoints, and the `AuthBackend` trait the session core is written
//! against so it can be driven without a live server.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::UserProfile;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/auth/login";
const VERIFY_TWO_FACTOR_PATH: &str = "/auth/login/verify-2fa";
const ME_PATH: &str = "/auth/me";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    #[serde(rename = "senha")]
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct VerifyTwoFactorRequest<'a> {
    #[serde(rename = "tempToken")]
    temp_token: &'a str,
    token: &'a str,
}

/// Either shape the login endpoints may answer with
#[derive(Debug, Deserialize)]
struct LoginResponse {
    user: Option<UserProfile>,
    token: Option<String>,
    #[serde(rename = "twoFactorRequired", default)]
    two_factor_required: bool,
    #[serde(rename = "tempToken")]
    temp_token: Option<String>,
}

/// A completed sign-in: the profile and the bearer token to keep
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub user: UserProfile,
    pub token: String,
}

/// Outcome of the first (credentials) step of a login
#[derive(Debug, Clone, PartialEq)]
pub enum LoginReply {
    Authenticated(AuthGrant),
    TwoFactorRequired { temp_token: String },
}

impl LoginResponse {
    fn into_reply(self) -> Result<LoginReply, ApiError> {
        if self.two_factor_required {
            return match self.temp_token.filter(|t| !t.is_empty()) {
                Some(temp_token) => Ok(LoginReply::TwoFactorRequired { temp_token }),
                None => Err(ApiError::InvalidResponse(
                    "two-factor required but no tempToken provided".to_string(),
                )),
            };
        }
        self.into_grant().map(LoginReply::Authenticated)
    }

    fn into_grant(self) -> Result<AuthGrant, ApiError> {
        match (self.user, self.token.filter(|t| !t.is_empty())) {
            (Some(user), Some(token)) => Ok(AuthGrant { user, token }),
            (None, _) => Err(ApiError::InvalidResponse("response has no user".to_string())),
            (_, None) => Err(ApiError::InvalidResponse("response has no token".to_string())),
        }
    }
}

// ============================================================================
// Backend seam
// ============================================================================

/// The three backend calls the session core depends on.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `POST /auth/login`
    async fn login(&self, email: &str, password: &str) -> Result<LoginReply, ApiError>;

    /// `POST /auth/login/verify-2fa`
    async fn verify_two_factor(&self, temp_token: &str, code: &str)
        -> Result<AuthGrant, ApiError>;

    /// `GET /auth/me` with the given bearer token
    async fn fetch_current_user(&self, token: &str) -> Result<UserProfile, ApiError>;
}

// ============================================================================
// Client
// ============================================================================

/// API client for the eventdesk backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a new API client for the given base URL
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            base_url: self.base_url.clone(),
            token: Some(token),
            initial_backoff: self.initial_backoff,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidResponse("token is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, ApiError> {
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)))
    }

    /// Send a request, backing off and retrying while the server rate-limits us.
    async fn execute<T, F>(&self, url: &str, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = build().send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Self::parse_json(response, url).await,
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Authenticated GET against a backend path
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let headers = self.auth_headers()?;
        self.execute(&url, || self.client.get(&url).headers(headers.clone()))
            .await
    }

    /// POST a JSON body to a backend path
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let headers = self.auth_headers()?;
        self.execute(&url, || {
            self.client.post(&url).headers(headers.clone()).json(body)
        })
        .await
    }
}

#[async_trait]
impl AuthBackend for ApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginReply, ApiError> {
        debug!(email = email, "Submitting credentials");
        let response: LoginResponse = self
            .post(LOGIN_PATH, &LoginRequest { email, password })
            .await?;
        response.into_reply()
    }

    async fn verify_two_factor(
        &self,
        temp_token: &str,
        code: &str,
    ) -> Result<AuthGrant, ApiError> {
        debug!("Submitting two-factor code");
        let response: LoginResponse = self
            .post(
                VERIFY_TWO_FACTOR_PATH,
                &VerifyTwoFactorRequest {
                    temp_token,
                    token: code,
                },
            )
            .await?;
        response.into_grant()
    }

    async fn fetch_current_user(&self, token: &str) -> Result<UserProfile, ApiError> {
        self.with_token(token.to_string()).get(ME_PATH).await
    }
}
