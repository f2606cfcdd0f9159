//! Authenticated HTTP session against the Preservica REST API.
//!
//! Logs in with username/password/tenant, caches the access token and renews it
//! one minute before it expires. Every request carries the token in the
//! `Preservica-Access-Token` header.

use std::env;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use topx_ingest_core::contract::PermanentError;
use topx_ingest_core::BoxError;
use tracing::{debug, info, warn};

use crate::load_config::PreservicaSection;

pub const USERNAME_ENV: &str = "PRESERVICA_USERNAME";
pub const PASSWORD_ENV: &str = "PRESERVICA_PASSWORD";
const TOKEN_HEADER: &str = "Preservica-Access-Token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Preservica reports `validFor` in minutes; 15 is its default.
const DEFAULT_VALID_FOR_MINUTES: u64 = 15;

fn default_valid_for() -> u64 {
    DEFAULT_VALID_FOR_MINUTES
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Self> {
        let username = env::var(USERNAME_ENV)
            .with_context(|| format!("{USERNAME_ENV} missing in environment"))?;
        let password = env::var(PASSWORD_ENV)
            .with_context(|| format!("{PASSWORD_ENV} missing in environment"))?;
        Ok(Credentials { username, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    #[serde(default = "default_valid_for")]
    valid_for: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

/// Maps a failed HTTP status to an error, marking the ones retrying cannot fix.
pub fn status_error(status: StatusCode, context: &str, body: &str) -> BoxError {
    let message = format!("{context}: HTTP {status}: {}", body.trim());
    let transient = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || !status.is_client_error();
    if transient {
        message.into()
    } else {
        PermanentError::boxed(message)
    }
}

pub struct PreservicaSession {
    http: Client,
    settings: PreservicaSection,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl PreservicaSession {
    pub fn new(settings: PreservicaSection, credentials: Credentials) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        info!(
            server = %settings.server,
            tenant = %settings.tenant,
            username = %credentials.username,
            "Initialised Preservica session"
        );
        Ok(Self {
            http,
            settings,
            credentials,
            token: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &PreservicaSection {
        &self.settings
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.server.trim_end_matches('/'), path)
    }

    /// A valid access token, logging in again when the cached one is about to expire.
    pub async fn token(&self) -> Result<String, BoxError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }
        let fresh = self.login().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn login(&self) -> Result<CachedToken, BoxError> {
        debug!(username = %self.credentials.username, "Requesting access token");
        let response = self
            .http
            .post(self.url("/api/accesstoken/login"))
            .form(&[
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
                ("tenant", self.settings.tenant.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, "login", &body));
        }
        let login: LoginResponse = serde_json::from_str(&body)?;
        info!(valid_for_minutes = login.valid_for, "Obtained access token");
        Ok(CachedToken {
            value: login.token,
            expires_at: Instant::now() + Duration::from_secs(login.valid_for * 60),
        })
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, BoxError> {
        let request = self.http.get(self.url(path)).query(query);
        self.send(path, request).await
    }

    pub async fn post_xml(&self, path: &str, body: String) -> Result<String, BoxError> {
        let request = self
            .http
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/xml;charset=UTF-8")
            .body(body);
        self.send(path, request).await
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<String, BoxError> {
        let token = self.token().await?;
        let response = request.header(TOKEN_HEADER, token).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::UNAUTHORIZED {
            // token revoked server-side; the next attempt logs in again
            warn!(path, "Access token rejected, discarding it");
            self.invalidate_token().await;
            return Err(format!("{path}: HTTP {status}").into());
        }
        Err(status_error(status, path, &body))
    }
}
