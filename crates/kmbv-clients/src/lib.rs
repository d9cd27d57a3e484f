//! HTTP collaborators: the Konzertmeister source and the BMV target service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kmbv_core::{Activity, Appointment, AppointmentFilter, NewActivity};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kmbv-clients";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("not logged in; call login() before fetching pages")]
    NotLoggedIn,
}

/// Target-side collaborator: the BMV activity register.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Verify the configured credentials. `Ok(false)` covers both rejected
    /// credentials and transport failures during the check.
    async fn check_user(&self) -> Result<bool, ClientError>;

    /// Fetch all stored activities dated on or after `since`. Transport and
    /// parse failures are hard errors here: callers must never mistake a
    /// failed fetch for an empty register.
    async fn fetch_activities(&self, since: DateTime<Utc>) -> Result<Vec<Activity>, ClientError>;

    /// Submit a batch of new activities in one request. `Ok(false)` means the
    /// server rejected the batch.
    async fn post_activities(&self, batch: &[NewActivity]) -> Result<bool, ClientError>;
}

/// Source-side collaborator: the Konzertmeister appointment feed.
#[async_trait]
pub trait AppointmentSource: Send + Sync {
    /// Establish a session for subsequent `fetch_page` calls.
    async fn login(&self) -> Result<bool, ClientError>;

    /// Fetch one page of appointments. An empty page signals end-of-pages.
    async fn fetch_page(
        &self,
        page: u32,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct BmvConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

pub struct BmvClient {
    client: reqwest::Client,
    config: BmvConfig,
}

impl BmvClient {
    pub fn new(config: BmvConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// Outgoing activity with the identifier the target schema requires.
#[derive(Debug, Serialize)]
struct ActivityPayload<'a> {
    #[serde(rename = "ID")]
    id: String,
    #[serde(flatten)]
    activity: &'a NewActivity,
}

#[async_trait]
impl ActivityStore for BmvClient {
    async fn check_user(&self) -> Result<bool, ClientError> {
        let url = self.url("CheckBMVBenutzer");
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await;
        match response {
            Ok(response) if response.status() == StatusCode::OK => {
                let body = response.text().await.unwrap_or_default();
                Ok(serde_json::from_str::<bool>(body.trim()).unwrap_or(false))
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "BMV user check rejected");
                Ok(false)
            }
            Err(err) => {
                warn!(error = %err, "BMV user check failed");
                Ok(false)
            }
        }
    }

    async fn fetch_activities(&self, since: DateTime<Utc>) -> Result<Vec<Activity>, ClientError> {
        let datum = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let url = self.url("Ausrueckungen/");
        let response = self
            .client
            .get(&url)
            .query(&[("datum", datum.as_str()), ("anz", "10000")])
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status { status: status.as_u16(), url });
        }
        Ok(response.json().await?)
    }

    async fn post_activities(&self, batch: &[NewActivity]) -> Result<bool, ClientError> {
        let with_ids: Vec<ActivityPayload<'_>> = batch
            .iter()
            .map(|activity| ActivityPayload { id: Uuid::new_v4().to_string(), activity })
            .collect();
        let url = self.url("Ausrueckungen/");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&with_ids)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!(
                    status = response.status().as_u16(),
                    records = batch.len(),
                    "BMV rejected activity batch"
                );
                Ok(false)
            }
            Err(err) => {
                warn!(error = %err, records = batch.len(), "posting activities failed");
                Ok(false)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct KonzertmeisterConfig {
    pub base_url: String,
    pub mail: String,
    pub password: String,
    pub locale: String,
    pub timezone_id: String,
    pub timeout: Duration,
}

/// Cookie-session client. `login` captures the `Set-Cookie` pairs from the
/// login response; pages are fetched with that cookie attached.
pub struct KonzertmeisterClient {
    client: reqwest::Client,
    config: KonzertmeisterConfig,
    cookie: RwLock<Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    mail: &'a str,
    password: &'a str,
    locale: &'a str,
    timezone_id: &'a str,
}

impl KonzertmeisterClient {
    pub fn new(config: KonzertmeisterConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config, cookie: RwLock::new(None) })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AppointmentSource for KonzertmeisterClient {
    async fn login(&self) -> Result<bool, ClientError> {
        let url = self.url("api/v2/login");
        let body = LoginRequest {
            mail: &self.config.mail,
            password: &self.config.password,
            locale: &self.config.locale,
            timezone_id: &self.config.timezone_id,
        };
        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Konzertmeister login failed");
                return Ok(false);
            }
        };
        if response.status() != StatusCode::OK {
            warn!(status = response.status().as_u16(), "Konzertmeister login rejected");
            return Ok(false);
        }

        // Keep only the cookie pairs, dropping Path/HttpOnly attributes.
        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|line| line.split(';').next())
            .map(str::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if cookie.is_empty() {
            warn!("Konzertmeister login response carried no Set-Cookie header");
            return Ok(false);
        }

        *self.cookie.write().await = Some(cookie);
        Ok(true)
    }

    async fn fetch_page(
        &self,
        page: u32,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, ClientError> {
        let cookie = self.cookie.read().await.clone().ok_or(ClientError::NotLoggedIn)?;
        let url = self.url(&format!("api/v3/app/getpaged/{page}"));
        let response = self
            .client
            .post(&url)
            .header(COOKIE, cookie)
            .json(filter)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status { status: status.as_u16(), url });
        }
        Ok(response.json().await?)
    }
}

/// Lazy pager over an [`AppointmentSource`]: yields successive non-empty
/// pages starting at zero and stays exhausted after the first empty page.
/// A mid-paging failure surfaces as the page's error.
pub struct AppointmentPages<'a> {
    source: &'a dyn AppointmentSource,
    filter: AppointmentFilter,
    next_page: u32,
    exhausted: bool,
}

impl<'a> AppointmentPages<'a> {
    pub fn new(source: &'a dyn AppointmentSource, filter: AppointmentFilter) -> Self {
        Self { source, filter, next_page: 0, exhausted: false }
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<Appointment>>, ClientError> {
        if self.exhausted {
            return Ok(None);
        }
        let batch = self.source.fetch_page(self.next_page, &self.filter).await?;
        if batch.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        self.next_page += 1;
        Ok(Some(batch))
    }
}
