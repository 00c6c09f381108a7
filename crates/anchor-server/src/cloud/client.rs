//! Cloud API client.
//!
//! Every call either yields parsed JSON or degrades to `None`/empty with a
//! `warn!` log; nothing here surfaces a transport failure to job code.

use std::time::Duration;

use anchor_core::config::{CloudConfig, REGION_PLACEHOLDER};
use anchor_core::model::normalize_region;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Header carrying the caller's token on every upstream request.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Failure fetching one upstream page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Transport(reqwest::Error),

    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },

    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("full page of {count} items carried no next link")]
    MissingNextLink { count: usize },

    #[error("build deadline exceeded")]
    DeadlineExceeded,

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e)
        }
    }
}

impl FetchError {
    /// Whether the same request may succeed if issued again.
    ///
    /// Timeouts, transport errors, throttling and 5xx responses are retried;
    /// everything else ends the fetch for that page.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status } => *status == 429 || *status >= 500,
            Self::Decode(_)
            | Self::MissingNextLink { .. }
            | Self::DeadlineExceeded
            | Self::InvalidToken
            | Self::Config(_) => false,
        }
    }
}

/// Raw result of paging through the current-generation server listing.
#[derive(Debug, Default)]
pub struct ServerListing {
    pub servers: Vec<Value>,
    /// Pages successfully fetched.
    pub pages: usize,
    /// `false` when paging stopped on an error rather than a short page.
    pub complete: bool,
}

/// Client for the provider's compute, block-storage and identity APIs.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    config: CloudConfig,
}

impl CloudClient {
    /// Create a new client from endpoint configuration.
    pub fn new(config: &CloudConfig) -> Result<Self, FetchError> {
        if config.compute_url.is_empty() || config.identity_url.is_empty() {
            return Err(FetchError::Config("endpoint URL is empty".into()));
        }
        if config.page_limit == 0 {
            return Err(FetchError::Config("page_limit must be positive".into()));
        }

        // reqwest is built with rustls-no-provider; `Err` means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(FetchError::from)?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    pub const fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub const fn page_limit(&self) -> u32 {
        self.config.page_limit
    }

    // =========================================================================
    // URL construction
    // =========================================================================

    pub(crate) fn region_base(template: &str, region: &str) -> String {
        template
            .replace(REGION_PLACEHOLDER, &normalize_region(region))
            .trim_end_matches('/')
            .to_string()
    }

    pub(crate) fn servers_url(&self, account_number: &str, region: &str) -> String {
        format!(
            "{}/{account_number}/servers/detail?limit={}",
            Self::region_base(&self.config.compute_url, region),
            self.config.page_limit
        )
    }

    pub(crate) fn server_url(&self, account_number: &str, region: &str, server_id: &str) -> String {
        format!(
            "{}/{account_number}/servers/{server_id}",
            Self::region_base(&self.config.compute_url, region)
        )
    }

    pub(crate) fn legacy_servers_url(&self, account_number: &str, region: &str) -> String {
        format!(
            "{}/{account_number}/servers/detail",
            Self::region_base(&self.config.legacy_compute_url, region)
        )
    }

    pub(crate) fn volumes_url(&self, account_number: &str, region: &str) -> String {
        format!(
            "{}/{account_number}/volumes/detail",
            Self::region_base(&self.config.block_storage_url, region)
        )
    }

    pub(crate) fn identity_users_url(&self) -> String {
        format!("{}/users", self.config.identity_url.trim_end_matches('/'))
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    async fn fetch_once(&self, url: &str, token: &HeaderValue) -> Result<Value, FetchError> {
        let resp = self
            .http
            .get(url)
            .header(AUTH_TOKEN_HEADER, token.clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// GET `url` and parse JSON, retrying retryable failures up to `max_attempts`.
    pub async fn try_fetch(&self, url: &str, token: &str) -> Result<Value, FetchError> {
        let token = HeaderValue::from_str(token).map_err(|_| FetchError::InvalidToken)?;
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once(url, &token).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(url, attempt, error = %e, "Retrying upstream fetch");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET `url` and parse JSON; any failure is logged and yields `None`.
    pub async fn fetch_page(&self, url: &str, token: &str) -> Option<Value> {
        match self.try_fetch(url, token).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(url, error = %e, "Upstream fetch failed");
                None
            }
        }
    }

    /// Decide where pagination goes after a page of `count` items.
    pub(crate) fn next_url(page: &Value, count: usize, limit: usize) -> Result<Option<String>, FetchError> {
        if count < limit {
            return Ok(None);
        }
        let links = page
            .get("servers_links")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        links
            .iter()
            .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))
            .or_else(|| links.first())
            .and_then(|l| l.get("href"))
            .and_then(Value::as_str)
            .map(|href| Some(href.to_string()))
            .ok_or(FetchError::MissingNextLink { count })
    }

    /// Page through the current-generation server listing.
    ///
    /// Pages are fetched sequentially, each URL coming from the previous
    /// page's next link. A page shorter than the limit ends the listing; a
    /// failure or an elapsed `deadline` ends it early with what was gathered.
    pub async fn list_servers(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
        deadline: Option<Instant>,
    ) -> ServerListing {
        let limit = self.config.page_limit as usize;
        let mut listing = ServerListing::default();
        let mut url = Some(self.servers_url(account_number, region));

        while let Some(current) = url.take() {
            let step = async {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(FetchError::DeadlineExceeded);
                }
                let mut page = self.try_fetch(&current, token).await?;
                let servers = match page.get_mut("servers").map(Value::take) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let next = Self::next_url(&page, servers.len(), limit);
                Ok::<_, FetchError>((servers, next))
            };

            match step.await {
                Ok((servers, next)) => {
                    listing.pages += 1;
                    listing.servers.extend(servers);
                    match next {
                        Ok(Some(href)) => url = Some(href),
                        Ok(None) => listing.complete = true,
                        Err(e) => warn!(account_number, region, error = %e, "Stopping server pagination"),
                    }
                }
                Err(e) => {
                    warn!(
                        account_number,
                        region,
                        url = %current,
                        pages = listing.pages,
                        error = %e,
                        "Server listing ended early"
                    );
                }
            }
        }

        debug!(
            account_number,
            region,
            pages = listing.pages,
            servers = listing.servers.len(),
            complete = listing.complete,
            "Server listing finished"
        );
        listing
    }

    fn take_array(mut page: Value, field: &str) -> Vec<Value> {
        match page.get_mut(field).map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        }
    }

    /// Fetch the (unpaginated) legacy-generation server listing.
    pub async fn list_legacy_servers(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
    ) -> Option<Vec<Value>> {
        let page = self
            .fetch_page(&self.legacy_servers_url(account_number, region), token)
            .await?;
        Some(Self::take_array(page, "servers"))
    }

    /// Fetch the (unpaginated) block-storage volume listing.
    pub async fn list_volumes(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
    ) -> Option<Vec<Value>> {
        let page = self
            .fetch_page(&self.volumes_url(account_number, region), token)
            .await?;
        Some(Self::take_array(page, "volumes"))
    }

    /// Fetch one current-generation server.
    pub async fn server_details(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
        server_id: &str,
    ) -> Option<Value> {
        let mut page = self
            .fetch_page(&self.server_url(account_number, region, server_id), token)
            .await?;
        match page.get_mut("server").map(Value::take) {
            Some(server @ Value::Object(_)) => Some(server),
            _ => {
                warn!(account_number, server_id, "Server detail response had no server object");
                None
            }
        }
    }

    /// Validate a token against the identity endpoint.
    ///
    /// Only HTTP 200 counts as valid; the payload is not inspected.
    pub async fn check_token(&self, account_number: &str, token: &str) -> bool {
        let Ok(value) = HeaderValue::from_str(token) else {
            return false;
        };
        match self
            .http
            .get(self.identity_users_url())
            .header(AUTH_TOKEN_HEADER, value)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status() == StatusCode::OK;
                if !ok {
                    debug!(account_number, status = resp.status().as_u16(), "Token rejected");
                }
                ok
            }
            Err(e) => {
                warn!(account_number, error = %FetchError::from(e), "Token check failed");
                false
            }
        }
    }
}
