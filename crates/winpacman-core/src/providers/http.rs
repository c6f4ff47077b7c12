use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::models::{CoreError, CoreErrorKind, CoreResult, Manager};

pub const USER_AGENT_STRING: &str = "WinPacMan/0.5 (metadata sync; Rust)";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Shared HTTP client for every network provider: descriptive User-Agent,
/// 30 s per-request deadline, up to 2 retries with exponential backoff on
/// transient failures.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT_STRING)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("failed to build HTTP client: {error}"),
                )
            })?;
        Ok(Self { client })
    }

    /// GET a URL and return the response body. Retries transient failures
    /// (connect errors, timeouts, HTTP 5xx and 429).
    pub async fn get_text(&self, manager: Manager, url: &str) -> CoreResult<String> {
        match self.get_with_retries(manager, url, false).await? {
            Some(body) => Ok(body),
            None => Err(unavailable(manager, url, "resource not found")),
        }
    }

    /// Like `get_text`, but a 404 answers `Ok(None)` instead of an error.
    /// Used by per-package detail lookups.
    pub async fn get_text_optional(&self, manager: Manager, url: &str) -> CoreResult<Option<String>> {
        self.get_with_retries(manager, url, true).await
    }

    async fn get_with_retries(
        &self,
        manager: Manager,
        url: &str,
        missing_is_none: bool,
    ) -> CoreResult<Option<String>> {
        let mut attempt = 0;
        loop {
            match self.get_once(url).await {
                Ok(Fetched::Body(body)) => return Ok(Some(body)),
                Ok(Fetched::NotFound) if missing_is_none => return Ok(None),
                Ok(Fetched::NotFound) => {
                    return Err(unavailable(manager, url, "resource not found (404)"));
                }
                Ok(Fetched::Failed { status, body }) => {
                    return Err(unavailable(
                        manager,
                        url,
                        &format!("HTTP {status}: {}", truncate(&body, 200)),
                    ));
                }
                Err(transient) if attempt < MAX_RETRIES => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(%manager, url, attempt, error = %transient, "transient HTTP failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(transient) => {
                    return Err(unavailable(manager, url, &transient));
                }
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<Fetched, String> {
        debug!(url, "http get");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| error.to_string())?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Fetched::NotFound);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(format!("HTTP {status}"));
        }
        let body = response.text().await.map_err(|error| error.to_string())?;
        if status.is_success() {
            Ok(Fetched::Body(body))
        } else {
            Ok(Fetched::Failed {
                status: status.as_u16(),
                body,
            })
        }
    }
}

enum Fetched {
    Body(String),
    NotFound,
    Failed { status: u16, body: String },
}

fn unavailable(manager: Manager, url: &str, detail: &str) -> CoreError {
    CoreError::for_manager(
        manager,
        CoreErrorKind::ProviderUnavailable,
        format!("request to {url} failed: {detail}"),
    )
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
