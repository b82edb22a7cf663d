//! Shared HTTP transport for the store adapters.
//!
//! Listing requests are retried; writes are sent once. Every request is
//! followed by a fixed pause to stay under the stores' rate limits
//! (Airtable allows 5 requests per second per base).

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::StoreError;

/// Attempts per listing request before giving up.
pub const MAX_ATTEMPTS: usize = 3;

/// Pause after every request.
pub const REQUEST_PAUSE: Duration = Duration::from_millis(200);

/// Maximum pages followed in one listing.
pub const MAX_PAGES: usize = 500;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How requests are authenticated.
#[derive(Clone)]
pub enum Auth {
    /// A custom header carrying the token, e.g. `OSDI-API-Token`.
    Header { name: &'static str, token: String },
    /// `Authorization: Bearer <token>`.
    Bearer(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Header { name, .. } => write!(f, "Header({}: ***)", name),
            Self::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Authenticated JSON-over-HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    auth: Auth,
    pause: Duration,
}

impl HttpTransport {
    pub fn new(auth: Auth) -> Result<Self, StoreError> {
        let http = Client::builder()
            .user_agent(concat!("rostersync/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            auth,
            pause: REQUEST_PAUSE,
        })
    }

    /// Override the pause after each request.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.auth {
            Auth::Header { name, token } => req.header(*name, token),
            Auth::Bearer(token) => req.bearer_auth(token),
        }
    }

    /// GET `url` and parse the JSON body, retrying transient failures.
    pub async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(url, attempt, "GET");
            match self.send(self.request(Method::GET, url).query(query)).await {
                Ok(body) => return Ok(body),
                Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                    warn!(url, attempt, error = %e, "request failed, retrying");
                }
                Err(e) if is_retryable(&e) => {
                    return Err(StoreError::RetriesExhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a JSON body once and parse the JSON response.
    pub async fn send_json(&self, method: Method, url: &str, body: &Value) -> Result<Value, StoreError> {
        debug!(url, method = %method, "sending write");
        self.send(self.request(method, url).json(body)).await
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, StoreError> {
        let result = req.send().await;
        tokio::time::sleep(self.pause).await;
        let resp = result?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StoreError::AuthenticationFailed {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Parse(e.to_string()))
    }
}

/// Network errors, throttling and server-side failures are worth another try.
fn is_retryable(err: &StoreError) -> bool {
    match err {
        StoreError::Http(_) | StoreError::RateLimited => true,
        StoreError::Api { status, .. } => *status >= 500,
        _ => false,
    }
}
