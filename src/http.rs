//! HTTP fetch layer shared by all engines. Wraps a reqwest client with
//! per-request timeouts, a TLS-verification toggle, and an optional stealth
//! mode that rotates user agents and jitters request timing.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::{
    DEFAULT_HTTP_TIMEOUT, SNIPPET_LEN, SNIPPET_LEN_VERBOSE, STEALTH_MAX_DELAY, STEALTH_MIN_DELAY,
    USER_AGENTS,
};
use crate::error::Error;

/// A completed HTTP exchange
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP client with stealth and TLS controls
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    insecure: reqwest::Client,
    stealth: bool,
}

impl HttpClient {
    pub fn new() -> Result<Self, Error> {
        Self::with_stealth(false)
    }

    pub fn with_stealth(stealth: bool) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;
        let insecure = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure,
            stealth,
        })
    }

    pub fn stealth(&self) -> bool {
        self.stealth
    }

    /// Next user agent from the rotating pool; consecutive requests never
    /// reuse the same identity
    pub fn pick_user_agent() -> &'static str {
        static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let idx = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        USER_AGENTS[idx % USER_AGENTS.len()]
    }

    /// Wait the stealth jitter interval before a request goes out
    pub async fn stealth_delay() {
        let span = (STEALTH_MAX_DELAY - STEALTH_MIN_DELAY).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=span);
        tokio::time::sleep(STEALTH_MIN_DELAY + Duration::from_millis(jitter)).await;
    }

    fn pick_client(&self, verify_tls: bool) -> &reqwest::Client {
        if verify_tls { &self.client } else { &self.insecure }
    }

    /// GET a URL and return status + body text
    pub async fn get_text(
        &self,
        url: &str,
        timeout: Duration,
        verify_tls: bool,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, Error> {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        if self.stealth {
            cancel.guard(Self::stealth_delay()).await?;
        }

        let mut request = self.pick_client(verify_tls).get(url).timeout(timeout);
        if self.stealth {
            request = request.header(reqwest::header::USER_AGENT, Self::pick_user_agent());
        }

        debug!(url, "HTTP GET");
        let response = cancel.guard(request.send()).await??;
        let status = response.status().as_u16();
        let body = cancel.guard(response.text()).await??;
        Ok(HttpResponse { status, body })
    }

    /// Send an arbitrary request built from method, URL, headers, and body
    pub async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout: Duration,
        verify_tls: bool,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, Error> {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        if self.stealth {
            cancel.guard(Self::stealth_delay()).await?;
        }

        let mut request = self.pick_client(verify_tls).request(method, url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if self.stealth {
            request = request.header(reqwest::header::USER_AGENT, Self::pick_user_agent());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(url, "HTTP request");
        let response = cancel.guard(request.send()).await??;
        let status = response.status().as_u16();
        let body = cancel.guard(response.text()).await??;
        Ok(HttpResponse { status, body })
    }
}

/// Truncate a request/response body for attachment to error reports
pub fn snippet(body: &str, verbose: bool) -> String {
    let limit = if verbose {
        SNIPPET_LEN_VERBOSE
    } else {
        SNIPPET_LEN
    };
    let trimmed = body.trim();
    if trimmed.len() <= limit {
        trimmed.to_string()
    } else {
        let mut end = limit;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}
