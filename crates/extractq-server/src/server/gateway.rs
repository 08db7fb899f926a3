//! Access to the rate-limited upstream query service.
//!
//! The [`UpstreamGateway`] trait is what the scheduler consumes; the
//! [`OverpassGateway`] implementation talks to an Overpass API instance over
//! HTTP. Status failures carry enough context (URL and response body, or the
//! fact that it timed out) to be forwarded to an operator unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;

/// Upstream capacity as reported by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatus {
    /// Requests allowed per client; `0` means the upstream does not limit.
    pub rate_limit: u32,
    /// Slots that can be used right now.
    pub available: u32,
    /// Seconds until each busy slot frees up.
    pub slots: Vec<u64>,
}

impl SlotStatus {
    /// Seconds to wait before the next request, or `None` to go ahead now.
    ///
    /// With no free slot and no reported release time there is nothing to
    /// wait for, so the request goes ahead and lets the upstream decide.
    pub fn wait_secs(&self) -> Option<u64> {
        if self.rate_limit == 0 || self.available > 0 {
            return None;
        }
        self.slots.iter().copied().min().filter(|secs| *secs > 0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The status endpoint answered with an error or an unreadable body.
    #[error("Upstream status unavailable at {url} (HTTP {status})")]
    Unavailable {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Timeout talking to upstream at {url}")]
    Timeout { url: String },

    /// The request never produced a response.
    #[error("Upstream request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The query endpoint rejected or failed the query.
    #[error("Upstream query at {url} failed (HTTP {status})")]
    Fetch {
        url: String,
        status: u16,
        body: String,
    },
}

impl GatewayError {
    /// Subject and body of the operator alert for this failure.
    pub fn alert(&self) -> (String, String) {
        match self {
            Self::Unavailable { url, body, .. } => (
                "Overpass API unavailable".to_string(),
                format!("URL: {url}\n\nresponse:\n{body}"),
            ),
            Self::Timeout { url } => (
                "Overpass API timeout".to_string(),
                format!("Timeout talking to overpass API\n\nURL: {url}"),
            ),
            Self::Transport { url, source } => (
                "Overpass API unavailable".to_string(),
                format!("URL: {url}\n\nerror:\n{source}"),
            ),
            Self::Fetch { url, status, body } => (
                "Overpass query failed".to_string(),
                format!("URL: {url}\n\nstatus: {status}\n\nresponse:\n{body}"),
            ),
        }
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
pub trait UpstreamGateway: Send + Sync {
    /// Current capacity. Failures are not retried here.
    async fn status(&self) -> Result<SlotStatus, GatewayError>;

    /// Runs `query` and returns the raw response body.
    async fn fetch(&self, query: &str) -> Result<Bytes, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct OverpassGateway {
    client: reqwest::Client,
    status_url: String,
    interpreter_url: String,
    status_timeout: Duration,
    fetch_timeout: Duration,
}

impl OverpassGateway {
    /// `base_url` is the API root, e.g. `https://overpass-api.de/api`.
    pub fn new(
        base_url: &str,
        status_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let base = base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .user_agent(concat!("extractq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            status_url: format!("{base}/status"),
            interpreter_url: format!("{base}/interpreter"),
            status_timeout,
            fetch_timeout,
        })
    }
}

#[async_trait]
impl UpstreamGateway for OverpassGateway {
    async fn status(&self) -> Result<SlotStatus, GatewayError> {
        let url = &self.status_url;
        let response = self
            .client
            .get(url)
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(url, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(url, e))?;

        if !status.is_success() {
            return Err(GatewayError::Unavailable {
                url: url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        parse_status(&body).ok_or_else(|| GatewayError::Unavailable {
            url: url.clone(),
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch(&self, query: &str) -> Result<Bytes, GatewayError> {
        let url = &self.interpreter_url;
        let response = self
            .client
            .post(url)
            .timeout(self.fetch_timeout)
            .body(query.to_owned())
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Fetch {
                url: url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| GatewayError::from_reqwest(url, e))
    }
}

/// Parses the plain-text body of the Overpass `status` endpoint.
///
/// ```text
/// Rate limit: 2
/// 1 slots available now.
/// Slot available after: 2024-05-01T10:00:07Z, in 7 seconds.
/// ```
///
/// Returns `None` if the body has no `Rate limit` line.
pub fn parse_status(body: &str) -> Option<SlotStatus> {
    let mut rate_limit = None;
    let mut status = SlotStatus::default();

    for line in body.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Rate limit:") {
            rate_limit = rest.trim().parse().ok();
        } else if let Some(count) = line.strip_suffix("slots available now.") {
            status.available = count.trim().parse().unwrap_or(0);
        } else if line.starts_with("Slot available after:") {
            let secs = line
                .rsplit_once(", in ")
                .and_then(|(_, tail)| tail.split_whitespace().next())
                .and_then(|n| n.parse::<i64>().ok());
            if let Some(secs) = secs {
                status.slots.push(secs.max(0).unsigned_abs());
            }
        }
    }

    status.rate_limit = rate_limit?;
    Some(status)
}
