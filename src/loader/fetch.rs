//! The fetch primitive the loader drives, and its HTTP implementation.

use crate::loader::errors::FetchError;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::trace;

/// Retrieves the payload behind a URI.
///
/// Implementations report any non-success as an error; timeouts are enforced
/// by the loader, not here.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError>;
}

/// `GET`-based fetcher over a shared reqwest client.
pub struct HttpFetcher {
    http: reqwest::Client,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpFetcher {
    pub fn new(requests_per_second: Option<u32>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mintgrid/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build HTTP client")?;

        let limiter = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self { http, limiter })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let resp = self
            .http
            .get(uri)
            .send()
            .await
            .with_context(|| format!("GET {uri} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                uri: uri.to_owned(),
            });
        }

        let body = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {uri}"))?;
        trace!(uri = %uri, bytes = body.len(), "fetched");
        Ok(body)
    }
}
