//! Shared test fixtures: a scripted fetcher and loader construction helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mintgrid::loader::Loader;
use mintgrid::loader::cache::ResolutionCache;
use mintgrid::loader::errors::FetchError;
use mintgrid::loader::fetch::Fetcher;
use mintgrid::loader::key::Endpoint;
use mintgrid::loader::queue::RequestQueue;
use mintgrid::loader::ranking::{GatewayRanking, RankingConfig};
use mintgrid::loader::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the fake answers a given URI.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Succeed,
    Fail,
    /// Never completes; only a timeout gets the loader past it.
    Hang,
    /// Succeed after a delay.
    Slow(Duration),
}

/// Fetcher whose answers are scripted per URI and which records every call.
pub struct FakeFetcher {
    default: Reply,
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    cancel_on_fetch: Mutex<Option<CancellationToken>>,
    body: Mutex<Option<Bytes>>,
}

impl FakeFetcher {
    pub fn new(default: Reply) -> Arc<Self> {
        Arc::new(Self {
            default,
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            cancel_on_fetch: Mutex::new(None),
            body: Mutex::new(None),
        })
    }

    pub fn reply(&self, uri: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(uri.to_owned(), reply);
    }

    /// Serve `body` for every successful fetch instead of a per-URI text body.
    pub fn serve_body(&self, body: impl Into<Bytes>) {
        *self.body.lock().unwrap() = Some(body.into());
    }

    fn body_for(&self, uri: &str) -> Bytes {
        self.body
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Bytes::from(format!("body of {uri}")))
    }

    /// Cancel `token` as soon as the next fetch starts.
    pub fn cancel_on_fetch(&self, token: CancellationToken) {
        *self.cancel_on_fetch.lock().unwrap() = Some(token);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, uri: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == uri).count()
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
        self.calls.lock().unwrap().push(uri.to_owned());
        if let Some(token) = self.cancel_on_fetch.lock().unwrap().take() {
            token.cancel();
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(uri)
            .copied()
            .unwrap_or(self.default);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        match reply {
            Reply::Succeed => Ok(self.body_for(uri)),
            Reply::Fail => Err(FetchError::Status {
                status: 502,
                uri: uri.to_owned(),
            }),
            Reply::Hang => std::future::pending().await,
            Reply::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.body_for(uri))
            }
        }
    }
}

/// A solid-colour PNG of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([10, 120, 200, 255]),
    ));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn endpoints(hosts: &[&str]) -> Vec<Endpoint> {
    hosts
        .iter()
        .map(|h| Endpoint::new(format!("https://{h}/ipfs")))
        .collect()
}

/// Loader with no backoff and a generous per-attempt timeout.
pub fn loader(fetcher: Arc<FakeFetcher>, concurrency: usize) -> Loader {
    loader_with_policy(
        fetcher,
        concurrency,
        RetryPolicy::immediate(None, Duration::from_secs(5)),
    )
}

pub fn loader_with_policy(
    fetcher: Arc<FakeFetcher>,
    concurrency: usize,
    policy: RetryPolicy,
) -> Loader {
    Loader::new(
        fetcher,
        policy,
        RequestQueue::new(concurrency),
        ResolutionCache::new(),
        GatewayRanking::new(RankingConfig::default()),
    )
}
