use crate::batch::thumbnails::ThumbnailJob;
use crate::batch::{BatchStats, upscale};
use crate::cli::{Command, IdRange};
use crate::collection::{self, ContentRef};
use crate::config::Config;
use crate::loader::cache::ResolutionCache;
use crate::loader::fetch::{Fetcher, HttpFetcher};
use crate::loader::key::Variant;
use crate::loader::queue::RequestQueue;
use crate::loader::ranking::GatewayRanking;
use crate::loader::Loader;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main application struct holding the configured loader and shutdown token.
pub struct App {
    config: Config,
    loader: Loader,
    shutdown: CancellationToken,
}

impl App {
    /// Create a new App backed by the HTTP fetcher.
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.requests_per_second)
            .context("Failed to create HTTP fetcher")?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let loader = build_loader(&config, fetcher);
        info!(
            gateways = config.gateways.len(),
            concurrency = config.concurrency,
            max_attempts = ?config.retry.max_attempts,
            attempt_timeout = ?config.retry.attempt_timeout,
            "loader configured"
        );
        Self {
            config,
            loader,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Cancel all work on the first Ctrl-C.
    pub fn spawn_shutdown_listener(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupt received, stopping after in-flight work settles");
                    shutdown.cancel();
                }
                Err(e) => error!(error = ?e, "failed to listen for interrupt"),
            }
        });
    }

    /// Run a subcommand to completion.
    pub async fn run(self, command: Command) -> ExitCode {
        let result = match command {
            Command::Thumbnails {
                mapping,
                output,
                range,
            } => self.thumbnails(mapping, output, range).await,
            Command::Upscale { input } => self.upscale(input).await,
            Command::Resolve { cids, index } => self.resolve(&cids, index).await,
        };

        match result {
            Ok(()) if self.shutdown.is_cancelled() => ExitCode::from(130),
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = ?e, "command failed");
                ExitCode::FAILURE
            }
        }
    }

    async fn thumbnails(
        &self,
        mapping: Option<PathBuf>,
        output: Option<PathBuf>,
        range: Option<IdRange>,
    ) -> Result<()> {
        let mut config = self.config.thumbnails.clone();
        if let Some(mapping) = mapping {
            config.mapping_path = mapping;
        }
        if let Some(output) = output {
            config.output_dir = output;
        }

        let mut entries = collection::load_mapping(&config.mapping_path).with_context(|| {
            format!("Failed to load mapping {}", config.mapping_path.display())
        })?;
        if let Some(range) = range {
            entries.retain(|e| range.contains(e.id));
        }
        info!(
            tokens = entries.len(),
            output = %config.output_dir.display(),
            size = config.size,
            "generating thumbnails"
        );

        let job = ThumbnailJob::new(self.loader.clone(), self.config.endpoints(), &config);
        let stats = job.run(entries, &self.shutdown).await?;
        self.log_ranking();
        report_failures("thumbnails", &stats);
        Ok(())
    }

    async fn upscale(&self, input: Option<PathBuf>) -> Result<()> {
        let mut config = self.config.upscale.clone();
        if let Some(input) = input {
            config.input_dir = input;
        }
        let stats = upscale::run(&config, &self.shutdown).await?;
        report_failures("upscale", &stats);
        Ok(())
    }

    async fn resolve(&self, refs: &[String], index: Option<PathBuf>) -> Result<()> {
        let index = match index {
            Some(path) => Some(
                collection::load_cid_index(&path)
                    .with_context(|| format!("Failed to load CID index {}", path.display()))?,
            ),
            None => None,
        };
        let gateways = self.config.endpoints();
        let fallback = self.config.fallback_uri.as_str();

        let lookups = refs.iter().map(|raw| {
            let gateways = &gateways;
            let index = index.as_ref();
            async move {
                let Some(target) = collection::index_target(raw, index) else {
                    warn!(input = %raw, "token id not in CID index");
                    return Ok::<_, anyhow::Error>((raw.clone(), fallback.to_owned()));
                };
                let Some(content) = ContentRef::parse(target) else {
                    warn!(input = %raw, "not a content reference");
                    return Ok((raw.clone(), fallback.to_owned()));
                };
                let key = content.key(Variant::Normal)?;
                let candidates = content.candidates(gateways);
                let uri = self
                    .loader
                    .resolve_or(&key, content.path(), &candidates, fallback, &self.shutdown)
                    .await?;
                Ok((raw.clone(), uri))
            }
        });

        for result in futures::future::join_all(lookups).await {
            let (input, uri) = result?;
            println!("{input}\t{uri}");
        }
        self.log_ranking();
        Ok(())
    }

    fn log_ranking(&self) {
        for (endpoint, stats) in self.loader.ranking().snapshot() {
            debug!(
                endpoint = %endpoint,
                score = stats.score,
                successes = stats.successes,
                failures = stats.failures,
                "gateway ranking"
            );
        }
    }
}

/// Assemble a loader from configuration.
pub fn build_loader(config: &Config, fetcher: Arc<dyn Fetcher>) -> Loader {
    Loader::new(
        fetcher,
        config.retry,
        RequestQueue::new(config.concurrency),
        ResolutionCache::new(),
        GatewayRanking::new(config.ranking),
    )
}

fn report_failures(job: &str, stats: &BatchStats) {
    if stats.failed > 0 {
        warn!(
            job,
            failed = stats.failed,
            total = stats.total,
            "some items failed; re-run to retry them"
        );
    }
}
