use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Batch tooling for a content-addressed image collection.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Configuration file (defaults to ./mintgrid.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download every collection image through the gateway loader and write square thumbnails.
    Thumbnails {
        /// Mapping file overriding `thumbnails.mapping_path`
        #[arg(long)]
        mapping: Option<PathBuf>,
        /// Output directory overriding `thumbnails.output_dir`
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only process tokens in this inclusive id range, e.g. `0..=499`
        #[arg(long, value_parser = parse_id_range)]
        range: Option<IdRange>,
    },
    /// Upscale undersized thumbnails in place with nearest-neighbour sampling.
    Upscale {
        /// Directory overriding `upscale.input_dir`
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Resolve content ids to the first gateway URL that serves them.
    Resolve {
        /// Content ids (optionally with a sub-path, or as `ipfs://` URIs)
        #[arg(required = true)]
        cids: Vec<String>,
        /// Token id to CID index; numeric arguments are looked up in it
        #[arg(long)]
        index: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TracingFormat {
    /// Human-readable output
    Pretty,
    /// Structured JSON
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

/// Inclusive range of token ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    pub start: u32,
    pub end: u32,
}

impl IdRange {
    pub fn contains(&self, id: u32) -> bool {
        (self.start..=self.end).contains(&id)
    }
}

/// Parse `a..=b`, `a..b` (exclusive end) or a single id.
fn parse_id_range(raw: &str) -> Result<IdRange, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid token id {s:?}: {e}"))
    };

    let (start, end) = if let Some((a, b)) = raw.split_once("..=") {
        (parse(a)?, parse(b)?)
    } else if let Some((a, b)) = raw.split_once("..") {
        let end = parse(b)?;
        if end == 0 {
            return Err(format!("empty range {raw:?}"));
        }
        (parse(a)?, end - 1)
    } else {
        let id = parse(raw)?;
        (id, id)
    };

    if start > end {
        return Err(format!("empty range {raw:?}"));
    }
    Ok(IdRange { start, end })
}
