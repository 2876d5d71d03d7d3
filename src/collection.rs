//! Collection metadata: the token → image mapping and the token → CID index.

use crate::loader::errors::LoaderError;
use crate::loader::key::{Endpoint, ResourceKey, Variant};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid token id {0:?} in CID index")]
    InvalidTokenId(String),
}

/// One entry of the mapping file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MappingEntry {
    pub id: u32,
    pub metadata: TokenMetadata,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenMetadata {
    pub image: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Attribute {
    pub trait_type: String,
    pub value: serde_json::Value,
}

/// Where an image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRef {
    /// Content-addressed: `<cid>[/sub/path]`, servable by any gateway.
    Ipfs(String),
    /// A plain URL served by exactly one host.
    Http(String),
}

impl ContentRef {
    /// Classify an image reference. Returns `None` for blank or unsupported schemes.
    pub fn parse(uri: &str) -> Option<Self> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("ipfs://") {
            let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
            let rest = rest.trim_matches('/');
            return (!rest.is_empty()).then(|| ContentRef::Ipfs(rest.to_owned()));
        }
        if uri.starts_with("https://") || uri.starts_with("http://") {
            return Some(ContentRef::Http(uri.to_owned()));
        }
        // A bare CID, as stored in the CID index.
        let bare = uri.trim_matches('/');
        if !bare.is_empty()
            && bare
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
        {
            return Some(ContentRef::Ipfs(bare.to_owned()));
        }
        None
    }

    /// The root CID for IPFS content.
    pub fn cid(&self) -> Option<&str> {
        match self {
            ContentRef::Ipfs(path) => path.split('/').next(),
            ContentRef::Http(_) => None,
        }
    }

    /// The path handed to the loader.
    pub fn path(&self) -> &str {
        match self {
            ContentRef::Ipfs(path) | ContentRef::Http(path) => path,
        }
    }

    pub fn key(&self, variant: Variant) -> Result<ResourceKey, LoaderError> {
        match self {
            ContentRef::Ipfs(path) => ResourceKey::for_cid(path, variant),
            ContentRef::Http(url) => ResourceKey::new(format!("{url}_{}", variant.as_str())),
        }
    }

    /// Candidate endpoints: every gateway for IPFS content, the origin itself otherwise.
    pub fn candidates(&self, gateways: &[Endpoint]) -> Vec<Endpoint> {
        match self {
            ContentRef::Ipfs(_) => gateways.to_vec(),
            ContentRef::Http(_) => vec![Endpoint::direct()],
        }
    }
}

pub fn load_mapping(path: &Path) -> Result<Vec<MappingEntry>, CollectionError> {
    let raw = read(path)?;
    let mut entries: Vec<MappingEntry> =
        serde_json::from_str(&raw).map_err(|source| CollectionError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    entries.sort_by_key(|e| e.id);
    Ok(entries)
}

/// Load a `{ "<tokenId>": "<cid>" }` index.
pub fn load_cid_index(path: &Path) -> Result<HashMap<u32, String>, CollectionError> {
    let raw = read(path)?;
    let parsed: HashMap<String, String> =
        serde_json::from_str(&raw).map_err(|source| CollectionError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    parsed
        .into_iter()
        .map(|(id, cid)| {
            id.parse::<u32>()
                .map(|id| (id, cid))
                .map_err(|_| CollectionError::InvalidTokenId(id))
        })
        .collect()
}

/// Map a command-line argument to the reference to resolve.
///
/// With an index, numeric arguments are token ids and must be present in it;
/// `None` means the id is unknown. Anything else passes through unchanged.
pub fn index_target<'a>(
    raw: &'a str,
    index: Option<&'a HashMap<u32, String>>,
) -> Option<&'a str> {
    match (index, raw.trim().parse::<u32>()) {
        (Some(index), Ok(id)) => index.get(&id).map(String::as_str),
        _ => Some(raw),
    }
}

fn read(path: &Path) -> Result<String, CollectionError> {
    std::fs::read_to_string(path).map_err(|source| CollectionError::Read {
        path: path.display().to_string(),
        source,
    })
}
