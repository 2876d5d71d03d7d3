//! Identifiers for loadable resources and the endpoints that can serve them.

use std::fmt;
use std::sync::Arc;

use crate::loader::errors::LoaderError;

/// Placeholder substituted with the resource path when rendering an endpoint template.
const PATH_PLACEHOLDER: &str = "{path}";

/// Image variant a key refers to. Different variants of the same content never share a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Normal,
    Thumbnail,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Normal => "normal",
            Variant::Thumbnail => "thumb",
        }
    }
}

/// Stable cache/coalescing key for one logical resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    /// Build a key from an arbitrary identifier. Blank identifiers are rejected.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, LoaderError> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(LoaderError::InvalidKey);
        }
        Ok(Self(Arc::from(raw)))
    }

    /// Key for a content id rendered as a particular variant, e.g. `Qm..._normal`.
    pub fn for_cid(cid: &str, variant: Variant) -> Result<Self, LoaderError> {
        if cid.trim().is_empty() {
            return Err(LoaderError::InvalidKey);
        }
        Self::new(format!("{}_{}", cid.trim(), variant.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A gateway/mirror able to serve resources.
///
/// The template either contains `{path}` or is a base URL the path is appended to.
/// Two endpoints are the same endpoint (for ranking purposes) iff their templates match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    template: Arc<str>,
}

impl Endpoint {
    pub fn new(template: impl AsRef<str>) -> Self {
        Self {
            template: Arc::from(template.as_ref().trim()),
        }
    }

    /// Endpoint whose rendered URI is the path itself, for resources that
    /// already carry an absolute URL.
    pub fn direct() -> Self {
        Self::new(PATH_PLACEHOLDER)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render the concrete URI for `path` on this endpoint.
    pub fn uri_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.template.contains(PATH_PLACEHOLDER) {
            self.template.replace(PATH_PLACEHOLDER, path)
        } else {
            format!("{}/{}", self.template.trim_end_matches('/'), path)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl From<&str> for Endpoint {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_for_cid_appends_variant() {
        let key = ResourceKey::for_cid("QmAbc", Variant::Normal).unwrap();
        assert_eq!(key.as_str(), "QmAbc_normal");
        let thumb = ResourceKey::for_cid("QmAbc", Variant::Thumbnail).unwrap();
        assert_ne!(key, thumb);
    }

    #[test]
    fn blank_keys_are_rejected() {
        assert!(matches!(ResourceKey::new("   "), Err(LoaderError::InvalidKey)));
        assert!(matches!(
            ResourceKey::for_cid("", Variant::Normal),
            Err(LoaderError::InvalidKey)
        ));
    }

    #[test]
    fn endpoint_appends_path_to_base() {
        let gw = Endpoint::new("https://ipfs.io/ipfs/");
        assert_eq!(gw.uri_for("QmAbc"), "https://ipfs.io/ipfs/QmAbc");
        assert_eq!(gw.uri_for("/QmAbc/1.png"), "https://ipfs.io/ipfs/QmAbc/1.png");
    }

    #[test]
    fn endpoint_fills_template_placeholder() {
        let gw = Endpoint::new("https://{path}.ipfs.dweb.link");
        assert_eq!(gw.uri_for("bafy"), "https://bafy.ipfs.dweb.link");
    }

    #[test]
    fn direct_endpoint_passes_uri_through() {
        let direct = Endpoint::direct();
        assert_eq!(direct.uri_for("https://example.com/a.png"), "https://example.com/a.png");
    }
}
