use std::{collections::BTreeMap, path::PathBuf};

use ferrix_compat::nixcpp::conf::{NixConfig, DEFAULT_TARBALL_TTL};

/// Settings the fetchers consult. Built from a [NixConfig] and passed
/// around explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchSettings {
    /// Seconds a resolved moving reference stays fresh.
    pub tarball_ttl: u64,
    /// host (optionally followed by a path) to access token.
    pub access_tokens: BTreeMap<String, String>,
    /// Whether fetching from a working tree with uncommitted changes is
    /// allowed.
    pub allow_dirty: bool,
    /// Whether to warn about such working trees.
    pub warn_dirty: bool,
    /// Where git mirrors and the fetch cache database live.
    pub cache_dir: PathBuf,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            tarball_ttl: DEFAULT_TARBALL_TTL,
            access_tokens: BTreeMap::new(),
            allow_dirty: true,
            warn_dirty: true,
            cache_dir: default_cache_dir(),
        }
    }
}

impl From<&NixConfig> for FetchSettings {
    fn from(config: &NixConfig) -> Self {
        Self {
            tarball_ttl: config.tarball_ttl(),
            access_tokens: config.access_tokens.clone().unwrap_or_default(),
            allow_dirty: config.allow_dirty.unwrap_or(true),
            warn_dirty: config.warn_dirty.unwrap_or(true),
            cache_dir: default_cache_dir(),
        }
    }
}

impl FetchSettings {
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Returns the access token configured for `host`, if any.
    pub fn access_token(&self, host: &str) -> Option<&str> {
        self.access_tokens.get(host).map(String::as_str)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nix")
}
