//! Session configuration (spec §6 "Config (consumed at session start)"):
//! a `serde`-deserialized TOML record with defaults matching every value
//! the spec's config key table lists.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::system_paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub path: PathBuf,
    pub max_entries: usize,
    pub max_size: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        CacheSection {
            path: default_cache_path(),
            max_entries: 1024,
            max_size: 20 * 1024 * 1024 * 1024,
        }
    }
}

fn default_cache_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".outrun/cache"),
        None => PathBuf::from("/tmp/outrun/cache"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub pool_size: usize,
    pub timeout_ms: u64,
    /// Bind address for the L-side server. Only meaningful for
    /// `outrun-fs-server`; ignored by `outrun-fuse-mount`.
    pub bind_addr: std::net::SocketAddr,
    /// `rpc.server_workers` (spec §4.2 ADDED) — defaults to the same cap
    /// the FUSE side uses so neither plane is the narrower bottleneck.
    pub server_workers: usize,
}

impl Default for RpcSection {
    fn default() -> Self {
        RpcSection {
            pool_size: 4,
            timeout_ms: 30_000,
            bind_addr: "0.0.0.0:7417".parse().expect("static address parses"),
            server_workers: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchSection {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for PrefetchSection {
    fn default() -> Self {
        PrefetchSection { max_entries: 256, max_bytes: 128 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub min_ratio: f64,
}

impl Default for CompressionSection {
    fn default() -> Self {
        CompressionSection { min_ratio: 0.85 }
    }
}

/// The full config record (spec §6). Every section carries its own
/// `Default`, so a TOML file only needs to mention the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSection,
    pub rpc: RpcSection,
    pub prefetch: PrefetchSection,
    pub compression: CompressionSection,
    /// Prefix globs eligible for persistent metadata caching (spec §4.4).
    /// Defaults to [`system_paths::default_prefixes`] when omitted from the
    /// file, rather than to an empty list, so a bare config still gets
    /// useful caching out of the box.
    #[serde(default = "system_paths::default_prefixes")]
    pub system_paths: Vec<String>,
}

impl Config {
    /// Loads a config from a TOML file, falling back to all-defaults for
    /// any key the file omits.
    pub async fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        toml::from_str(&text).map_err(|_| crate::error::Error::ProtocolError)
    }

    pub fn rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rpc.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.cache.max_size, 20 * 1024 * 1024 * 1024);
        assert_eq!(config.rpc.pool_size, 4);
        assert_eq!(config.rpc.timeout_ms, 30_000);
        assert_eq!(config.prefetch.max_entries, 256);
        assert_eq!(config.prefetch.max_bytes, 128 * 1024 * 1024);
        assert!((config.compression.min_ratio - 0.85).abs() < f64::EPSILON);
        assert!(config.system_paths.contains(&"/usr".to_string()));
    }

    #[test]
    fn partial_toml_fills_in_remaining_defaults() {
        let toml_text = r#"
            [cache]
            max_entries = 4096

            [rpc]
            pool_size = 8
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.cache.max_entries, 4096);
        assert_eq!(config.cache.max_size, 20 * 1024 * 1024 * 1024);
        assert_eq!(config.rpc.pool_size, 8);
        assert_eq!(config.rpc.timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn load_reads_toml_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outrun.toml");
        tokio::fs::write(&path, "[prefetch]\nmax_entries = 64\n").await.unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.prefetch.max_entries, 64);
        assert_eq!(config.prefetch.max_bytes, 128 * 1024 * 1024);
    }
}
