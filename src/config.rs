use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Realdebrid,
    Torbox,
    Debridlink,
    Alldebrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FolderNaming {
    Filename,
    Original,
    FilenameNoExt,
    OriginalNoExt,
    Id,
    Infohash,
}

impl Default for FolderNaming {
    fn default() -> Self {
        FolderNaming::Filename
    }
}

/// A single AND-combined filter condition within a custom folder. Values are
/// kept as the raw config string; `cache::index` compiles them (regex, size,
/// duration) once at Cache construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: ProviderKind,
    pub host: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub download_api_keys: Vec<String>,
    pub folder: String,
    /// Categories routed to this provider by the qBittorrent façade. Empty
    /// means "accepts anything not claimed by another provider".
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    pub proxy: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub check_cached: bool,
    #[serde(default)]
    pub add_samples: bool,
    #[serde(default)]
    pub download_uncached: bool,
    #[serde(default = "default_torrents_refresh_interval")]
    pub torrents_refresh_interval: String,
    #[serde(default = "default_download_links_refresh_interval")]
    pub download_links_refresh_interval: String,
    #[serde(default = "default_auto_expire_links_after")]
    pub auto_expire_links_after: String,
    #[serde(default)]
    pub folder_naming: FolderNaming,
    #[serde(default)]
    pub directories: HashMap<String, DirectoryConfig>,
    pub rc_url: Option<String>,
    pub rc_user: Option<String>,
    pub rc_pass: Option<String>,
    #[serde(default)]
    pub stream_with_rclone: bool,
    pub max_torrent_size: Option<u64>,
}

fn default_rate_limit() -> u32 {
    10
}

fn default_workers() -> usize {
    8
}

fn default_torrents_refresh_interval() -> String {
    "15m".to_string()
}

fn default_download_links_refresh_interval() -> String {
    "5m".to_string()
}

fn default_auto_expire_links_after() -> String {
    "48h".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_url_base")]
    pub url_base: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    pub providers: Vec<ProviderConfig>,
}

fn default_url_base() -> String {
    String::new()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8282
}

fn default_categories() -> Vec<String> {
    vec!["sonarr".to_string(), "radarr".to_string()]
}

impl Config {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn provider_cache_dir(&self, provider_name: &str) -> PathBuf {
        self.cache_dir().join(provider_name)
    }

    /// Resolves the provider folder a qBittorrent `category` should be
    /// routed to: first a provider explicitly claiming it, then the first
    /// catch-all provider (one with no `categories` configured), then
    /// whichever provider is configured first.
    pub fn provider_for_category(&self, category: Option<&str>) -> Option<&str> {
        if let Some(category) = category {
            if let Some(p) = self.providers.iter().find(|p| p.categories.iter().any(|c| c == category)) {
                return Some(&p.folder);
            }
        }
        self.providers
            .iter()
            .find(|p| p.categories.is_empty())
            .or_else(|| self.providers.first())
            .map(|p| p.folder.as_str())
    }
}

static CONFIG: once_cell::sync::OnceCell<std::sync::RwLock<Config>> =
    once_cell::sync::OnceCell::new();

pub fn get_config() -> Config {
    CONFIG
        .get_or_init(|| std::sync::RwLock::new(load_config().expect("failed to load configuration")))
        .read()
        .unwrap()
        .clone()
}

/// Re-parses configuration and swaps the published snapshot. Used by the
/// orchestrator's restart path; never called from request-handling code.
pub fn reload_config() -> anyhow::Result<()> {
    let fresh = load_config()?;
    let cell = CONFIG.get_or_init(|| std::sync::RwLock::new(fresh.clone()));
    *cell.write().unwrap() = fresh;
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name("debridvault").required(false))
        .add_source(config::Environment::with_prefix("debridvault").separator("__"));

    let built = builder.build()?;
    let mut config: Config = built.try_deserialize()?;

    if !config.data_dir.exists() {
        std::fs::create_dir_all(&config.data_dir)?;
    }

    let cache_dir = config.cache_dir();
    if !cache_dir.exists() {
        std::fs::create_dir_all(&cache_dir)?;
    }

    if config.providers.is_empty() {
        anyhow::bail!("no providers configured");
    }

    for provider in &config.providers {
        let dir = config.provider_cache_dir(&provider.folder);
        std::fs::create_dir_all(dir.join("trash"))?;
    }

    if config.categories.len() == 1 {
        let first = config.categories.into_iter().next().unwrap();
        config.categories = first.split(',').map(|s| s.to_string()).collect();
    }

    Ok(config)
}

/// Applies the `UMASK` environment variable to the process, as the core path
/// expects. Octal, e.g. `022`.
pub fn apply_umask() {
    if let Ok(raw) = std::env::var("UMASK") {
        if let Ok(mask) = u32::from_str_radix(raw.trim(), 8) {
            unsafe {
                libc::umask(mask as libc::mode_t);
            }
        } else {
            tracing::warn!("UMASK value {} is not valid octal, ignoring", raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(folder: &str, categories: &[&str]) -> ProviderConfig {
        ProviderConfig {
            name: ProviderKind::Realdebrid,
            host: None,
            api_key: "key".to_string(),
            download_api_keys: Vec::new(),
            folder: folder.to_string(),
            categories: categories.iter().map(|s| s.to_string()).collect(),
            rate_limit: default_rate_limit(),
            proxy: None,
            workers: default_workers(),
            check_cached: false,
            add_samples: false,
            download_uncached: false,
            torrents_refresh_interval: default_torrents_refresh_interval(),
            download_links_refresh_interval: default_download_links_refresh_interval(),
            auto_expire_links_after: default_auto_expire_links_after(),
            folder_naming: FolderNaming::default(),
            directories: HashMap::new(),
            rc_url: None,
            rc_user: None,
            rc_pass: None,
            stream_with_rclone: false,
            max_torrent_size: None,
        }
    }

    fn config_with(providers: Vec<ProviderConfig>) -> Config {
        Config {
            data_dir: PathBuf::from("/tmp/debridvault"),
            cache_dir: None,
            url_base: default_url_base(),
            host: default_host(),
            port: default_port(),
            categories: default_categories(),
            providers,
        }
    }

    #[test]
    fn routes_to_provider_claiming_category() {
        let config = config_with(vec![
            provider("rd", &["sonarr"]),
            provider("tb", &["radarr"]),
        ]);
        assert_eq!(config.provider_for_category(Some("radarr")), Some("tb"));
    }

    #[test]
    fn falls_back_to_catch_all_provider() {
        let config = config_with(vec![provider("rd", &["sonarr"]), provider("catch_all", &[])]);
        assert_eq!(config.provider_for_category(Some("unclaimed")), Some("catch_all"));
    }

    #[test]
    fn falls_back_to_first_provider_with_no_catch_all() {
        let config = config_with(vec![provider("rd", &["sonarr"]), provider("tb", &["radarr"])]);
        assert_eq!(config.provider_for_category(Some("unclaimed")), Some("rd"));
    }

    #[test]
    fn no_category_prefers_catch_all() {
        let config = config_with(vec![provider("rd", &["sonarr"]), provider("catch_all", &[])]);
        assert_eq!(config.provider_for_category(None), Some("catch_all"));
    }
}
