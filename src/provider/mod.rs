pub mod realdebrid;

use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What gets submitted for a new download: either a magnet URI or the raw
/// bytes of a `.torrent` file. `submit_magnet` dispatches on this instead of
/// having two entry points.
#[derive(Debug, Clone)]
pub enum Submission {
    Magnet(String),
    TorrentFile(Vec<u8>),
}

impl Submission {
    pub fn is_torrent(&self) -> bool {
        matches!(self, Submission::TorrentFile(_))
    }
}

/// A single file within a torrent, keyed by display name in `Torrent::files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentFile {
    pub id: String,
    pub torrent_id: String,
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Restricted, account-gated URL from the provider. Empty until the
    /// provider has generated links for this file.
    pub link: String,
    /// Short-lived resolved URL, populated by the Download-Link Cache.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub download_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Torrent {
    pub id: String,
    pub info_hash: String,
    pub name: String,
    pub original_name: String,
    pub filename: String,
    pub size: u64,
    pub added_at: DateTime<Utc>,
    pub status: String,
    pub files: HashMap<String, TorrentFile>,
}

impl Torrent {
    pub fn is_complete(&self) -> bool {
        !self.files.is_empty() && self.files.values().all(|f| !f.link.is_empty())
    }
}

/// Result of resolving a restricted link to a usable download URL.
#[derive(Debug, Clone)]
pub struct DownloadLinkInfo {
    pub id: String,
    pub link: String,
    pub download_link: String,
    pub size: u64,
    pub filename: String,
    pub generated_at: DateTime<Utc>,
    pub account_id: String,
}

use serde::{Deserialize, Serialize};

/// The narrow contract the Cache depends on. One implementation per debrid
/// provider; everything above this trait is provider-agnostic.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Only torrents in the `downloaded` state, paginated until the provider
    /// returns an empty page.
    async fn list_torrents(&self) -> Result<Vec<Torrent>, CoreError>;

    async fn get_torrent(&self, id: &str) -> Result<Torrent, CoreError>;

    async fn submit_magnet(&self, submission: &Submission) -> Result<Torrent, CoreError>;

    /// Polls the provider until it reports `downloaded`, auto-selecting
    /// eligible files when `waiting_files_selection`. Mutates `torrent` in
    /// place once complete.
    async fn check_status(&self, torrent: &mut Torrent, is_symlink: bool) -> Result<(), CoreError>;

    async fn check_link(&self, link: &str) -> Result<(), CoreError>;

    async fn get_download_link(
        &self,
        torrent: &Torrent,
        file: &TorrentFile,
    ) -> Result<DownloadLinkInfo, CoreError>;

    /// For download-link cache warm-up and periodic refresh.
    async fn list_downloads(&self) -> Result<Vec<DownloadLinkInfo>, CoreError>;

    async fn delete_torrent(&self, id: &str) -> Result<(), CoreError>;

    async fn delete_download_link(&self, id: &str) -> Result<(), CoreError>;

    async fn disable_account(&self, account_id: &str);

    async fn reset_active_accounts(&self);

    /// Enabled accounts, sorted by id.
    async fn active_accounts(&self) -> Vec<String>;
}
