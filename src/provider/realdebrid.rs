use crate::config::ProviderConfig;
use crate::error::CoreError;
use crate::helpers::get_user_agent::get_user_agent;
use crate::helpers::should_ignore_path::should_ignore_path;
use crate::provider::{DownloadLinkInfo, Provider, Submission, Torrent, TorrentFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratelimit::Ratelimiter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_HOST: &str = "https://api.real-debrid.com/rest/1.0";

struct Account {
    id: String,
    key: String,
    disabled: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct RdErrorResponse {
    error: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RdTorrentInfo {
    id: String,
    hash: String,
    filename: String,
    original_filename: Option<String>,
    bytes: u64,
    added: String,
    status: String,
    #[serde(default)]
    files: Vec<RdFile>,
    #[serde(default)]
    links: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RdFile {
    id: u64,
    path: String,
    bytes: u64,
    selected: u8,
}

#[derive(Debug, Deserialize)]
struct RdUnrestrictLink {
    id: String,
    filename: String,
    filesize: u64,
    link: String,
    download: String,
}

/// Real-Debrid provider client. Grounded on the teacher's `Debrid` struct
/// (per-process `reqwest::Client`, `ratelimit::Ratelimiter`, blocking
/// spin-wait before each call) but carries a rotating pool of download
/// account keys instead of a single token.
pub struct RealDebrid {
    provider_name: String,
    host: String,
    client: reqwest::Client,
    limiter: Ratelimiter,
    accounts: Vec<Arc<Account>>,
    current_account: AtomicUsize,
    check_cached: bool,
    add_samples: bool,
    download_uncached: bool,
}

impl RealDebrid {
    pub fn new(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let limiter = Ratelimiter::builder(cfg.rate_limit as u64, Duration::from_secs(1))
            .max_tokens(cfg.rate_limit as u64)
            .initial_available(cfg.rate_limit as u64)
            .build()?;

        let keys = if cfg.download_api_keys.is_empty() {
            vec![cfg.api_key.clone()]
        } else {
            cfg.download_api_keys.clone()
        };

        let accounts = keys
            .into_iter()
            .enumerate()
            .map(|(idx, key)| {
                Arc::new(Account {
                    id: idx.to_string(),
                    key,
                    disabled: AtomicBool::new(false),
                })
            })
            .collect();

        Ok(RealDebrid {
            provider_name: cfg.folder.clone(),
            host: cfg.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            client: reqwest::Client::builder().user_agent(get_user_agent()).build()?,
            limiter,
            accounts,
            current_account: AtomicUsize::new(0),
            check_cached: cfg.check_cached,
            add_samples: cfg.add_samples,
            download_uncached: cfg.download_uncached,
        })
    }

    async fn wait(&self) {
        loop {
            if let Err(sleep) = self.limiter.try_wait() {
                tokio::time::sleep(sleep).await;
                continue;
            }
            break;
        }
    }

    fn active_account(&self) -> Option<Arc<Account>> {
        let start = self.current_account.load(Ordering::SeqCst);
        let n = self.accounts.len();
        for offset in 0..n {
            let idx = (start + offset) % n;
            let acct = &self.accounts[idx];
            if !acct.disabled.load(Ordering::SeqCst) {
                return Some(acct.clone());
            }
        }
        None
    }

    fn map_error_code(code: Option<i64>) -> CoreError {
        match code {
            Some(19) | Some(24) | Some(35) => CoreError::HosterUnavailable,
            Some(23) | Some(34) | Some(36) => CoreError::TrafficExceeded,
            Some(c) => CoreError::ProviderTransient(format!("real-debrid error code {c}")),
            None => CoreError::ProviderTransient("unknown real-debrid error".to_string()),
        }
    }

    fn select_files(&self, files: &[RdFile]) -> Result<Vec<u64>, CoreError> {
        let selected: Vec<u64> = files
            .iter()
            .filter(|f| !should_ignore_path(&f.path, self.add_samples))
            .map(|f| f.id)
            .collect();

        if selected.is_empty() {
            return Err(CoreError::Other(anyhow::anyhow!("no video files found")));
        }

        Ok(selected)
    }

    fn to_torrent(info: RdTorrentInfo) -> Torrent {
        let added_at = DateTime::parse_from_rfc3339(&info.added)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let original_name = info.original_filename.unwrap_or_else(|| info.filename.clone());
        let mut files = HashMap::new();
        for (idx, file) in info.files.iter().filter(|f| f.selected == 1).enumerate() {
            let name = file
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&file.path)
                .to_string();
            let link = info.links.get(idx).cloned().unwrap_or_default();
            files.insert(
                name.clone(),
                TorrentFile {
                    id: file.id.to_string(),
                    torrent_id: info.id.clone(),
                    name,
                    path: file.path.clone(),
                    size: file.bytes,
                    link,
                    download_link: None,
                },
            );
        }

        Torrent {
            id: info.id,
            info_hash: info.hash.to_lowercase(),
            name: info.filename.clone(),
            original_name,
            filename: info.filename,
            size: info.bytes,
            added_at,
            status: info.status,
            files,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder, account: &Account) -> reqwest::RequestBuilder {
        builder.bearer_auth(&account.key)
    }
}

#[async_trait]
impl Provider for RealDebrid {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn list_torrents(&self) -> Result<Vec<Torrent>, CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        let mut out = Vec::new();
        let mut offset = 0u32;
        let page_size = 5000u32;
        loop {
            self.wait().await;
            let url = format!(
                "{}/torrents?limit={}&offset={}",
                self.host, page_size, offset
            );
            let resp: Vec<RdTorrentInfo> = self
                .auth(self.client.get(&url), &account)
                .send()
                .await?
                .json()
                .await?;

            if resp.is_empty() {
                break;
            }

            let page_len = resp.len();
            for info in resp {
                if info.status == "downloaded" {
                    out.push(Self::to_torrent(info));
                }
            }

            if page_len < page_size as usize {
                break;
            }
            offset += page_size;
        }

        Ok(out)
    }

    async fn get_torrent(&self, id: &str) -> Result<Torrent, CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        self.wait().await;
        let url = format!("{}/torrents/info/{}", self.host, id);
        let resp = self.auth(self.client.get(&url), &account).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::TorrentNotFound(id.to_string()));
        }

        let info: RdTorrentInfo = resp.json().await?;
        Ok(Self::to_torrent(info))
    }

    async fn submit_magnet(&self, submission: &Submission) -> Result<Torrent, CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        self.wait().await;
        let id: String = if submission.is_torrent() {
            let Submission::TorrentFile(bytes) = submission else {
                unreachable!()
            };
            let url = format!("{}/torrents/addTorrent", self.host);
            let resp: serde_json::Value = self
                .auth(self.client.put(&url), &account)
                .body(bytes.clone())
                .send()
                .await?
                .json()
                .await?;
            resp["id"].as_str().unwrap_or_default().to_string()
        } else {
            let Submission::Magnet(magnet) = submission else {
                unreachable!()
            };
            let url = format!("{}/torrents/addMagnet", self.host);
            let resp: serde_json::Value = self
                .auth(self.client.post(&url), &account)
                .form(&[("magnet", magnet.as_str())])
                .send()
                .await?
                .json()
                .await?;
            resp["id"].as_str().unwrap_or_default().to_string()
        };

        self.get_torrent(&id).await
    }

    async fn check_status(&self, torrent: &mut Torrent, is_symlink: bool) -> Result<(), CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        loop {
            let current = self.get_torrent(&torrent.id).await?;
            match current.status.as_str() {
                "waiting_files_selection" => {
                    self.wait().await;
                    let url = format!("{}/torrents/info/{}", self.host, torrent.id);
                    let info: RdTorrentInfo =
                        self.auth(self.client.get(&url), &account).send().await?.json().await?;
                    let selected = self.select_files(&info.files)?;
                    let ids = selected
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(",");

                    self.wait().await;
                    let sel_url = format!("{}/torrents/selectFiles/{}", self.host, torrent.id);
                    self.auth(self.client.post(&sel_url), &account)
                        .form(&[("files", ids.as_str())])
                        .send()
                        .await?;
                }
                "downloaded" => {
                    *torrent = current;
                    if !is_symlink {
                        // links are already populated by to_torrent via `links`
                    }
                    return Ok(());
                }
                "downloading" | "magnet_conversion" | "queued" | "compressing" | "uploading" => {
                    if !self.download_uncached {
                        return Err(CoreError::ProviderTransient(
                            "torrent not yet cached".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                other => {
                    return Err(CoreError::ProviderTransient(format!(
                        "unexpected torrent status: {other}"
                    )));
                }
            }
        }
    }

    async fn check_link(&self, link: &str) -> Result<(), CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        self.wait().await;
        let url = format!("{}/unrestrict/check", self.host);
        let resp = self
            .auth(self.client.post(&url), &account)
            .form(&[("link", link)])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::HosterUnavailable);
        }

        Ok(())
    }

    async fn get_download_link(
        &self,
        _torrent: &Torrent,
        file: &TorrentFile,
    ) -> Result<DownloadLinkInfo, CoreError> {
        let max_attempts = self.accounts.len().max(1);
        let mut last_err = CoreError::Other(anyhow::anyhow!("no active accounts"));

        for _ in 0..max_attempts {
            let Some(account) = self.active_account() else {
                return Err(last_err);
            };

            self.wait().await;
            let url = format!("{}/unrestrict/link", self.host);
            let resp = self
                .auth(self.client.post(&url), &account)
                .form(&[("link", file.link.as_str())])
                .send()
                .await?;

            if resp.status().is_success() {
                let body: RdUnrestrictLink = resp.json().await?;
                return Ok(DownloadLinkInfo {
                    id: body.id,
                    link: file.link.clone(),
                    download_link: body.download,
                    size: body.filesize,
                    filename: body.filename,
                    generated_at: Utc::now(),
                    account_id: account.id.clone(),
                });
            }

            let err_body: RdErrorResponse = resp.json().await.unwrap_or(RdErrorResponse {
                error: None,
                error_code: None,
            });
            let mapped = Self::map_error_code(err_body.error_code);

            // Traffic exceeded is per-account: disable it and rotate to the
            // next one rather than backing off on an account that's done.
            if matches!(mapped, CoreError::TrafficExceeded) {
                self.disable_account(&account.id).await;
                last_err = mapped;
                continue;
            }

            return Err(mapped);
        }

        Err(last_err)
    }

    async fn list_downloads(&self) -> Result<Vec<DownloadLinkInfo>, CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        let mut out = Vec::new();
        let mut offset = 0u32;
        let page_size = 2000u32;
        let mut seen_links = std::collections::HashSet::new();
        loop {
            self.wait().await;
            let url = format!(
                "{}/downloads?limit={}&offset={}",
                self.host, page_size, offset
            );
            let resp: Vec<RdUnrestrictLink> =
                self.auth(self.client.get(&url), &account).send().await?.json().await?;

            if resp.is_empty() {
                break;
            }

            let page_len = resp.len();
            for entry in resp {
                if !seen_links.insert(entry.link.clone()) {
                    continue;
                }
                out.push(DownloadLinkInfo {
                    id: entry.id,
                    link: entry.link,
                    download_link: entry.download,
                    size: entry.filesize,
                    filename: entry.filename,
                    generated_at: Utc::now(),
                    account_id: account.id.clone(),
                });
            }

            if page_len < page_size as usize {
                break;
            }
            offset += page_size;
        }

        Ok(out)
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        self.wait().await;
        let url = format!("{}/torrents/delete/{}", self.host, id);
        self.auth(self.client.delete(&url), &account).send().await?;
        Ok(())
    }

    async fn delete_download_link(&self, id: &str) -> Result<(), CoreError> {
        let account = self
            .active_account()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("no active accounts")))?;

        self.wait().await;
        let url = format!("{}/downloads/delete/{}", self.host, id);
        // Best-effort: a failure here is not surfaced to callers.
        let _ = self.auth(self.client.delete(&url), &account).send().await;
        Ok(())
    }

    async fn disable_account(&self, account_id: &str) {
        if let Some(acct) = self.accounts.iter().find(|a| a.id == account_id) {
            acct.disabled.store(true, Ordering::SeqCst);
            tracing::warn!("disabled download account {}", account_id);
        }
    }

    async fn reset_active_accounts(&self) {
        for acct in &self.accounts {
            acct.disabled.store(false, Ordering::SeqCst);
        }
        self.current_account.store(0, Ordering::SeqCst);
    }

    async fn active_accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .accounts
            .iter()
            .filter(|a| !a.disabled.load(Ordering::SeqCst))
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_error_codes() {
        assert!(matches!(
            RealDebrid::map_error_code(Some(19)),
            CoreError::HosterUnavailable
        ));
        assert!(matches!(
            RealDebrid::map_error_code(Some(23)),
            CoreError::TrafficExceeded
        ));
        assert!(matches!(
            RealDebrid::map_error_code(Some(35)),
            CoreError::HosterUnavailable
        ));
        assert!(matches!(
            RealDebrid::map_error_code(Some(36)),
            CoreError::TrafficExceeded
        ));
    }

    #[test]
    fn sample_files_are_filtered_unless_allowed() {
        assert!(should_ignore_path("Show/SAMPLE/video.mkv", false));
        assert!(!should_ignore_path("Show/SAMPLE/video.mkv", true));
        assert!(!should_ignore_path("Show/episode.mkv", false));
    }
}
