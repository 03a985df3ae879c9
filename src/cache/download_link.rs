use crate::cache::{Cache, LinkEntry, Pending, RepairKind, RepairRequest};
use crate::error::CoreError;
use crate::provider::{DownloadLinkInfo, TorrentFile};
use chrono::Utc;
use std::sync::Arc;

impl Cache {
    /// Resolves a torrent file's restricted `link` to a usable download URL,
    /// serving from cache when unexpired and single-flighting concurrent
    /// requests for the same file (spec §4.4).
    pub async fn get_download_link(self: &Arc<Self>, torrent_id: &str, file: &TorrentFile) -> Result<String, CoreError> {
        if let Some(cached) = self.cached_link(&file.link) {
            return Ok(cached);
        }

        let pending = {
            let mut in_flight = self.in_flight_links.lock().unwrap();
            if let Some(existing) = in_flight.get(&file.link) {
                existing.clone()
            } else {
                let slot = Arc::new(Pending::new());
                in_flight.insert(file.link.clone(), slot.clone());
                slot
            }
        };

        // The thread that inserted the slot resolves it; everyone else waits.
        let is_leader = {
            let in_flight = self.in_flight_links.lock().unwrap();
            matches!(in_flight.get(&file.link), Some(slot) if Arc::ptr_eq(slot, &pending))
        };

        if !is_leader {
            let result = pending.wait().await;
            return (*result).clone();
        }

        let resolved = self.resolve_download_link(torrent_id, file).await;

        {
            let mut in_flight = self.in_flight_links.lock().unwrap();
            in_flight.remove(&file.link);
        }
        pending.complete(resolved.clone());

        resolved
    }

    fn cached_link(&self, link: &str) -> Option<String> {
        let links = self.links.lock().unwrap();
        let entry = links.get(link)?;
        if entry.expires_at > Utc::now() && !self.invalid.lock().unwrap().contains_key(&entry.resolved) {
            Some(entry.resolved.clone())
        } else {
            None
        }
    }

    fn cached_resolved(&self, link: &str) -> Option<String> {
        self.links.lock().unwrap().get(link).map(|e| e.resolved.clone())
    }

    async fn resolve_download_link(self: &Arc<Self>, torrent_id: &str, file: &TorrentFile) -> Result<String, CoreError> {
        let Some(torrent) = self.get_torrent(torrent_id) else {
            return Err(CoreError::TorrentNotFound(torrent_id.to_string()));
        };

        loop {
            match self.provider.get_download_link(&torrent.torrent, file).await {
                Ok(info) => {
                    self.store_link(&info);
                    return Ok(info.download_link);
                }
                Err(CoreError::HosterUnavailable) => {
                    let stale = self.cached_resolved(&file.link).unwrap_or_default();
                    self.mark_invalid(&file.link, &stale, "hoster_unavailable").await;
                    let _ = self
                        .repair_tx
                        .send(RepairRequest {
                            kind: RepairKind::Reinsert,
                            torrent_id: torrent_id.to_string(),
                        })
                        .await;
                    return Err(CoreError::HosterUnavailable);
                }
                Err(CoreError::TrafficExceeded) => {
                    let stale = self.cached_resolved(&file.link).unwrap_or_default();
                    self.mark_invalid(&file.link, &stale, "bandwidth_exceeded").await;

                    if self.provider.active_accounts().await.is_empty() {
                        return Err(CoreError::TrafficExceeded);
                    }
                    // An account was just disabled; try again on whatever's left.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn store_link(&self, info: &DownloadLinkInfo) {
        let mut links = self.links.lock().unwrap();
        links.insert(
            info.link.clone(),
            LinkEntry {
                id: info.id.clone(),
                resolved: info.download_link.clone(),
                account_id: info.account_id.clone(),
                expires_at: info.generated_at
                    + chrono::Duration::from_std(self.auto_expire_links_after).unwrap_or_default(),
            },
        );
    }

    /// Removes `link`'s cache entry and marks `resolved_url` as bad so no
    /// other caller serves it again until the next daily reset. When the
    /// failure is account-specific (`bandwidth_exceeded`) the account behind
    /// the removed entry is disabled too; the remote link is best-effort
    /// deleted from the provider either way.
    pub(crate) async fn mark_invalid(&self, link: &str, resolved_url: &str, reason: &str) {
        let entry = self.links.lock().unwrap().remove(link);

        if !resolved_url.is_empty() {
            self.invalid.lock().unwrap().insert(resolved_url.to_string(), reason.to_string());
        }

        if let Some(entry) = entry {
            if reason == "bandwidth_exceeded" {
                self.provider.disable_account(&entry.account_id).await;
            }
            let _ = self.provider.delete_download_link(&entry.id).await;
        }
    }

    /// Clears the invalid-link and failed-to-reinsert sets. Paired with the
    /// provider's own account reset in the daily scheduler job, mirroring
    /// `resetInvalidLinks`.
    pub fn reset_invalid_links(&self) {
        self.invalid.lock().unwrap().clear();
        self.failed_to_reinsert.lock().unwrap().clear();
    }

    /// Warm-up and periodic refresh job: pulls the provider's current
    /// download list and republishes whichever links are still live,
    /// dropping any this cache no longer recognizes as invalid.
    pub async fn refresh_download_links(self: &Arc<Self>) -> Result<(), CoreError> {
        let downloads = self.provider.list_downloads().await?;
        let now = Utc::now();
        let mut links = self.links.lock().unwrap();
        for info in downloads {
            links.insert(
                info.link.clone(),
                LinkEntry {
                    id: info.id,
                    resolved: info.download_link,
                    account_id: info.account_id,
                    expires_at: info.generated_at
                        + chrono::Duration::from_std(self.auto_expire_links_after).unwrap_or_default(),
                },
            );
        }
        links.retain(|_, entry| entry.expires_at > now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FolderNaming, ProviderConfig, ProviderKind};
    use crate::provider::{Provider, Submission, Torrent};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProvider {
        disabled: Mutex<Vec<String>>,
        deleted_links: Mutex<Vec<String>>,
        disable_called: AtomicBool,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        async fn list_torrents(&self) -> Result<Vec<Torrent>, CoreError> {
            Ok(Vec::new())
        }
        async fn get_torrent(&self, id: &str) -> Result<Torrent, CoreError> {
            Err(CoreError::TorrentNotFound(id.to_string()))
        }
        async fn submit_magnet(&self, _submission: &Submission) -> Result<Torrent, CoreError> {
            unimplemented!()
        }
        async fn check_status(&self, _torrent: &mut Torrent, _is_symlink: bool) -> Result<(), CoreError> {
            Ok(())
        }
        async fn check_link(&self, _link: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn get_download_link(&self, _torrent: &Torrent, _file: &TorrentFile) -> Result<DownloadLinkInfo, CoreError> {
            unimplemented!()
        }
        async fn list_downloads(&self) -> Result<Vec<DownloadLinkInfo>, CoreError> {
            Ok(Vec::new())
        }
        async fn delete_torrent(&self, _id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn delete_download_link(&self, id: &str) -> Result<(), CoreError> {
            self.deleted_links.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn disable_account(&self, account_id: &str) {
            self.disable_called.store(true, Ordering::SeqCst);
            self.disabled.lock().unwrap().push(account_id.to_string());
        }
        async fn reset_active_accounts(&self) {}
        async fn active_accounts(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn test_cache() -> (Arc<Cache>, Arc<FakeProvider>) {
        let cfg = ProviderConfig {
            name: ProviderKind::Realdebrid,
            host: None,
            api_key: "key".to_string(),
            download_api_keys: Vec::new(),
            folder: "rd".to_string(),
            categories: Vec::new(),
            rate_limit: 10,
            proxy: None,
            workers: 1,
            check_cached: false,
            add_samples: false,
            download_uncached: false,
            torrents_refresh_interval: "1h".to_string(),
            download_links_refresh_interval: "1h".to_string(),
            auto_expire_links_after: "48h".to_string(),
            folder_naming: FolderNaming::default(),
            directories: HashMap::new(),
            rc_url: None,
            rc_user: None,
            rc_pass: None,
            stream_with_rclone: false,
            max_torrent_size: None,
        };
        let provider = Arc::new(FakeProvider::default());
        let cache = Cache::new(&cfg, provider.clone(), std::env::temp_dir().join("download-link-tests"))
            .expect("cache constructs");
        (cache, provider)
    }

    fn entry(resolved: &str, account_id: &str) -> LinkEntry {
        LinkEntry {
            id: "link-id".to_string(),
            resolved: resolved.to_string(),
            account_id: account_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn cached_link_is_rejected_once_its_resolved_url_is_invalid() {
        let (cache, _provider) = test_cache();
        cache.links.lock().unwrap().insert("restricted".to_string(), entry("https://host/file", "0"));

        assert_eq!(cache.cached_link("restricted"), Some("https://host/file".to_string()));

        cache.invalid.lock().unwrap().insert("https://host/file".to_string(), "bandwidth_exceeded".to_string());
        assert_eq!(cache.cached_link("restricted"), None);
    }

    #[tokio::test]
    async fn mark_invalid_disables_the_account_only_for_bandwidth_exceeded() {
        let (cache, provider) = test_cache();
        cache.links.lock().unwrap().insert("restricted".to_string(), entry("https://host/file", "acct-1"));

        cache.mark_invalid("restricted", "https://host/file", "bandwidth_exceeded").await;

        assert!(cache.links.lock().unwrap().get("restricted").is_none());
        assert!(cache.invalid.lock().unwrap().contains_key("https://host/file"));
        assert!(provider.disable_called.load(Ordering::SeqCst));
        assert_eq!(provider.disabled.lock().unwrap().as_slice(), ["acct-1"]);
        assert_eq!(provider.deleted_links.lock().unwrap().as_slice(), ["link-id"]);
    }

    #[tokio::test]
    async fn mark_invalid_does_not_disable_account_for_other_reasons() {
        let (cache, provider) = test_cache();
        cache.links.lock().unwrap().insert("restricted".to_string(), entry("https://host/file", "acct-1"));

        cache.mark_invalid("restricted", "https://host/file", "hoster_unavailable").await;

        assert!(cache.links.lock().unwrap().get("restricted").is_none());
        assert!(cache.invalid.lock().unwrap().contains_key("https://host/file"));
        assert!(!provider.disable_called.load(Ordering::SeqCst));
    }
}
