use crate::cache::{Cache, CachedTorrent, Pending, RepairKind, RepairRequest};
use crate::provider::Submission;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Constructs a magnet URI from an info hash and display name, mirroring the
/// source system's `utils.ConstructMagnet`.
fn construct_magnet(info_hash: &str, name: &str) -> String {
    let base = format!("magnet:?xt=urn:btih:{info_hash}&dn={}", urlencoding::encode(name));
    crate::helpers::add_trackers_to_magnet_uri::add_trackers_to_magnet_uri(&base)
}

impl Cache {
    /// Background consumer of repair requests: reinsert or delete, one at a
    /// time per cache (spec §4.5). Grounded on the source system's
    /// `repairWorker` channel-range loop.
    pub(crate) async fn repair_worker(self: &Arc<Self>, rx: &mut mpsc::Receiver<RepairRequest>) {
        while let Some(req) = rx.recv().await {
            let Some(cached) = self.get_torrent(&req.torrent_id) else {
                tracing::warn!("torrent {} not found in cache, skipping repair", req.torrent_id);
                continue;
            };

            match req.kind {
                RepairKind::Reinsert => {
                    if let Err(e) = self.reinsert_torrent(cached).await {
                        tracing::error!("failed to reinsert torrent {}: {}", req.torrent_id, e);
                    }
                }
                RepairKind::Delete => {
                    if let Err(e) = self.delete_torrent(&req.torrent_id, true).await {
                        tracing::error!("failed to delete torrent {}: {}", req.torrent_id, e);
                    }
                }
            }
        }
    }

    /// Checks whether a torrent's files (or a subset, by name) are still
    /// resolvable, triggering a reinsert when the provider reports the
    /// hoster as gone. Mirrors `IsTorrentBroken`.
    pub async fn is_torrent_broken(self: &Arc<Self>, ct: &Arc<CachedTorrent>, filenames: &[String]) -> bool {
        let files: Vec<_> = if filenames.is_empty() {
            ct.torrent.files.values().cloned().collect()
        } else {
            ct.torrent
                .files
                .iter()
                .filter(|(name, _)| filenames.contains(name))
                .map(|(_, f)| f.clone())
                .collect()
        };

        let mut current = ct.clone();
        if files.iter().any(|f| f.link.is_empty()) {
            match self.get_torrent(&current.torrent.id) {
                Some(refreshed) => current = refreshed,
                None => return true,
            }
        }

        let mut is_broken = false;
        for file in current.torrent.files.values() {
            if file.link.is_empty() {
                is_broken = true;
                break;
            }
            if let Err(e) = self.provider.check_link(&file.link).await {
                if matches!(e, crate::error::CoreError::HosterUnavailable) {
                    is_broken = true;
                    break;
                }
            }
        }

        if is_broken {
            if let Err(e) = self.reinsert_torrent(current).await {
                tracing::error!("failed to reinsert broken torrent {}: {}", ct.torrent.id, e);
                return true;
            }
            return false;
        }

        is_broken
    }

    /// Resubmits a torrent under a fresh magnet, replacing the old id on
    /// success. Single-flighted per old id; a prior permanent failure for
    /// the same id short-circuits further attempts until the daily reset.
    /// Grounded on `reInsertTorrent`.
    pub(crate) async fn reinsert_torrent(self: &Arc<Self>, ct: Arc<CachedTorrent>) -> anyhow::Result<Arc<CachedTorrent>> {
        let old_id = ct.torrent.id.clone();

        if self.failed_to_reinsert.lock().unwrap().contains(&old_id) {
            anyhow::bail!("can't retry re-insert for {old_id}");
        }

        let (leader_slot, follower_slot) = {
            let mut requests = self.repair_requests.lock().unwrap();
            if let Some(existing) = requests.get(&old_id) {
                (None, Some(existing.clone()))
            } else {
                let slot = Arc::new(Pending::new());
                requests.insert(old_id.clone(), slot.clone());
                (Some(slot), None)
            }
        };

        if let Some(pending) = follower_slot {
            let result = pending.wait().await;
            return (*result).clone().map_err(anyhow::Error::from);
        }

        let slot = leader_slot.expect("leader always holds a slot");
        let result = self.do_reinsert(&ct, &old_id).await;

        self.repair_requests.lock().unwrap().remove(&old_id);

        match &result {
            Ok(new_ct) => {
                slot.complete(Ok(new_ct.clone()));
                self.failed_to_reinsert.lock().unwrap().remove(&old_id);
            }
            Err(e) => {
                slot.complete(Err(crate::error::CoreError::Other(anyhow::anyhow!(e.to_string()))));
                self.failed_to_reinsert.lock().unwrap().insert(old_id.clone());
            }
        }

        result
    }

    async fn do_reinsert(self: &Arc<Self>, ct: &Arc<CachedTorrent>, old_id: &str) -> anyhow::Result<Arc<CachedTorrent>> {
        let magnet = construct_magnet(&ct.torrent.info_hash, &ct.torrent.name);
        let mut new_torrent = self.provider.submit_magnet(&Submission::Magnet(magnet)).await?;

        if new_torrent.id.is_empty() {
            anyhow::bail!("failed to submit magnet: empty torrent");
        }

        if let Err(e) = self.provider.check_status(&mut new_torrent, true).await {
            if !new_torrent.id.is_empty() {
                let _ = self.provider.delete_torrent(&new_torrent.id).await;
            }
            return Err(e.into());
        }

        if new_torrent.files.values().any(|f| f.link.is_empty()) {
            if !new_torrent.id.is_empty() {
                let _ = self.provider.delete_torrent(&new_torrent.id).await;
            }
            anyhow::bail!("failed to reinsert torrent: empty link");
        }

        let new_ct = CachedTorrent {
            is_complete: !new_torrent.files.is_empty(),
            added_on: ct.added_on,
            duplicate_ids: Vec::new(),
            torrent: new_torrent,
        };

        self.set_torrent(new_ct.clone(), true).await?;

        if !old_id.is_empty() {
            self.delete_torrent(old_id, true).await?;
        }

        Ok(Arc::new(new_ct))
    }
}
