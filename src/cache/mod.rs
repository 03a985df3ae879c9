pub mod download_link;
pub mod index;
pub mod merge;
pub mod persistence;
pub mod repair;

use crate::config::ProviderConfig;
use crate::error::CoreError;
use crate::helpers::duration::parse_go_duration;
use crate::provider::{Provider, Submission, Torrent};
use chrono::{DateTime, Utc};
use index::{FileInfo, TorrentIndex, FOLDER_ALL, FOLDER_BAD, FOLDER_TORRENTS};
use persistence::PersistenceStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Torrent + the bookkeeping the cache layers on top (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedTorrent {
    pub torrent: Torrent,
    pub added_on: DateTime<Utc>,
    pub is_complete: bool,
    #[serde(default)]
    pub duplicate_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkEntry {
    pub id: String,
    pub resolved: String,
    pub account_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Generic single-flight slot: the first caller for a key does the work, all
/// others await the same result. Used for both download-link resolution and
/// reinsert (spec §9 notes they share a primitive).
pub(crate) struct Pending<T> {
    notify: Notify,
    result: std::sync::Mutex<Option<Arc<Result<T, CoreError>>>>,
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Pending {
            notify: Notify::new(),
            result: std::sync::Mutex::new(None),
        }
    }

    pub async fn wait(&self) -> Arc<Result<T, CoreError>> {
        loop {
            let notified = self.notify.notified();
            if let Some(r) = self.result.lock().unwrap().clone() {
                return r;
            }
            notified.await;
        }
    }

    pub fn complete(&self, result: Result<T, CoreError>) {
        *self.result.lock().unwrap() = Some(Arc::new(result));
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    Reinsert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub kind: RepairKind,
    pub torrent_id: String,
}

/// One Cache per configured debrid provider. Ties together the Torrent
/// Index, the Persistence Store, the Download-Link Cache, and the
/// Repair/Reinsert Engine. Grounded on the source system's `Cache` struct
/// (`pkg/debrid/debrid/cache.go`), generalized from its Go-specific
/// concurrency primitives to async/Tokio equivalents.
pub struct Cache {
    pub provider_name: String,
    pub provider: Arc<dyn Provider>,
    pub index: Arc<TorrentIndex>,
    persistence: PersistenceStore,

    pub(crate) links: Mutex<HashMap<String, LinkEntry>>,
    pub(crate) invalid: Mutex<HashMap<String, String>>,
    pub(crate) in_flight_links: Mutex<HashMap<String, Arc<Pending<String>>>>,

    pub(crate) repair_requests: Mutex<HashMap<String, Arc<Pending<Arc<CachedTorrent>>>>>,
    pub(crate) failed_to_reinsert: Mutex<HashSet<String>>,
    pub(crate) repair_tx: mpsc::Sender<RepairRequest>,
    repair_rx: Mutex<Option<mpsc::Receiver<RepairRequest>>>,

    pub auto_expire_links_after: std::time::Duration,
    pub folder_naming: crate::config::FolderNaming,
    pub workers: usize,
    pub check_cached: bool,
    pub add_samples: bool,
    pub download_uncached: bool,
    pub stream_with_rclone: bool,
    pub rc_url: Option<String>,
    pub rc_user: Option<String>,
    pub rc_pass: Option<String>,

    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
}

impl Cache {
    pub fn new(
        cfg: &ProviderConfig,
        provider: Arc<dyn Provider>,
        cache_dir: std::path::PathBuf,
    ) -> anyhow::Result<Arc<Self>> {
        let index = Arc::new(TorrentIndex::new(&cfg.directories)?);
        let persistence = PersistenceStore::new(cache_dir);
        let (repair_tx, repair_rx) = mpsc::channel(100);

        let auto_expire_links_after = parse_go_duration(&cfg.auto_expire_links_after)
            .unwrap_or(std::time::Duration::from_secs(48 * 3600));

        Ok(Arc::new(Cache {
            provider_name: cfg.folder.clone(),
            provider,
            index,
            persistence,
            links: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashMap::new()),
            in_flight_links: Mutex::new(HashMap::new()),
            repair_requests: Mutex::new(HashMap::new()),
            failed_to_reinsert: Mutex::new(HashSet::new()),
            repair_tx,
            repair_rx: Mutex::new(Some(repair_rx)),
            auto_expire_links_after,
            folder_naming: cfg.folder_naming,
            workers: cfg.workers,
            check_cached: cfg.check_cached,
            add_samples: cfg.add_samples,
            download_uncached: cfg.download_uncached,
            stream_with_rclone: cfg.stream_with_rclone,
            rc_url: cfg.rc_url.clone(),
            rc_user: cfg.rc_user.clone(),
            rc_pass: cfg.rc_pass.clone(),
            ready: Arc::new(AtomicBool::new(false)),
            ready_notify: Arc::new(Notify::new()),
        }))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            let notified = self.ready_notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    /// Loads persisted torrents, syncs against the provider, then opens the
    /// repair worker. The scheduler (§4.6) starts its periodic jobs
    /// separately so interval parsing stays in one place.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.load().await?;
        self.sync().await?;

        let cache = self.clone();
        let mut rx = self
            .repair_rx
            .lock()
            .unwrap()
            .take()
            .expect("repair worker already started");
        tokio::spawn(async move {
            cache.repair_worker(&mut rx).await;
        });

        self.mark_ready();
        Ok(())
    }

    async fn load(self: &Arc<Self>) -> anyhow::Result<()> {
        let loaded = self.persistence.load_all(self.workers).await?;
        tracing::info!(
            "loaded {} persisted torrents for provider {}",
            loaded.len(),
            self.provider_name
        );

        for torrent in loaded {
            let folder = merge::folder_name(&torrent.torrent, self.folder_naming);
            self.index.set(&torrent.torrent.id, &folder, Arc::new(torrent));
        }

        self.index.refresh_listing();
        self.index.refresh_folder_listings();
        Ok(())
    }

    /// Diffs the persisted+indexed torrent set against the provider's
    /// current list: adopts new torrents, removes vanished ones.
    pub async fn sync(self: &Arc<Self>) -> anyhow::Result<()> {
        let remote = self.provider.list_torrents().await?;
        let remote_ids: HashSet<String> = remote.iter().map(|t| t.id.clone()).collect();

        let local_ids = self.index.all_ids();
        let deleted: Vec<String> = local_ids
            .into_iter()
            .filter(|id| !remote_ids.contains(id))
            .collect();

        for id in deleted {
            if let Err(e) = self.delete_torrent(&id, false).await {
                tracing::warn!("failed to remove vanished torrent {}: {}", id, e);
            }
        }

        let existing_ids: HashSet<String> = self.index.all_ids().into_iter().collect();
        let new_torrents: Vec<Torrent> = remote
            .into_iter()
            .filter(|t| !existing_ids.contains(&t.id))
            .collect();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.workers.max(1)));
        let mut handles = Vec::new();
        for torrent in new_torrents {
            let cache = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                cache.process_torrent(torrent).await
            }));
        }
        for handle in handles {
            if let Ok(Err(e)) = handle.await {
                tracing::warn!("failed to process torrent during sync: {}", e);
            }
        }

        Ok(())
    }

    /// A torrent seen from the provider for the first time: completes it
    /// (selecting files if needed) and admits it to the index if complete.
    async fn process_torrent(self: &Arc<Self>, mut torrent: Torrent) -> anyhow::Result<()> {
        if !torrent.is_complete() {
            self.provider.check_status(&mut torrent, false).await?;
        }

        if torrent.is_complete() {
            let ct = CachedTorrent {
                added_on: torrent.added_at,
                is_complete: true,
                duplicate_ids: Vec::new(),
                torrent,
            };
            self.set_torrent(ct, true).await?;
        }

        Ok(())
    }

    /// Submits a new torrent (qBittorrent facade entry point, spec §10.4).
    pub async fn add_torrent(self: &Arc<Self>, submission: Submission) -> Result<Torrent, CoreError> {
        let mut torrent = self.provider.submit_magnet(&submission).await?;
        self.provider.check_status(&mut torrent, false).await?;

        let result = torrent.clone();
        let ct = CachedTorrent {
            added_on: torrent.added_at,
            is_complete: torrent.is_complete(),
            duplicate_ids: Vec::new(),
            torrent,
        };

        if ct.is_complete {
            self.set_torrent(ct, true).await.map_err(CoreError::from)?;
        }

        Ok(result)
    }

    /// The merge-on-collision upsert (spec §3 invariant 2, §8 property #2).
    /// If a different id already owns `folder(torrent)`, the older (by
    /// `added_on`) torrent stays primary and the file maps are merged by
    /// name, with the newer `added_on` winning ties.
    pub(crate) async fn set_torrent(
        self: &Arc<Self>,
        mut ct: CachedTorrent,
        persist: bool,
    ) -> anyhow::Result<()> {
        let folder = merge::folder_name(&ct.torrent, self.folder_naming);

        if let Some(existing) = self.index.get_by_name(&folder) {
            if existing.torrent.id != ct.torrent.id {
                let (primary, primary_added, secondary, secondary_added) = if existing.added_on <= ct.added_on {
                    (&existing.torrent, existing.added_on, &ct.torrent, ct.added_on)
                } else {
                    (&ct.torrent, ct.added_on, &existing.torrent, existing.added_on)
                };

                let merged_files =
                    merge::merge_files([(primary, primary_added), (secondary, secondary_added)]);

                let mut duplicate_ids = existing.duplicate_ids.clone();
                duplicate_ids.extend(ct.duplicate_ids.clone());
                if ct.torrent.id != primary.id && !duplicate_ids.contains(&ct.torrent.id) {
                    duplicate_ids.push(ct.torrent.id.clone());
                }
                if existing.torrent.id != primary.id && !duplicate_ids.contains(&existing.torrent.id) {
                    duplicate_ids.push(existing.torrent.id.clone());
                }
                duplicate_ids.retain(|id| *id != primary.id);

                let mut primary_torrent = primary.clone();
                primary_torrent.files = merged_files;

                ct = CachedTorrent {
                    is_complete: primary_torrent.is_complete(),
                    added_on: primary_added,
                    duplicate_ids,
                    torrent: primary_torrent,
                };
            }
        }

        let arced = Arc::new(ct);
        self.index.set(&arced.torrent.id, &folder, arced.clone());
        self.schedule_listing_refresh();

        if persist {
            self.persistence.save(&arced).await?;
        }

        Ok(())
    }

    /// Removes `id` from the index. If it was the sole owner of its folder
    /// the folder disappears; if it had been merged with a sibling, the
    /// sibling's files are kept under a reconstructed entry.
    pub(crate) async fn delete_torrent(self: &Arc<Self>, id: &str, remove_from_provider: bool) -> anyhow::Result<()> {
        let Some(name) = self.index.get_name_for_id(id) else {
            return Ok(());
        };
        self.index.remove_by_id(id);

        if remove_from_provider {
            if let Err(e) = self.provider.delete_torrent(id).await {
                tracing::warn!("failed to delete torrent {} from provider: {}", id, e);
            }
        }
        self.persistence.delete(id).await?;

        if let Some(current) = self.index.get_by_name(&name) {
            if current.torrent.id == id {
                let remaining: HashMap<_, _> = current
                    .torrent
                    .files
                    .iter()
                    .filter(|(_, f)| f.torrent_id != id)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                if remaining.is_empty() {
                    self.index.remove_by_name(&name);
                } else {
                    let mut torrent = current.torrent.clone();
                    torrent.files = remaining;
                    let new_primary_id = torrent
                        .files
                        .values()
                        .next()
                        .map(|f| f.torrent_id.clone())
                        .unwrap_or_else(|| torrent.id.clone());
                    torrent.id = new_primary_id;
                    let ct = CachedTorrent {
                        is_complete: torrent.is_complete(),
                        added_on: current.added_on,
                        duplicate_ids: current
                            .duplicate_ids
                            .iter()
                            .filter(|dup| **dup != id)
                            .cloned()
                            .collect(),
                        torrent,
                    };
                    self.set_torrent(ct, true).await?;
                }
            }
        }

        self.schedule_listing_refresh();
        Ok(())
    }

    /// Schedules the debounced listing rebuild and, if rclone VFS
    /// invalidation is configured, a `vfs/forget`+`vfs/refresh` call so
    /// rclone's cache picks up the structural change. Grounded on the source
    /// system's `listingDebouncer`/`refreshRclone`.
    fn schedule_listing_refresh(self: &Arc<Self>) {
        self.index.schedule_debounced_rebuild();
        self.spawn_rclone_refresh();
    }

    fn spawn_rclone_refresh(self: &Arc<Self>) {
        let Some(rc_url) = self.rc_url.clone() else {
            return;
        };
        let rc_user = self.rc_user.clone();
        let rc_pass = self.rc_pass.clone();
        let provider_name = self.provider_name.clone();

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            for endpoint in ["vfs/forget", "vfs/refresh"] {
                let mut req = client
                    .post(format!("{rc_url}/{endpoint}"))
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body("dir=__all__&dir2=torrents");

                if let (Some(user), Some(pass)) = (&rc_user, &rc_pass) {
                    req = req.basic_auth(user, Some(pass));
                }

                match req.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        tracing::trace!("rclone {} failed for {}: {}", endpoint, provider_name, resp.status());
                        return;
                    }
                    Err(e) => {
                        tracing::trace!("rclone {} request failed for {}: {}", endpoint, provider_name, e);
                        return;
                    }
                }
            }
        });
    }

    /// WebDAV DELETE entry point: always removes from the provider too.
    pub async fn on_remove(self: &Arc<Self>, id: &str) -> anyhow::Result<()> {
        self.delete_torrent(id, true).await
    }

    pub fn get_torrent(&self, id: &str) -> Option<Arc<CachedTorrent>> {
        self.index.get_by_id(id)
    }

    pub fn get_torrent_by_name(&self, name: &str) -> Option<Arc<CachedTorrent>> {
        self.index.get_by_name(name)
    }

    pub fn get_listing(&self, folder: &str) -> Vec<FileInfo> {
        match folder {
            FOLDER_ALL | FOLDER_TORRENTS => self.index.listing().as_ref().clone(),
            FOLDER_BAD => self.index.bad_folder_listing(),
            other => self.index.folder_listing(other).as_ref().clone(),
        }
    }

    pub fn get_directories(&self) -> Vec<String> {
        let mut dirs = vec![
            FOLDER_ALL.to_string(),
            FOLDER_TORRENTS.to_string(),
            FOLDER_BAD.to_string(),
        ];
        dirs.extend(self.index.custom_folder_names());
        dirs
    }
}
