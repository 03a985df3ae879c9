use crate::cache::CachedTorrent;
use crate::config::DirectoryConfig;
use crate::helpers::duration::{parse_go_duration, parse_size};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub const FOLDER_ALL: &str = "__all__";
pub const FOLDER_TORRENTS: &str = "torrents";
pub const FOLDER_BAD: &str = "__bad__";

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
}

enum CompiledFilter {
    Include(String),
    Exclude(String),
    StartsWith(String),
    NotStartsWith(String),
    EndsWith(String),
    NotEndsWith(String),
    Regex(Regex),
    NotRegex(Regex),
    ExactMatch(String),
    NotExactMatch(String),
    SizeGt(u64),
    SizeLt(u64),
    LastAdded(Duration),
}

impl CompiledFilter {
    fn compile(kind: &str, value: &str) -> anyhow::Result<Self> {
        Ok(match kind {
            "include" => CompiledFilter::Include(value.to_lowercase()),
            "exclude" => CompiledFilter::Exclude(value.to_lowercase()),
            "starts_with" => CompiledFilter::StartsWith(value.to_lowercase()),
            "not_starts_with" => CompiledFilter::NotStartsWith(value.to_lowercase()),
            "ends_with" => CompiledFilter::EndsWith(value.to_lowercase()),
            "not_ends_with" => CompiledFilter::NotEndsWith(value.to_lowercase()),
            "regex" => CompiledFilter::Regex(Regex::new(value)?),
            "not_regex" => CompiledFilter::NotRegex(Regex::new(value)?),
            "exact_match" => CompiledFilter::ExactMatch(value.to_lowercase()),
            "not_exact_match" => CompiledFilter::NotExactMatch(value.to_lowercase()),
            "size_gt" => CompiledFilter::SizeGt(
                parse_size(value).ok_or_else(|| anyhow::anyhow!("invalid size_gt: {value}"))?,
            ),
            "size_lt" => CompiledFilter::SizeLt(
                parse_size(value).ok_or_else(|| anyhow::anyhow!("invalid size_lt: {value}"))?,
            ),
            "last_added" => CompiledFilter::LastAdded(
                parse_go_duration(value)
                    .ok_or_else(|| anyhow::anyhow!("invalid last_added: {value}"))?,
            ),
            other => anyhow::bail!("unknown directory filter kind: {other}"),
        })
    }

    fn matches(&self, name_lower: &str, size: u64, added_on: DateTime<Utc>) -> bool {
        match self {
            CompiledFilter::Include(s) => name_lower.contains(s.as_str()),
            CompiledFilter::Exclude(s) => !name_lower.contains(s.as_str()),
            CompiledFilter::StartsWith(s) => name_lower.starts_with(s.as_str()),
            CompiledFilter::NotStartsWith(s) => !name_lower.starts_with(s.as_str()),
            CompiledFilter::EndsWith(s) => name_lower.ends_with(s.as_str()),
            CompiledFilter::NotEndsWith(s) => !name_lower.ends_with(s.as_str()),
            CompiledFilter::Regex(r) => r.is_match(name_lower),
            CompiledFilter::NotRegex(r) => !r.is_match(name_lower),
            CompiledFilter::ExactMatch(s) => name_lower == s.as_str(),
            CompiledFilter::NotExactMatch(s) => name_lower != s.as_str(),
            CompiledFilter::SizeGt(min) => size > *min,
            CompiledFilter::SizeLt(max) => size < *max,
            CompiledFilter::LastAdded(d) => {
                added_on >= Utc::now() - chrono::Duration::from_std(*d).unwrap_or_default()
            }
        }
    }
}

struct CompiledFolder {
    name: String,
    filters: Vec<CompiledFilter>,
}

/// The dual-keyed in-memory index: by id and by display folder name, with a
/// debounced, atomically-published sorted listing. Grounded on the source
/// system's `torrentCache` (id→name / name→*CachedTorrent maps, a
/// `sortNeeded` flag, and an atomically swapped listing snapshot).
pub struct TorrentIndex {
    by_id: Mutex<HashMap<String, String>>,
    by_name: Mutex<HashMap<String, Arc<CachedTorrent>>>,
    sort_needed: AtomicBool,
    listing: RwLock<Arc<Vec<FileInfo>>>,
    folder_listings: Mutex<HashMap<String, Arc<Vec<FileInfo>>>>,
    folders: Vec<CompiledFolder>,
    debounce_generation: Arc<AtomicU64>,
}

impl TorrentIndex {
    pub fn new(directories: &HashMap<String, DirectoryConfig>) -> anyhow::Result<Self> {
        let mut folders = Vec::new();
        for (name, cfg) in directories {
            let mut filters = Vec::new();
            for (kind, value) in &cfg.filters {
                filters.push(CompiledFilter::compile(kind, value)?);
            }
            folders.push(CompiledFolder {
                name: name.clone(),
                filters,
            });
        }

        Ok(TorrentIndex {
            by_id: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            sort_needed: AtomicBool::new(false),
            listing: RwLock::new(Arc::new(Vec::new())),
            folder_listings: Mutex::new(HashMap::new()),
            folders,
            debounce_generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn custom_folder_names(&self) -> Vec<String> {
        self.folders.iter().map(|f| f.name.clone()).collect()
    }

    /// Monotonic counter bumped on every scheduled rebuild. Used by the
    /// WebDAV adapter's rendered-PROPFIND cache to invalidate entries after a
    /// structural change instead of tracking per-path dirty bits.
    pub fn generation(&self) -> u64 {
        self.debounce_generation.load(Ordering::SeqCst)
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<CachedTorrent>> {
        let name = self.by_id.lock().unwrap().get(id).cloned()?;
        self.by_name.lock().unwrap().get(&name).cloned()
    }

    pub fn get_name_for_id(&self, id: &str) -> Option<String> {
        self.by_id.lock().unwrap().get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<CachedTorrent>> {
        self.by_name.lock().unwrap().get(name).cloned()
    }

    pub fn set(&self, id: &str, name: &str, torrent: Arc<CachedTorrent>) {
        let mut by_id = self.by_id.lock().unwrap();
        let mut by_name = self.by_name.lock().unwrap();
        by_id.insert(id.to_string(), name.to_string());
        by_name.insert(name.to_string(), torrent);
        self.sort_needed.store(true, Ordering::SeqCst);
    }

    pub fn remove_by_id(&self, id: &str) {
        self.by_id.lock().unwrap().remove(id);
        self.sort_needed.store(true, Ordering::SeqCst);
    }

    pub fn remove_by_name(&self, name: &str) {
        self.by_name.lock().unwrap().remove(name);
        self.sort_needed.store(true, Ordering::SeqCst);
    }

    pub fn all(&self) -> HashMap<String, Arc<CachedTorrent>> {
        self.by_name.lock().unwrap().clone()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.by_id.lock().unwrap().keys().cloned().collect()
    }

    pub fn id_maps(&self) -> HashMap<String, String> {
        self.by_id.lock().unwrap().clone()
    }

    /// Returns the last-sorted snapshot if no mutation is pending, otherwise
    /// rebuilds synchronously so the caller never observes a partial listing.
    pub fn listing(&self) -> Arc<Vec<FileInfo>> {
        if !self.sort_needed.load(Ordering::SeqCst) {
            return self.listing.read().unwrap().clone();
        }
        self.refresh_listing()
    }

    pub fn refresh_listing(&self) -> Arc<Vec<FileInfo>> {
        let entries = self.by_name.lock().unwrap();
        let mut names: Vec<(&String, &Arc<CachedTorrent>)> = entries.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0).then(a.1.added_on.cmp(&b.1.added_on)));

        let files: Vec<FileInfo> = names
            .into_iter()
            .map(|(name, torrent)| FileInfo {
                name: name.clone(),
                size: torrent.torrent.size,
                is_dir: true,
                mod_time: torrent.added_on,
            })
            .collect();

        drop(entries);

        let published = Arc::new(files);
        *self.listing.write().unwrap() = published.clone();
        self.sort_needed.store(false, Ordering::SeqCst);
        published
    }

    /// Schedules a debounced background rebuild: coalesces bursts of `set`/
    /// `remove` into at most one rebuild per 250ms window.
    pub fn schedule_debounced_rebuild(self: &Arc<Self>) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let index = self.clone();
        let gen_ref = self.debounce_generation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if gen_ref.load(Ordering::SeqCst) == generation {
                index.refresh_listing();
                index.refresh_folder_listings();
            }
        });
    }

    pub fn folder_listing(&self, folder: &str) -> Arc<Vec<FileInfo>> {
        if folder == FOLDER_ALL || folder == FOLDER_TORRENTS {
            return self.listing();
        }

        self.folder_listings
            .lock()
            .unwrap()
            .get(folder)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    pub fn bad_folder_listing(&self) -> Vec<FileInfo> {
        let by_name = self.by_name.lock().unwrap();
        by_name
            .values()
            .filter(|t| !t.is_complete)
            .map(|t| FileInfo {
                name: format!("{} ({})", t.torrent.name, t.torrent.id),
                size: t.torrent.size,
                is_dir: true,
                mod_time: t.added_on,
            })
            .collect()
    }

    /// Rebuilds every custom folder's listing. Each folder's published
    /// listing is replaced atomically (single lock acquisition per folder);
    /// folders are independent so this can run concurrently with readers of
    /// other folders without contention beyond the map itself.
    pub fn refresh_folder_listings(&self) {
        let by_name = self.by_name.lock().unwrap().clone();

        for folder in &self.folders {
            let mut matched: Vec<(&String, &Arc<CachedTorrent>)> = by_name
                .iter()
                .filter(|(name, torrent)| {
                    let lower = name.to_lowercase();
                    folder
                        .filters
                        .iter()
                        .all(|f| f.matches(&lower, torrent.torrent.size, torrent.added_on))
                })
                .collect();

            matched.sort_by(|a, b| a.0.cmp(b.0));

            let files: Vec<FileInfo> = matched
                .into_iter()
                .map(|(name, torrent)| FileInfo {
                    name: name.clone(),
                    size: torrent.torrent.size,
                    is_dir: true,
                    mod_time: torrent.added_on,
                })
                .collect();

            self.folder_listings
                .lock()
                .unwrap()
                .insert(folder.name.clone(), Arc::new(files));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Torrent;
    use std::collections::HashMap as Map;

    fn cached(id: &str, name: &str, added_on: DateTime<Utc>) -> Arc<CachedTorrent> {
        Arc::new(CachedTorrent {
            torrent: Torrent {
                id: id.to_string(),
                info_hash: format!("hash-{id}"),
                name: name.to_string(),
                original_name: name.to_string(),
                filename: name.to_string(),
                size: 1000,
                added_at: added_on,
                status: "downloaded".to_string(),
                files: Map::new(),
            },
            added_on,
            is_complete: true,
            duplicate_ids: Vec::new(),
        })
    }

    #[test]
    fn by_id_and_by_name_stay_consistent() {
        let index = TorrentIndex::new(&Map::new()).unwrap();
        let now = Utc::now();
        index.set("1", "Show", cached("1", "Show", now));
        index.set("2", "Movie", cached("2", "Movie", now));

        for id in index.all_ids() {
            let name = index.get_name_for_id(&id).unwrap();
            let torrent = index.get_by_name(&name).unwrap();
            assert_eq!(torrent.torrent.id, id);
        }
    }

    #[test]
    fn listing_is_stable_until_next_mutation() {
        let index = TorrentIndex::new(&Map::new()).unwrap();
        index.set("1", "Show", cached("1", "Show", Utc::now()));

        let first = index.listing();
        let second = index.listing();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn listing_rebuilds_after_mutation() {
        let index = TorrentIndex::new(&Map::new()).unwrap();
        index.set("1", "Show", cached("1", "Show", Utc::now()));
        let first = index.listing();

        index.set("2", "Movie", cached("2", "Movie", Utc::now()));
        let second = index.listing();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }
}
