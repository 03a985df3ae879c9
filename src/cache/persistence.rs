use crate::cache::CachedTorrent;
use crate::error::CoreError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

const MAX_CONCURRENT_WRITERS: usize = 50;

/// Per-torrent JSON files on disk, atomic write via tmp+rename, soft-delete
/// via a trash subdirectory. Grounded on the source system's
/// `Cache.saveTorrent`/`Cache.SaveTorrent` (semaphore-gated async save,
/// overflow writers run synchronously in the caller).
pub struct PersistenceStore {
    dir: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl PersistenceStore {
    pub fn new(dir: PathBuf) -> Self {
        PersistenceStore {
            dir,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_WRITERS)),
        }
    }

    /// Saves a torrent. If a writer slot is free, the write happens on a
    /// spawned task (fire-and-forget, logged on failure); otherwise it runs
    /// synchronously in the calling task so persistence latency stays
    /// bounded instead of building an unbounded backlog.
    pub async fn save(&self, torrent: &CachedTorrent) -> Result<(), CoreError> {
        let data = serde_json::to_vec_pretty(torrent).map_err(|e| CoreError::Other(e.into()))?;
        let id = torrent.torrent.id.clone();

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let dir = self.dir.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = write_atomic(&dir, &id, &data).await {
                        tracing::warn!("failed to persist torrent {}: {}", id, e);
                    }
                });
                Ok(())
            }
            Err(_) => write_atomic(&self.dir, &id, &data).await.map_err(CoreError::from),
        }
    }

    /// Soft-deletes by renaming into `trash/`. Never hard-unlinks, so a
    /// mistaken removal can be manually recovered.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let src = self.dir.join(format!("{id}.json"));
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Ok(());
        }

        let trash_dir = self.dir.join("trash");
        tokio::fs::create_dir_all(&trash_dir).await?;
        let dst = trash_dir.join(format!("{id}.json"));
        tokio::fs::rename(&src, &dst).await?;
        Ok(())
    }

    /// Loads every persisted torrent, dropping any whose file map contains
    /// an empty `link` (treated as incomplete). Runs with bounded
    /// concurrency via the save semaphore's capacity as the worker count.
    pub async fn load_all(&self, workers: usize) -> Result<Vec<CachedTorrent>, CoreError> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                load_one(&path).await
            }));
        }

        let mut out = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(Some(torrent))) => out.push(torrent),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!("failed to load cached torrent: {}", e),
                Err(e) => tracing::warn!("load task panicked: {}", e),
            }
        }

        Ok(out)
    }
}

async fn load_one(path: &Path) -> anyhow::Result<Option<CachedTorrent>> {
    let data = tokio::fs::read(path).await?;
    let torrent: CachedTorrent = serde_json::from_slice(&data)?;
    if torrent.torrent.files.values().any(|f| f.link.is_empty()) {
        return Ok(None);
    }
    Ok(Some(torrent))
}

async fn write_atomic(dir: &Path, id: &str, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = dir.join(format!("{id}.json.tmp.{nanos}"));
    let final_path = dir.join(format!("{id}.json"));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Torrent;
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample(id: &str) -> CachedTorrent {
        CachedTorrent {
            torrent: Torrent {
                id: id.to_string(),
                info_hash: "abc".to_string(),
                name: "Show".to_string(),
                original_name: "Show".to_string(),
                filename: "Show".to_string(),
                size: 10,
                added_at: Utc::now(),
                status: "downloaded".to_string(),
                files: {
                    let mut m = HashMap::new();
                    m.insert(
                        "ep01.mkv".to_string(),
                        crate::provider::TorrentFile {
                            id: "f1".to_string(),
                            torrent_id: id.to_string(),
                            name: "ep01.mkv".to_string(),
                            path: "ep01.mkv".to_string(),
                            size: 10,
                            link: "https://example/x".to_string(),
                            download_link: None,
                        },
                    );
                    m
                },
            },
            added_on: Utc::now(),
            is_complete: true,
            duplicate_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(tmp.path().to_path_buf());

        // force the synchronous path so the write is visible immediately.
        for _ in 0..MAX_CONCURRENT_WRITERS {
            let _ = store.semaphore.try_acquire();
        }
        store.save(&sample("t1")).await.unwrap();

        let loaded = store.load_all(4).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].torrent.id, "t1");
    }

    #[tokio::test]
    async fn delete_moves_to_trash_not_unlink() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(tmp.path().to_path_buf());
        for _ in 0..MAX_CONCURRENT_WRITERS {
            let _ = store.semaphore.try_acquire();
        }
        store.save(&sample("t2")).await.unwrap();

        store.delete("t2").await.unwrap();

        assert!(!tmp.path().join("t2.json").exists());
        assert!(tmp.path().join("trash").join("t2.json").exists());
    }
}
