pub mod propfind;
pub mod server;

use crate::cache::{Cache, CachedTorrent};
use crate::provider::TorrentFile;
use bytes::Bytes;
use dav_server::davpath::DavPath;
use dav_server::fs::{DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream, OpenOptions, ReadDirMeta};
use futures_util::FutureExt;
use std::fmt;
use std::io::SeekFrom;
use std::path::Component;
use std::sync::Arc;
use std::time::SystemTime;

pub const VERSION_FILE: &str = "version.txt";

fn version_bytes() -> &'static [u8] {
    concat!("debridvault ", env!("CARGO_PKG_VERSION"), "\n").as_bytes()
}

#[derive(Debug, Clone)]
struct VaultMetaData {
    len: u64,
    modified: SystemTime,
    is_dir: bool,
}

impl DavMetaData for VaultMetaData {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.modified)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

#[derive(Debug)]
struct VaultDirEntry {
    name: String,
    meta: VaultMetaData,
}

impl DavDirEntry for VaultDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone().into_bytes()
    }

    fn metadata<'a>(&'a self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = self.meta.clone();
        async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) }.boxed()
    }
}

enum Resolved {
    Root,
    VersionFile,
    Folder(String),
    TorrentDir(Arc<CachedTorrent>),
    File(Arc<CachedTorrent>, TorrentFile),
}

/// Read-only `DavFileSystem` over a single provider's `Cache` (spec §4.7).
/// Rooted at `/<urlBase>/webdav/<providerName>`; path resolution below
/// mirrors the source system's `parent/torrentName/fileName` tree exactly,
/// generalized from its Go `os.FileInfo`-shaped nodes to `dav-server`'s
/// `DavMetaData`/`DavDirEntry`/`DavFile` traits.
pub struct VaultFileSystem {
    cache: Arc<Cache>,
    http: reqwest::Client,
}

impl fmt::Debug for VaultFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultFileSystem")
            .field("provider", &self.cache.provider_name)
            .finish()
    }
}

impl VaultFileSystem {
    pub fn new(cache: Arc<Cache>) -> Self {
        VaultFileSystem {
            cache,
            http: reqwest::Client::new(),
        }
    }

    fn segments(path: &DavPath) -> Vec<String> {
        path.as_pathbuf()
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    fn resolve(&self, path: &DavPath) -> Option<Resolved> {
        let segments = Self::segments(path);
        match segments.as_slice() {
            [] => Some(Resolved::Root),
            [first] if first == VERSION_FILE => Some(Resolved::VersionFile),
            [folder] => Some(Resolved::Folder(folder.clone())),
            [_folder, torrent_name] => self.cache.get_torrent_by_name(torrent_name).map(Resolved::TorrentDir),
            [_folder, torrent_name, file_name] => {
                let ct = self.cache.get_torrent_by_name(torrent_name)?;
                let file = ct.torrent.files.get(file_name)?.clone();
                Some(Resolved::File(ct, file))
            }
            _ => None,
        }
    }
}

impl DavFileSystem for VaultFileSystem {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            let meta = match self.resolve(path) {
                Some(Resolved::Root) | Some(Resolved::Folder(_)) => VaultMetaData {
                    len: 0,
                    modified: SystemTime::now(),
                    is_dir: true,
                },
                Some(Resolved::TorrentDir(ct)) => VaultMetaData {
                    len: ct.torrent.size,
                    modified: ct.added_on.into(),
                    is_dir: true,
                },
                Some(Resolved::VersionFile) => VaultMetaData {
                    len: version_bytes().len() as u64,
                    modified: SystemTime::now(),
                    is_dir: false,
                },
                Some(Resolved::File(ct, file)) => VaultMetaData {
                    len: file.size,
                    modified: ct.added_on.into(),
                    is_dir: false,
                },
                None => return Err(FsError::NotFound),
            };
            Ok(Box::new(meta) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath, _meta: ReadDirMeta) -> FsFuture<FsStream<Box<dyn DavDirEntry>>> {
        async move {
            let mut entries: Vec<Box<dyn DavDirEntry>> = match self.resolve(path) {
                Some(Resolved::Root) => {
                    let mut out: Vec<Box<dyn DavDirEntry>> = self
                        .cache
                        .get_directories()
                        .into_iter()
                        .map(|name| {
                            Box::new(VaultDirEntry {
                                name,
                                meta: VaultMetaData {
                                    len: 0,
                                    modified: SystemTime::now(),
                                    is_dir: true,
                                },
                            }) as Box<dyn DavDirEntry>
                        })
                        .collect();
                    out.push(Box::new(VaultDirEntry {
                        name: VERSION_FILE.to_string(),
                        meta: VaultMetaData {
                            len: version_bytes().len() as u64,
                            modified: SystemTime::now(),
                            is_dir: false,
                        },
                    }));
                    out
                }
                Some(Resolved::Folder(folder)) => self
                    .cache
                    .get_listing(&folder)
                    .into_iter()
                    .map(|info| {
                        Box::new(VaultDirEntry {
                            name: info.name,
                            meta: VaultMetaData {
                                len: info.size,
                                modified: info.mod_time.into(),
                                is_dir: info.is_dir,
                            },
                        }) as Box<dyn DavDirEntry>
                    })
                    .collect(),
                Some(Resolved::TorrentDir(ct)) => {
                    let mut files: Vec<&TorrentFile> = ct.torrent.files.values().collect();
                    files.sort_by(|a, b| a.name.cmp(&b.name));
                    files
                        .into_iter()
                        .map(|f| {
                            Box::new(VaultDirEntry {
                                name: f.name.clone(),
                                meta: VaultMetaData {
                                    len: f.size,
                                    modified: ct.added_on.into(),
                                    is_dir: false,
                                },
                            }) as Box<dyn DavDirEntry>
                        })
                        .collect()
                }
                _ => return Err(FsError::NotFound),
            };
            entries.sort_by(|a, b| a.name().cmp(&b.name()));
            Ok(Box::pin(futures_util::stream::iter(entries)) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<Box<dyn DavFile>> {
        async move {
            if options.write {
                return Err(FsError::Forbidden);
            }
            match self.resolve(path) {
                Some(Resolved::VersionFile) => Ok(Box::new(VersionFile { pos: 0 }) as Box<dyn DavFile>),
                Some(Resolved::File(ct, file)) => Ok(Box::new(VaultFile {
                    cache: self.cache.clone(),
                    http: self.http.clone(),
                    torrent_id: ct.torrent.id.clone(),
                    file,
                    pos: 0,
                    resolved: None,
                }) as Box<dyn DavFile>),
                _ => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, _path: &'a DavPath) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn remove_file<'a>(&'a self, _path: &'a DavPath) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    /// DELETE on a torrent folder maps to `Cache::on_remove`; everything else
    /// (root, a custom folder) is `Permission` (spec §4.7).
    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<()> {
        async move {
            match self.resolve(path) {
                Some(Resolved::TorrentDir(ct)) => self
                    .cache
                    .on_remove(&ct.torrent.id)
                    .await
                    .map_err(|_| FsError::GeneralFailure),
                _ => Err(FsError::Forbidden),
            }
        }
        .boxed()
    }

    fn rename<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn copy<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }
}

/// In-memory pseudo-file at the provider root reporting the build version.
#[derive(Debug)]
struct VersionFile {
    pos: u64,
}

impl DavFile for VersionFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            Ok(Box::new(VaultMetaData {
                len: version_bytes().len() as u64,
                modified: SystemTime::now(),
                is_dir: false,
            }) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn write_buf(&mut self, _buf: Box<dyn bytes::Buf + Send>) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        async move {
            let data = version_bytes();
            let start = self.pos as usize;
            if start >= data.len() {
                return Ok(Bytes::new());
            }
            let end = (start + count).min(data.len());
            self.pos = end as u64;
            Ok(Bytes::copy_from_slice(&data[start..end]))
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        async move {
            let len = version_bytes().len() as i64;
            self.pos = match pos {
                SeekFrom::Start(p) => p,
                SeekFrom::End(p) => (len + p).max(0) as u64,
                SeekFrom::Current(p) => (self.pos as i64 + p).max(0) as u64,
            };
            Ok(self.pos)
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<()> {
        async move { Ok(()) }.boxed()
    }
}

/// A torrent file handle. Resolution to a usable URL is deferred until the
/// first read (spec §4.7: "OPEN on a file does not immediately resolve a
/// download URL"), then ranged-fetched from upstream per read.
struct VaultFile {
    cache: Arc<Cache>,
    http: reqwest::Client,
    torrent_id: String,
    file: TorrentFile,
    pos: u64,
    resolved: Option<String>,
}

impl fmt::Debug for VaultFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultFile").field("file", &self.file.name).finish()
    }
}

impl VaultFile {
    async fn resolve_url(&mut self) -> FsResult<String> {
        if let Some(url) = &self.resolved {
            return Ok(url.clone());
        }
        let url = self
            .cache
            .get_download_link(&self.torrent_id, &self.file)
            .await
            .map_err(|_| FsError::GeneralFailure)?;
        self.resolved = Some(url.clone());
        Ok(url)
    }
}

impl DavFile for VaultFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<Box<dyn DavMetaData>> {
        let len = self.file.size;
        async move {
            Ok(Box::new(VaultMetaData {
                len,
                modified: SystemTime::now(),
                is_dir: false,
            }) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn write_buf(&mut self, _buf: Box<dyn bytes::Buf + Send>) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        async move {
            let url = self.resolve_url().await?;
            if count == 0 {
                return Ok(Bytes::new());
            }
            let start = self.pos;
            let end = start + count as u64 - 1;

            let resp = self
                .http
                .get(&url)
                .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|_| FsError::GeneralFailure)?;

            if !resp.status().is_success() {
                return Err(FsError::GeneralFailure);
            }

            let bytes = resp.bytes().await.map_err(|_| FsError::GeneralFailure)?;
            self.pos += bytes.len() as u64;
            Ok(bytes)
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        let size = self.file.size as i64;
        async move {
            self.pos = match pos {
                SeekFrom::Start(p) => p,
                SeekFrom::End(p) => (size + p).max(0) as u64,
                SeekFrom::Current(p) => (self.pos as i64 + p).max(0) as u64,
            };
            Ok(self.pos)
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<()> {
        async move { Ok(()) }.boxed()
    }
}
