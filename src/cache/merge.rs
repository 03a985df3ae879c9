use crate::config::FolderNaming;
use crate::provider::{Torrent, TorrentFile};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Computes the display folder name for a torrent under the configured
/// naming policy (spec §4.2, invariant 1).
pub fn folder_name(torrent: &Torrent, policy: FolderNaming) -> String {
    match policy {
        FolderNaming::Filename => torrent.filename.clone(),
        FolderNaming::Original => torrent.original_name.clone(),
        FolderNaming::FilenameNoExt => strip_ext(&torrent.filename),
        FolderNaming::OriginalNoExt => strip_ext(&torrent.original_name),
        FolderNaming::Id => torrent.id.clone(),
        FolderNaming::Infohash => torrent.info_hash.clone(),
    }
}

fn strip_ext(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

/// Merges the file maps of two or more torrents that collided on display
/// name. Torrents are sorted by `added_on` ascending first, so the **last**
/// write (latest `added_on`) wins on a file name collision — this matches
/// the source system's documented behavior exactly (testable property #2).
pub fn merge_files<'a>(
    torrents: impl IntoIterator<Item = (&'a Torrent, DateTime<Utc>)>,
) -> HashMap<String, TorrentFile> {
    let mut entries: Vec<(&Torrent, DateTime<Utc>)> = torrents.into_iter().collect();
    entries.sort_by_key(|(_, added_on)| *added_on);

    let mut merged = HashMap::new();
    for (torrent, _) in entries {
        for (name, file) in &torrent.files {
            merged.insert(name.clone(), file.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn torrent_with(id: &str, files: Vec<(&str, &str)>) -> Torrent {
        let mut map = HashMap::new();
        for (name, link) in files {
            map.insert(
                name.to_string(),
                TorrentFile {
                    id: format!("{id}-{name}"),
                    torrent_id: id.to_string(),
                    name: name.to_string(),
                    path: name.to_string(),
                    size: 100,
                    link: link.to_string(),
                    download_link: None,
                },
            );
        }

        Torrent {
            id: id.to_string(),
            info_hash: format!("hash-{id}"),
            name: "Show".to_string(),
            original_name: "Show".to_string(),
            filename: "Show".to_string(),
            size: 100,
            added_at: Utc::now(),
            status: "downloaded".to_string(),
            files: map,
        }
    }

    #[test]
    fn later_added_on_wins_on_name_collision() {
        let older = torrent_with("a", vec![("shared.mkv", "old-link"), ("ep01.mkv", "l1")]);
        let newer = torrent_with("b", vec![("shared.mkv", "new-link"), ("ep02.mkv", "l2")]);

        let t_old = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let t_new = Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap();

        let merged = merge_files([(&older, t_old), (&newer, t_new)]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged["shared.mkv"].link, "new-link");
        assert!(merged.contains_key("ep01.mkv"));
        assert!(merged.contains_key("ep02.mkv"));
    }

    #[test]
    fn strips_extension_only_when_present() {
        assert_eq!(strip_ext("Show.S01.mkv"), "Show.S01");
        assert_eq!(strip_ext("Show"), "Show");
        assert_eq!(strip_ext(".hidden"), ".hidden");
    }
}
