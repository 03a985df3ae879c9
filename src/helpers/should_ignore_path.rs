use once_cell::sync::Lazy;
use regex::Regex;

const ALLOWED_EXTS: [&str; 11] = [
    ".mkv", ".mp4", ".avi", ".mov", ".wmv", ".flv", ".webm", ".mpeg", ".mpg", // video files
    ".srt", ".sub", // subtitles
];

static PART_FILTERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^lore$").unwrap(),
        Regex::new(r"^histories(( and| &) lore)?$").unwrap(),
        Regex::new(r"^behind.the.scenes$").unwrap(),
        Regex::new(r"^deleted.and.extended.scenes$").unwrap(),
        Regex::new(r"^deleted.scenes$").unwrap(),
        Regex::new(r"^extras?$").unwrap(),
        Regex::new(r"^featurettes$").unwrap(),
        Regex::new(r"^interviews$").unwrap(),
        Regex::new(r"^scenes$").unwrap(),
        Regex::new(r"^shorts$").unwrap(),
    ]
});

static SAMPLE_FILTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"sample").unwrap());

/// Extension allow-list plus extras/bonus-content filtering shared by every
/// provider's file selection. `allow_samples` mirrors a provider's
/// `add_samples` config flag; when false, any path segment matching "sample"
/// is filtered alongside the fixed extras patterns below.
pub fn should_ignore_path(input: &str, allow_samples: bool) -> bool {
    if !ALLOWED_EXTS.iter().any(|ext| input.to_lowercase().ends_with(ext)) {
        return true;
    }

    let path_parts = input.split('/');
    for path_part in path_parts {
        if path_part.is_empty() {
            continue;
        }

        let path_part = path_part.to_lowercase();
        if !allow_samples && SAMPLE_FILTER.is_match(&path_part) {
            return true;
        }

        if PART_FILTERS.iter().any(|regex| regex.is_match(&path_part)) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ignore_path() {
        assert_eq!(should_ignore_path("torrent/samples/video.mp4", false), true);
        assert_eq!(
            should_ignore_path("trailer park boys/season 1/episode 1.mp4", false),
            false
        );
    }

    #[test]
    fn allow_samples_lets_sample_files_through() {
        assert_eq!(should_ignore_path("Show/SAMPLE/video.mkv", true), false);
        assert_eq!(should_ignore_path("Show/extras/blooper.mkv", true), true);
    }
}
