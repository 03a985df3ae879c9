use std::time::Duration;

/// Parses a Go-style duration string such as `1h30m`, `250ms`, `48h`. Used
/// both for scheduler intervals (as the last-resort grammar, §4.6) and for
/// directory filter values like `last_added`.
pub fn parse_go_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut chars = input.char_indices().peekable();
    let mut saw_any = false;

    while let Some(&(start, c)) = chars.peek() {
        if !(c.is_ascii_digit() || c == '.') {
            return None;
        }

        let mut end = start;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        let number_str = &input[start..end];
        let number: f64 = number_str.parse().ok()?;

        let unit_start = end;
        let mut unit_end = end;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_alphabetic() || c == 'µ' {
                unit_end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        if unit_start == unit_end {
            return None;
        }

        let unit = &input[unit_start..unit_end];
        let secs = match unit {
            "ns" => number / 1_000_000_000.0,
            "us" | "µs" => number / 1_000_000.0,
            "ms" => number / 1_000.0,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return None,
        };

        total += Duration::from_secs_f64(secs.max(0.0));
        saw_any = true;
    }

    if saw_any { Some(total) } else { None }
}

/// Parses a `%d[KMGT]?B` size string (binary-ish; `1KB == 1024`), as used by
/// the `size_gt`/`size_lt` directory filters and `max_torrent_size`.
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    let lower = input.to_lowercase();
    let (number_part, multiplier) = if let Some(stripped) = lower.strip_suffix("tb") {
        (stripped, 1024u64.pow(4))
    } else if let Some(stripped) = lower.strip_suffix("gb") {
        (stripped, 1024u64.pow(3))
    } else if let Some(stripped) = lower.strip_suffix("mb") {
        (stripped, 1024u64.pow(2))
    } else if let Some(stripped) = lower.strip_suffix("kb") {
        (stripped, 1024)
    } else if let Some(stripped) = lower.strip_suffix('b') {
        (stripped, 1)
    } else {
        (lower.as_str(), 1)
    };

    let number: f64 = number_part.trim().parse().ok()?;
    Some((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_go_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_go_duration("48h"), Some(Duration::from_secs(48 * 3600)));
        assert_eq!(parse_go_duration("250ms"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("daily"), None);
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("1KB"), Some(1024));
        assert_eq!(parse_size("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("512"), Some(512));
    }
}
