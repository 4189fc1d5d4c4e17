//! Separator normalization for paths and URLs crossing the crate boundary.
//!
//! Only the URL generator and the CLI use these; the cache itself works on
//! canonical `Path`s.

/// Use forward slashes and collapse `//` and `/./` runs.
///
/// A leading URL scheme (`https://`, `file://`) is kept intact.
pub fn normalize_file(path: &str) -> String {
    let path = path.replace('\\', "/");
    let (scheme, rest) = split_scheme(&path);

    let mut rest = rest.to_string();
    loop {
        let collapsed = rest.replace("/./", "/").replace("//", "/");
        if collapsed == rest {
            break;
        }
        rest = collapsed;
    }
    format!("{scheme}{rest}")
}

/// [`normalize_file`] plus exactly one trailing slash.
pub fn normalize_directory(path: &str) -> String {
    let normalized = normalize_file(path);
    format!("{}/", normalized.trim_end_matches('/'))
}

fn split_scheme(path: &str) -> (&str, &str) {
    let Some(idx) = path.find("://") else {
        return ("", path);
    };
    let scheme = &path[..idx];
    let valid = !scheme.is_empty()
        && scheme
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'+' | b'.' | b'-'));
    if valid {
        path.split_at(idx + 3)
    } else {
        ("", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_duplicate_and_dot_segments() {
        assert_eq!(normalize_file("/srv//files/./photos"), "/srv/files/photos");
        assert_eq!(normalize_file("/srv/././//files"), "/srv/files");
        assert_eq!(normalize_file("a/b"), "a/b");
    }

    #[test]
    fn converts_backslashes() {
        assert_eq!(normalize_file(r"C:\data\\photos\"), "C:/data/photos/");
    }

    #[test]
    fn keeps_scheme() {
        assert_eq!(
            normalize_file("https://files.example.org//archives/./a.tar.zst"),
            "https://files.example.org/archives/a.tar.zst"
        );
        assert_eq!(normalize_file("file:///srv//x"), "file:///srv/x");
        // Not a scheme: uppercase and empty prefixes collapse like any path.
        assert_eq!(normalize_file("HTTP://x//y"), "HTTP:/x/y");
        assert_eq!(normalize_file("://x"), ":/x");
    }

    #[test]
    fn directories_end_in_one_slash() {
        assert_eq!(normalize_directory("/srv/files"), "/srv/files/");
        assert_eq!(normalize_directory("/srv/files///"), "/srv/files/");
        assert_eq!(normalize_directory("/"), "/");
        assert_eq!(normalize_directory("https://h/a"), "https://h/a/");
    }
}
