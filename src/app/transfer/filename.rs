//! Filename detection and normalization

use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::constants::files;

/// Keeps only `[A-Za-z0-9 ._-]` and truncates to the filesystem limit
pub fn normalize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .take(files::MAX_FILENAME_LENGTH)
        .collect()
}

/// `filename` label of a Content-Disposition header
pub fn content_disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        (key.trim() == "filename").then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Normalized final path segment of a URL
pub fn url_filename(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = percent_decode(segment);
    normalize_filename(&decoded)
}

/// Decodes `%XX` escapes; `+`, `&` and `=` stay literal
fn percent_decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// `path` with its extension replaced by `ext` (given with the leading dot)
pub fn swap_extension(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext.trim_start_matches('.'))
}

/// In-progress sibling of `path`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(files::PARTIAL_FILE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_and_truncates() {
        assert_eq!(
            normalize_filename("The Book: Part 1 (Unabridged)?.aax"),
            "The Book Part 1 Unabridged.aax"
        );
        assert_eq!(normalize_filename("a/b\\c"), "abc");
        assert_eq!(normalize_filename(&"x".repeat(300)).len(), 255);
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition_filename(r#"attachment; filename="My_Book.aax""#).as_deref(),
            Some("My_Book.aax")
        );
        assert_eq!(
            content_disposition_filename("attachment; filename=plain.aax").as_deref(),
            Some("plain.aax")
        );
        assert_eq!(content_disposition_filename("inline"), None);
    }

    #[test]
    fn test_url_filename() {
        let url = Url::parse("https://cds.audible.com/download/My%20Book.aax?token=abc").unwrap();
        assert_eq!(url_filename(&url), "My Book.aax");
        let root = Url::parse("https://cds.audible.com/").unwrap();
        assert_eq!(url_filename(&root), "");
    }

    #[test]
    fn test_url_filename_keeps_form_characters() {
        let url = Url::parse("https://cds.audible.com/dl/Tom+Jerry%20A%26B%3D1.aax").unwrap();
        assert_eq!(url_filename(&url), "TomJerry AB1.aax");
        assert_eq!(percent_decode("Tom+Jerry&x=1"), "Tom+Jerry&x=1");
        assert_eq!(percent_decode("A%26B%3D%2B"), "A&B=+");
        assert_eq!(percent_decode("bad%zzescape"), "bad%zzescape");
    }

    #[test]
    fn test_swap_extension_and_partial() {
        let path = Path::new("/books/Author/Title/Title.aax");
        assert_eq!(
            swap_extension(path, ".mp4"),
            PathBuf::from("/books/Author/Title/Title.mp4")
        );
        assert_eq!(
            partial_path(path),
            PathBuf::from("/books/Author/Title/Title.aax.part")
        );
    }
}
