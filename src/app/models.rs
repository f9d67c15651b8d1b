//! Data models for Audible Fetcher
//!
//! Catalog items as supplied by the catalog collaborator, the portal regions,
//! and the on-disk layout of a book's directory.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::transfer::normalize_filename;
use crate::constants::files;

/// A title in the account's library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    /// Download URL by link label
    #[serde(default)]
    pub downloads: BTreeMap<String, String>,
    /// Title's page on the portal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
    /// Directory the title was downloaded into, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl CatalogItem {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            narrators: Vec::new(),
            downloads: BTreeMap::new(),
            detail_url: None,
            local_path: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn with_narrator(mut self, narrator: impl Into<String>) -> Self {
        self.narrators.push(narrator.into());
        self
    }

    pub fn with_download(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.downloads.insert(label.into(), url.into());
        self
    }

    /// `<authors>/<title>`, relative to the library root
    pub fn dir(&self) -> PathBuf {
        let authors = self
            .authors
            .iter()
            .map(|name| normalize_filename(name))
            .collect::<Vec<_>>()
            .join(", ");
        let authors = if authors.is_empty() {
            files::UNKNOWN_AUTHOR.to_string()
        } else {
            authors
        };
        Path::new(&authors).join(normalize_filename(&self.title))
    }

    /// Directory the item lives in: its recorded `local_path`, else
    /// `<root>/<authors>/<title>`
    pub fn dest_dir(&self, root: &Path) -> PathBuf {
        match &self.local_path {
            Some(path) => path.clone(),
            None => root.join(self.dir()),
        }
    }

    /// Writes the human-readable info block
    pub fn write_info(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "{}", self.title)?;
        writeln!(w, "Written by: {}", self.authors.join(", "))?;
        writeln!(w, "Narrated by: {}", self.narrators.join(", "))?;
        write!(w, "URL: {}", self.detail_url.as_deref().unwrap_or_default())
    }

    /// Writes `info.txt` into the item's directory
    pub fn write_info_file(&self, root: &Path) -> io::Result<PathBuf> {
        let path = self.dest_dir(root).join(files::INFO_FILE_NAME);
        let mut file = std::fs::File::create(&path)?;
        self.write_info(&mut file)?;
        Ok(path)
    }

    /// Whether the item's directory already holds a decoded file
    pub fn is_downloaded(&self, root: &Path, decoded_ext: &str) -> io::Result<bool> {
        let dir = self.dest_dir(root);
        if !dir.is_dir() {
            return Ok(false);
        }
        let wanted = decoded_ext.trim_start_matches('.');
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == wanted) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// A regional portal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub tld: &'static str,
}

/// Supported regions, in display order
pub const REGIONS: &[Region] = &[
    Region { name: "Australia", tld: "com.au" },
    Region { name: "Canada", tld: "ca" },
    Region { name: "France", tld: "fr" },
    Region { name: "Germany", tld: "de" },
    Region { name: "India", tld: "in" },
    Region { name: "Italy", tld: "it" },
    Region { name: "Japan", tld: "co.jp" },
    Region { name: "United Kingdom", tld: "co.uk" },
    Region { name: "United States", tld: "com" },
];

impl Region {
    /// Finds a region by TLD or case-insensitive name
    pub fn find(key: &str) -> Option<Region> {
        let key = key.trim().trim_start_matches('.');
        REGIONS
            .iter()
            .find(|r| r.tld.eq_ignore_ascii_case(key) || r.name.eq_ignore_ascii_case(key))
            .copied()
    }

    /// Portal root for this region
    pub fn base_url(&self) -> String {
        format!("https://www.audible.{}", self.tld)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.tld)
    }
}
