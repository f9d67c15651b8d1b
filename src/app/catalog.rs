//! Catalog collaborator
//!
//! The pipeline reads catalog items and writes back the directory each
//! processed item was downloaded into. Library scraping lives elsewhere;
//! [`JsonCatalog`] reads the list it produces from a JSON file.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::app::models::CatalogItem;
use crate::errors::{CatalogError, CatalogResult};

/// Source of catalog items
pub trait Catalog: Send {
    /// Items in catalog order
    fn items(&self) -> &[CatalogItem];

    /// Records where the item at `index` was downloaded
    fn set_local_path(&mut self, index: usize, path: PathBuf);

    /// Persists recorded paths
    fn persist(&self) -> CatalogResult<()> {
        Ok(())
    }
}

impl Catalog for Vec<CatalogItem> {
    fn items(&self) -> &[CatalogItem] {
        self
    }

    fn set_local_path(&mut self, index: usize, path: PathBuf) {
        if let Some(item) = self.get_mut(index) {
            item.local_path = Some(path);
        }
    }
}

/// Catalog backed by a JSON array of items
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
    items: Vec<CatalogItem>,
}

impl JsonCatalog {
    /// Loads a catalog file
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::NotFound` if the file does not exist and
    /// `CatalogError::JsonParse` if it is not a JSON array of items
    pub fn load(path: impl Into<PathBuf>) -> CatalogResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(CatalogError::NotFound { path });
        }
        let content = std::fs::read_to_string(&path)?;
        let items: Vec<CatalogItem> = serde_json::from_str(&content)?;
        info!("Loaded {} catalog items from {}", items.len(), path.display());
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_items(self) -> Vec<CatalogItem> {
        self.items
    }
}

impl Catalog for JsonCatalog {
    fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    fn set_local_path(&mut self, index: usize, path: PathBuf) {
        self.items.set_local_path(index, path);
    }

    fn persist(&self) -> CatalogResult<()> {
        let content = serde_json::to_string_pretty(&self.items)?;
        std::fs::write(&self.path, content)?;
        debug!("Saved catalog to {}", self.path.display());
        Ok(())
    }
}
