//! Writing results out and reading saved pages back in.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::models::{PropertyListing, RawPage};

/// Where parsed listings go once a run is done
#[async_trait]
pub trait ListingExporter: Send + Sync {
    async fn export(&self, listings: &[PropertyListing], path: &Path) -> Result<()>;
}

/// Pretty-printed JSON array
pub struct JsonExporter;

#[async_trait]
impl ListingExporter for JsonExporter {
    async fn export(&self, listings: &[PropertyListing], path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(listings)?;
        tokio::fs::write(path, json).await?;
        info!("💾 Saved {} listings to {}", listings.len(), path.display());
        Ok(())
    }
}

pub fn page_file_name(index: usize) -> String {
    format!("page_{index:03}.html")
}

/// Save each page as `page_NNN.html` under `dir`.
pub async fn save_pages(pages: &[RawPage], dir: &Path) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::with_capacity(pages.len());
    for page in pages {
        let path = dir.join(page_file_name(page.index));
        tokio::fs::write(&path, &page.html).await?;
        written.push(path);
    }
    info!("💾 Saved {} pages to {}", written.len(), dir.display());
    Ok(written)
}

/// Every `*.html` file in `dir`, ordered by file name and numbered from 1.
pub async fn load_pages(dir: &Path) -> Result<Vec<RawPage>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("html") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pages = Vec::with_capacity(paths.len());
    for (i, path) in paths.into_iter().enumerate() {
        let html = tokio::fs::read_to_string(&path).await?;
        pages.push(RawPage::new(i + 1, path.display().to_string(), html));
    }
    Ok(pages)
}
