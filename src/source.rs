use anyhow::{Context, Result, bail};
use std::path::Path;
use walkdir::WalkDir;

use crate::types::{ImagePayload, WorkItem};

/// Walks `root` recursively and returns every supported image, sorted by
/// identity. Entries that cannot be read are logged and skipped.
#[tracing::instrument(skip_all, fields(root = %root.display()))]
pub fn discover(root: &Path) -> Result<Vec<WorkItem>> {
    if !root.is_dir() {
        bail!("target directory {} does not exist", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", root.display()))?;

    let mut items = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping unreadable directory entry");
                continue;
            }
        };
        let file_type = entry.file_type();
        // Symlinks are not followed while walking, but links to files count.
        let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
        if !is_file || mime_type(entry.path()).is_none() {
            continue;
        }
        let Some(item) = WorkItem::new(entry.path().to_path_buf()) else {
            tracing::warn!(path = %entry.path().display(), "Skipping image with a non-UTF-8 path");
            continue;
        };
        items.push(item);
    }

    items.sort();
    items.dedup_by(|a, b| a.identity == b.identity);
    tracing::info!(count = items.len(), "Discovered images");
    Ok(items)
}

/// MIME type for a supported image path, matched case-insensitively.
pub fn mime_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub async fn read_image(item: &WorkItem) -> std::io::Result<ImagePayload> {
    let mime_type = mime_type(&item.path).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported image type: {}", item.path.display()),
        )
    })?;
    let bytes = tokio::fs::read(&item.path).await?;
    if bytes.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "image file is empty",
        ));
    }
    Ok(ImagePayload { mime_type, bytes })
}
