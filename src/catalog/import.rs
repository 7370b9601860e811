// Local model import - copies a user-picked file into app storage

use std::path::{Path, PathBuf};

use crate::error::ModelError;
use crate::storage::StorageGuard;

use super::store::ModelCatalog;
use super::types::ModelEntry;

/// Copy `source` into `local_dir` and register it as a Local, downloaded entry.
///
/// The storage check runs before anything is written. A file name that is already
/// taken becomes `<stem>_<n>.<ext>`.
pub async fn import_local(
    catalog: &ModelCatalog,
    guard: &StorageGuard,
    source: &Path,
    local_dir: &Path,
) -> Result<ModelEntry, ModelError> {
    let metadata = tokio::fs::metadata(source)
        .await
        .map_err(|_| ModelError::ArtifactMissing(source.display().to_string()))?;
    if !metadata.is_file() {
        return Err(ModelError::ArtifactMissing(source.display().to_string()));
    }
    let size = metadata.len();

    guard.ensure_space(size)?;

    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ModelError::Io(format!("Not a file name: {:?}", source)))?;

    tokio::fs::create_dir_all(local_dir).await?;
    let dest = unique_destination(catalog, local_dir, &filename).await;

    log::info!("Importing local model {:?} -> {:?}", source, dest);
    if let Err(e) = tokio::fs::copy(source, &dest).await {
        let _ = tokio::fs::remove_file(&dest).await;
        log::error!("Import of {:?} failed: {}", source, e);
        return Err(e.into());
    }

    let entry = ModelEntry::local(dest.clone(), size);
    if let Err(e) = catalog.add(entry.clone()).await {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(e);
    }

    Ok(entry)
}

/// First free `<stem>_<n>.<ext>` in `dir`, also avoiding ids already in the catalog
async fn unique_destination(catalog: &ModelCatalog, dir: &Path, filename: &str) -> PathBuf {
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (filename.to_string(), None),
    };

    let mut candidate = filename.to_string();
    let mut n = 1;
    loop {
        let path = dir.join(&candidate);
        let taken = path.exists() || catalog.contains(&format!("local/{}", candidate)).await;
        if !taken {
            return path;
        }
        candidate = match &ext {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        n += 1;
    }
}
