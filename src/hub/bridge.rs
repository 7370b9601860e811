//! CatalogBridge - connects remote catalog search results to the local catalog

use std::sync::Arc;

use crate::catalog::{ModelCatalog, ModelEntry, RemoteFileRef};
use crate::error::ModelError;
use crate::storage::StorageGuard;

use super::client::RemoteCatalog;
use super::types::{HfModel, ModelFile, SearchPage, SearchQuery};

const MODEL_EXTENSION: &str = ".gguf";

pub struct CatalogBridge {
    remote: Arc<dyn RemoteCatalog>,
    catalog: Arc<ModelCatalog>,
    guard: Arc<StorageGuard>,
    base_url: String,
}

impl CatalogBridge {
    pub fn new(
        remote: Arc<dyn RemoteCatalog>,
        catalog: Arc<ModelCatalog>,
        guard: Arc<StorageGuard>,
        base_url: &str,
    ) -> Self {
        Self {
            remote,
            catalog,
            guard,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ModelError> {
        let page = self.remote.search(query).await?;
        Ok(self.prepare_page(page))
    }

    /// Continue a search from the token of a previous page
    pub async fn search_next(&self, token: &str) -> Result<SearchPage, ModelError> {
        let page = self.remote.next_page(token).await?;
        Ok(self.prepare_page(page))
    }

    fn prepare_page(&self, page: SearchPage) -> SearchPage {
        SearchPage {
            models: page.models.into_iter().map(|m| self.prepare_model(m)).collect(),
            next_page: page.next_page,
        }
    }

    /// Keep only model artifacts and fill in the links
    fn prepare_model(&self, mut model: HfModel) -> HfModel {
        model.url = format!("{}/{}", self.base_url, model.id);
        model.siblings.retain(|f| is_model_file(&f.rfilename));
        for file in &mut model.siblings {
            file.download_url = RemoteFileRef::huggingface(&self.base_url, &model.id, &file.rfilename).download_url;
        }
        model
    }

    /// Add a Remote, not-downloaded entry for one artifact. Nothing is downloaded.
    pub async fn bookmark(&self, model: &HfModel, file: &ModelFile) -> Result<ModelEntry, ModelError> {
        if !is_model_file(&file.rfilename) {
            return Err(ModelError::NotDownloadable(format!("{}/{}", model.id, file.rfilename)));
        }

        let id = format!("{}/{}", model.id, file.rfilename);
        if self.catalog.contains(&id).await {
            return Err(ModelError::AlreadyExists(id));
        }

        let mut details = (file.size, file.sha256.clone());
        if details.0.is_none() {
            let listing = self.remote.file_details(&model.id).await?;
            if let Some(found) = listing.into_iter().find(|d| d.filename == file.rfilename) {
                details = (Some(found.size), found.sha256.or(details.1));
            }
        }

        let mut remote = RemoteFileRef::huggingface(&self.base_url, &model.id, &file.rfilename);
        remote.sha256 = details.1;
        let entry = ModelEntry::remote(remote, details.0.unwrap_or(0));

        self.catalog.add(entry.clone()).await?;
        log::info!("Bookmarked {}", entry.id);
        Ok(entry)
    }

    pub async fn is_bookmarked(&self, repo_id: &str, filename: &str) -> bool {
        self.catalog.contains(&format!("{}/{}", repo_id, filename)).await
    }

    /// Fill in size, checksum and `fits_in_storage` for every artifact of `model`
    pub async fn enrich(&self, model: HfModel) -> Result<HfModel, ModelError> {
        let mut model = self.prepare_model(model);
        let details = self.remote.file_details(&model.id).await?;

        for file in &mut model.siblings {
            if let Some(found) = details.iter().find(|d| d.filename == file.rfilename) {
                file.size = Some(found.size);
                if found.sha256.is_some() {
                    file.sha256 = found.sha256.clone();
                }
            }
        }

        let sizes: Vec<u64> = model.siblings.iter().map(|f| f.size.unwrap_or(0)).collect();
        let fits = self.guard.check_space_for_files(&sizes);
        for (file, fits) in model.siblings.iter_mut().zip(fits) {
            file.fits_in_storage = file.size.map(|_| fits);
        }

        Ok(model)
    }
}

fn is_model_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(MODEL_EXTENSION)
}
