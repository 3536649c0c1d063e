use crate::config::{CatalogSource, Config};
use crate::error::{AssistantError, ModelError, Result};
use crate::models::catalog::{self, ModelInfo};
use crate::models::download::{
    partial_path, DownloadProgress, DownloadStatus, HttpTransport, ProgressCallback, Transport,
};
use crate::models::sidecar::{self, SidecarMetadata};
use crate::services::local::{LocalModelOptions, LocalModelService};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Handle for a registered progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ActiveDownload {
    progress: DownloadProgress,
    cancel: CancellationToken,
}

/// Manages local models: discovery, catalog merge, downloads, and deletion.
///
/// All state lives behind short-lived mutexes, so a manager can be shared
/// through an `Arc` and drive several downloads of different models at once.
///
/// Progress updates are broadcast: every callback registered by any in-flight
/// [`ModelManager::download_model`] call, plus every [`ModelManager::subscribe`]d
/// listener, sees every update for every model. Filter on
/// [`DownloadProgress::model_id`] if only one model is of interest.
pub struct ModelManager {
    models_dir: PathBuf,
    catalog_source: CatalogSource,
    transport: Arc<dyn Transport>,
    http: reqwest::Client,
    models: Mutex<BTreeMap<String, ModelInfo>>,
    active: Mutex<HashMap<String, ActiveDownload>>,
    callbacks: Mutex<Vec<(SubscriptionId, ProgressCallback)>>,
    next_subscription: AtomicU64,
    ready: AtomicBool,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("models_dir", &self.models_dir)
            .field("catalog_source", &self.catalog_source)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelManager {
    /// Create a manager rooted at `models_dir`, creating the directory if needed
    pub fn new(models_dir: impl Into<PathBuf>, catalog_source: CatalogSource) -> Result<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)?;

        Ok(Self {
            models_dir,
            catalog_source,
            transport: Arc::new(HttpTransport::new()),
            http: reqwest::Client::new(),
            models: Mutex::new(BTreeMap::new()),
            active: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            ready: AtomicBool::new(false),
        })
    }

    /// Create a manager from config (models directory + catalog source)
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.models_dir()?, config.models.catalog.clone())
    }

    /// Replace the transport used for model file transfers
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Whether [`ModelManager::initialize`] has completed successfully
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Discover local models, then load and merge the catalog.
    ///
    /// The manager is ready only once both steps succeed.
    pub async fn initialize(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        self.discover_local_models().await?;
        self.fetch_available_models_list().await?;
        self.ready.store(true, Ordering::Release);

        let known = self.get_available_models().len();
        let downloaded = self.get_local_models().len();
        tracing::info!("Model manager ready: {known} model(s) known, {downloaded} downloaded");
        Ok(())
    }

    /// Scan the models directory for model files and their sidecars
    pub async fn discover_local_models(&self) -> Result<Vec<ModelInfo>> {
        let mut entries = tokio::fs::read_dir(&self.models_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            // Skip sidecars, in-progress transfers, and extensionless entries
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if matches!(ext, "json" | "part" | "tmp") {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Skipping {}: {e}", path.display());
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let mut info = ModelInfo::discovered(stem, ext, metadata.len(), path.clone());
            match SidecarMetadata::load(&sidecar::sidecar_path(&path)).await {
                Ok(Some(meta)) => meta.apply_to(&mut info),
                Ok(None) => {}
                Err(e) => tracing::warn!("Ignoring metadata for {}: {e}", path.display()),
            }

            found.push(info);
        }

        found.sort_by(|a, b| a.id.cmp(&b.id));

        {
            let mut models = lock(&self.models);
            let on_disk: HashSet<&str> = found.iter().map(|m| m.id.as_str()).collect();

            // Files removed since the last scan: catalog entries revert to
            // downloadable, purely local entries are dropped
            models.retain(|id, model| {
                if !model.downloaded || on_disk.contains(id.as_str()) {
                    return true;
                }
                tracing::debug!("Model {id} is no longer on disk");
                model.downloaded = false;
                model.path = None;
                model.download_url.is_some()
            });

            for info in &found {
                let merged = match models.remove(&info.id) {
                    Some(known) => known.merge_with_local(info),
                    None => info.clone(),
                };
                models.insert(merged.id.clone(), merged);
            }
        }

        tracing::info!(
            "Discovered {} local model(s) in {}",
            found.len(),
            self.models_dir.display()
        );
        Ok(found)
    }

    /// Load the catalog and merge it with the discovered local models
    pub async fn fetch_available_models_list(&self) -> Result<Vec<ModelInfo>> {
        let remote = catalog::load_catalog(&self.catalog_source, &self.http).await?;

        let mut models = lock(&self.models);
        for entry in remote {
            let merged = match models.get(&entry.id) {
                Some(local) if local.downloaded => entry.merge_with_local(local),
                _ => entry,
            };
            models.insert(merged.id.clone(), merged);
        }

        Ok(models.values().cloned().collect())
    }

    /// All known models, local and remote
    #[must_use]
    pub fn get_available_models(&self) -> Vec<ModelInfo> {
        lock(&self.models).values().cloned().collect()
    }

    /// Downloaded models only
    #[must_use]
    pub fn get_local_models(&self) -> Vec<ModelInfo> {
        lock(&self.models)
            .values()
            .filter(|m| m.downloaded)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_model(&self, model_id: &str) -> Option<ModelInfo> {
        lock(&self.models).get(model_id).cloned()
    }

    #[must_use]
    pub fn is_model_downloaded(&self, model_id: &str) -> bool {
        lock(&self.models)
            .get(model_id)
            .is_some_and(|m| m.downloaded)
    }

    /// Snapshot of an in-flight download
    #[must_use]
    pub fn download_progress(&self, model_id: &str) -> Option<DownloadProgress> {
        lock(&self.active)
            .get(model_id)
            .map(|active| active.progress.clone())
    }

    /// Snapshots of all in-flight downloads
    #[must_use]
    pub fn active_downloads(&self) -> Vec<DownloadProgress> {
        lock(&self.active)
            .values()
            .map(|active| active.progress.clone())
            .collect()
    }

    /// Register a standing progress listener
    pub fn subscribe(&self, callback: ProgressCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.callbacks).push((id, callback));
        id
    }

    /// Remove a progress listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        callbacks.len() != before
    }

    /// Download a model from its catalog URL into the models directory.
    ///
    /// `on_progress` is registered for the duration of this call and receives
    /// every broadcast update (see the type-level docs). On failure the partial
    /// file is removed, a final `error` update is published, and the error is
    /// returned.
    pub async fn download_model(
        &self,
        model_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ModelInfo> {
        let (model, url, output_path, cancel) = self.begin_download(model_id)?;
        let subscription = on_progress.map(|callback| self.subscribe(callback));

        let mut progress = DownloadProgress::new(model_id, model.size);
        self.publish(&progress);

        tracing::info!("Downloading {model_id} from {url}");

        // Only files this call created are removed on failure
        let result = match self
            .transfer(&model, &url, &output_path, &cancel, &mut progress)
            .await
        {
            Ok(()) => match self.finish_download(model, &output_path).await {
                Ok(model) => Ok(model),
                Err(e) => {
                    remove_if_exists(&output_path).await;
                    Err(e)
                }
            },
            Err(e) => {
                remove_if_exists(&partial_path(&output_path)).await;
                Err(e)
            }
        };

        match &result {
            Ok(_) => {
                progress.complete();
                tracing::info!(
                    "Downloaded {model_id} to {} ({} bytes)",
                    output_path.display(),
                    progress.bytes_downloaded
                );
            }
            Err(e) => {
                progress.fail(e.to_string());
                tracing::warn!("Download of {model_id} failed: {e}");
            }
        }
        self.publish(&progress);

        lock(&self.active).remove(model_id);
        if let Some(id) = subscription {
            self.unsubscribe(id);
        }

        result
    }

    /// Signal cancellation of an in-flight download.
    ///
    /// Returns false if no download of `model_id` is active.
    pub fn cancel_download(&self, model_id: &str) -> bool {
        match lock(&self.active).get(model_id) {
            Some(active) => {
                tracing::info!("Cancelling download of {model_id}");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete a downloaded model file and its sidecar
    pub async fn delete_model(&self, model_id: &str) -> Result<()> {
        let model = self
            .get_model(model_id)
            .ok_or_else(|| self.not_found(model_id))?;

        let path = match (model.downloaded, model.path) {
            (true, Some(path)) => path,
            _ => return Err(ModelError::NotDownloaded(model_id.to_string()).into()),
        };

        tokio::fs::remove_file(&path).await.map_err(|e| {
            AssistantError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to delete model {model_id}: {e}"),
            ))
        })?;

        if let Err(e) = sidecar::remove_sidecar(&sidecar::sidecar_path(&path)).await {
            tracing::warn!("Failed to remove metadata for {model_id}: {e}");
        }

        if let Some(entry) = lock(&self.models).get_mut(model_id) {
            entry.downloaded = false;
            entry.path = None;
        }

        tracing::info!("Deleted model {model_id}");
        Ok(())
    }

    /// Build a chat service for a downloaded model
    pub fn create_model_service(&self, model_id: &str) -> Result<LocalModelService> {
        let model = self
            .get_model(model_id)
            .ok_or_else(|| self.not_found(model_id))?;

        match (model.downloaded, model.path) {
            (true, Some(path)) => Ok(LocalModelService::new(LocalModelOptions {
                id: model.id,
                name: model.name,
                model_path: Some(path),
                model_size: Some(model.size),
                is_downloaded: true,
            })),
            _ => Err(ModelError::NotDownloaded(model_id.to_string()).into()),
        }
    }

    fn not_found(&self, model_id: &str) -> AssistantError {
        let models = lock(&self.models);
        ModelError::NotFound {
            id: model_id.to_string(),
            suggestion: catalog::suggest(model_id, models.keys().map(String::as_str)),
        }
        .into()
    }

    /// File a download of `model` is written to: `<id>.<format>` directly in the models directory
    fn output_path(&self, model: &ModelInfo) -> Result<PathBuf> {
        let valid = catalog::is_file_name_component(&model.id)
            && catalog::is_file_name_component(&model.format);
        let path = self.models_dir.join(format!("{}.{}", model.id, model.format));

        if !valid || path.parent() != Some(self.models_dir.as_path()) {
            return Err(ModelError::Catalog(format!(
                "Model {} cannot be stored as '{}.{}' in {}",
                model.id,
                model.id,
                model.format,
                self.models_dir.display()
            ))
            .into());
        }

        let owner = lock(&self.models)
            .values()
            .find(|m| m.id != model.id && m.downloaded && m.path.as_deref() == Some(path.as_path()))
            .map(|m| m.id.clone());
        if let Some(owner) = owner {
            return Err(ModelError::Catalog(format!(
                "Model {} would overwrite {}, which holds model {owner}",
                model.id,
                path.display()
            ))
            .into());
        }

        Ok(path)
    }

    /// Check preconditions and claim the model's download slot
    fn begin_download(
        &self,
        model_id: &str,
    ) -> Result<(ModelInfo, String, PathBuf, CancellationToken)> {
        let model = self
            .get_model(model_id)
            .ok_or_else(|| self.not_found(model_id))?;

        if model.downloaded {
            return Err(ModelError::AlreadyDownloaded(model_id.to_string()).into());
        }

        let url = model
            .download_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ModelError::NoDownloadUrl(model_id.to_string()))?;

        let output_path = self.output_path(&model)?;

        let mut active = lock(&self.active);
        if active.contains_key(model_id) {
            return Err(ModelError::DownloadInProgress(model_id.to_string()).into());
        }

        let cancel = CancellationToken::new();
        active.insert(
            model_id.to_string(),
            ActiveDownload {
                progress: DownloadProgress::new(model_id, model.size),
                cancel: cancel.clone(),
            },
        );

        Ok((model, url, output_path, cancel))
    }

    /// Stream the remote file into `<output>.part`, then move it into place
    async fn transfer(
        &self,
        model: &ModelInfo,
        url: &str,
        output_path: &Path,
        cancel: &CancellationToken,
        progress: &mut DownloadProgress,
    ) -> Result<()> {
        let transfer = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled(model.id.clone()).into()),
            opened = self.transport.open(url) => opened?,
        };

        if let Some(len) = transfer.content_length.filter(|len| *len > 0) {
            progress.total_bytes = len;
        }

        let part_path = partial_path(output_path);
        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut body = transfer.body;
        let mut hasher = model.sha256.as_ref().map(|_| Sha256::new());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::Cancelled(model.id.clone()).into()),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }

            progress.record_chunk(chunk.len() as u64);
            self.publish(progress);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let (Some(expected), Some(hasher)) = (model.sha256.as_deref(), hasher) {
            progress.status = DownloadStatus::Verifying;
            self.publish(progress);

            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ModelError::ChecksumMismatch {
                    id: model.id.clone(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }

        tokio::fs::rename(&part_path, output_path).await?;
        Ok(())
    }

    /// Persist the sidecar and flip the catalog entry to downloaded
    async fn finish_download(&self, mut model: ModelInfo, output_path: &Path) -> Result<ModelInfo> {
        model.downloaded = true;
        model.path = Some(output_path.to_path_buf());

        sidecar::write_sidecar(&sidecar::sidecar_path(output_path), &model).await?;
        lock(&self.models).insert(model.id.clone(), model.clone());

        Ok(model)
    }

    /// Record the latest progress and fan it out to every registered callback
    fn publish(&self, progress: &DownloadProgress) {
        if let Some(active) = lock(&self.active).get_mut(&progress.model_id) {
            active.progress = progress.clone();
        }

        // Callbacks run outside the lock so they may call back into the manager
        let callbacks: Vec<ProgressCallback> = lock(&self.callbacks)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(progress);
        }
    }
}

/// Remove a file left behind by a failed download
async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}
