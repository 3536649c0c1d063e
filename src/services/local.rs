use crate::error::{ModelError, Result};
use crate::models::sidecar::{sidecar_path, SidecarMetadata};
use crate::services::{
    ModelMessage, ModelResponse, ModelService, Provider, RequestOptions, ServiceDescriptor,
    ServiceStatus,
};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_STEP_INTERVAL: Duration = Duration::from_millis(500);
const PROGRESS_STEP: u8 = 10;

/// Construction options for a [`LocalModelService`]
#[derive(Debug, Clone, Default)]
pub struct LocalModelOptions {
    pub id: String,
    pub name: String,
    pub model_path: Option<PathBuf>,
    pub model_size: Option<u64>,
    pub is_downloaded: bool,
}

/// Progress callback for the simulated download, called with 0-100
pub type LocalProgressFn = Box<dyn Fn(u8) + Send + Sync>;

/// File facts gathered when a local model is initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub parameters: u64,
    pub format: String,
    pub quantization: Option<String>,
    pub downloaded: bool,
}

/// Snapshot returned by [`LocalModelService::get_model_details`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelDetails {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub is_available: bool,
    pub model_size: Option<u64>,
    pub download_progress: u8,
    pub model_path: Option<PathBuf>,
}

/// Chat service backed by a model file on disk.
///
/// Inference is a placeholder: replies are a fixed message naming the model.
/// The download is simulated in fixed 10% steps.
pub struct LocalModelService {
    descriptor: ServiceDescriptor,
    model_path: Option<PathBuf>,
    model_size: Option<u64>,
    download_progress: u8,
    metadata: Option<LocalModelMetadata>,
    initialized: bool,
    backend_running: bool,
    step_interval: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LocalModelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalModelService")
            .field("id", &self.descriptor.id)
            .field("model_path", &self.model_path)
            .field("download_progress", &self.download_progress)
            .field("status", &self.descriptor.status)
            .field("backend_running", &self.backend_running)
            .finish_non_exhaustive()
    }
}

impl LocalModelService {
    #[must_use]
    pub fn new(options: LocalModelOptions) -> Self {
        let mut descriptor =
            ServiceDescriptor::new(options.id, options.name.as_str(), Provider::Local);
        descriptor.max_tokens = Some(DEFAULT_MAX_TOKENS);
        descriptor.description = Some(format!("Local {} model", options.name));

        let download_progress = if options.is_downloaded {
            descriptor.mark_ready();
            100
        } else {
            0
        };

        Self {
            descriptor,
            model_path: options.model_path,
            model_size: options.model_size,
            download_progress,
            metadata: None,
            initialized: false,
            backend_running: false,
            step_interval: DEFAULT_STEP_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the delay between simulated download steps
    #[must_use]
    pub const fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    /// Token that cancels the running simulated download when triggered.
    ///
    /// A download holds `&mut self`, so this handle is how another task stops
    /// it. A fresh token is installed after each cancellation; fetch a new
    /// handle before every download. Cancelling while no download runs has no
    /// effect on the next one.
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub const fn download_progress(&self) -> u8 {
        self.download_progress
    }

    #[must_use]
    pub const fn metadata(&self) -> Option<&LocalModelMetadata> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    #[must_use]
    pub const fn is_backend_running(&self) -> bool {
        self.backend_running
    }

    #[must_use]
    pub fn get_model_details(&self) -> LocalModelDetails {
        LocalModelDetails {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            provider: self.descriptor.provider,
            is_available: self.descriptor.is_available,
            model_size: self.model_size,
            download_progress: self.download_progress,
            model_path: self.model_path.clone(),
        }
    }

    /// Stop the inference backend
    pub fn cleanup(&mut self) {
        if self.backend_running {
            tracing::debug!("Stopping inference backend for {}", self.descriptor.id);
            self.backend_running = false;
        }
    }

    /// Stat the model file and overlay its sidecar, if any
    async fn read_metadata(path: &Path) -> Result<LocalModelMetadata> {
        let stat = tokio::fs::metadata(path).await?;

        let mut metadata = LocalModelMetadata {
            path: path.to_path_buf(),
            size: stat.len(),
            parameters: 0,
            format: path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string(),
            quantization: None,
            downloaded: true,
        };

        if let Some(sidecar) = SidecarMetadata::load(&sidecar_path(path)).await? {
            if let Some(size) = sidecar.size {
                metadata.size = size;
            }
            if let Some(parameters) = sidecar.parameters {
                metadata.parameters = parameters;
            }
            if let Some(format) = sidecar.format {
                metadata.format = format;
            }
            metadata.quantization = sidecar.quantization;
        }

        Ok(metadata)
    }

    fn start_backend(&mut self) {
        tracing::debug!(
            "Starting inference backend for {} ({})",
            self.descriptor.id,
            self.model_path
                .as_deref()
                .map(Path::display)
                .map(|p| p.to_string())
                .unwrap_or_default()
        );
        self.backend_running = true;
    }

    fn reset_download(&mut self) {
        self.download_progress = 0;
        self.descriptor.status = ServiceStatus::Loading;
        self.cancel = CancellationToken::new();
    }
}

#[async_trait]
impl ModelService for LocalModelService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn initialize(&mut self) -> ServiceStatus {
        if self.initialized {
            return self.descriptor.status;
        }

        let path = match (&self.model_path, self.descriptor.is_available) {
            (Some(path), true) => path.clone(),
            _ => {
                tracing::warn!(
                    "Local model {} is not available for initialization",
                    self.descriptor.id
                );
                return self.descriptor.mark_unavailable();
            }
        };

        match Self::read_metadata(&path).await {
            Ok(metadata) => {
                self.metadata = Some(metadata);
                self.start_backend();
                self.initialized = true;
                tracing::info!("Initialized local model {}", self.descriptor.id);
                self.descriptor.mark_ready()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize local model {}: {e}",
                    self.descriptor.id
                );
                self.descriptor.mark_unavailable()
            }
        }
    }

    async fn send_message(
        &self,
        _messages: &[ModelMessage],
        _options: &RequestOptions,
    ) -> Result<ModelResponse> {
        if !self.descriptor.is_available {
            return Err(ModelError::NotDownloaded(self.descriptor.id.clone()).into());
        }

        tracing::debug!("Sending message to local model {}", self.descriptor.id);
        Ok(ModelResponse {
            content: format!(
                "This is a placeholder response from local model {}. \
                 In a real implementation, this would be generated by the local model.",
                self.descriptor.name
            ),
            model: Some(self.descriptor.id.clone()),
            ..ModelResponse::default()
        })
    }

    async fn download_model(&mut self, on_progress: Option<LocalProgressFn>) -> Result<()> {
        if self.descriptor.is_available {
            tracing::info!("Model {} is already downloaded", self.descriptor.id);
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            tracing::debug!(
                "Discarding cancellation requested while {} was idle",
                self.descriptor.id
            );
            self.cancel = CancellationToken::new();
        }

        tracing::info!("Downloading model {}", self.descriptor.id);
        self.descriptor.status = ServiceStatus::Loading;
        let cancel = self.cancel.clone();

        for step in (0..=100).step_by(usize::from(PROGRESS_STEP)) {
            self.download_progress = step;
            if let Some(callback) = &on_progress {
                callback(step);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("Cancelled download of model {}", self.descriptor.id);
                    self.reset_download();
                    return Err(ModelError::Cancelled(self.descriptor.id.clone()).into());
                }
                () = tokio::time::sleep(self.step_interval) => {}
            }
        }

        self.descriptor.mark_ready();
        if let Some(path) = self.model_path.clone() {
            self.metadata = Self::read_metadata(&path).await.ok();
        }
        tracing::info!("Model {} downloaded", self.descriptor.id);
        Ok(())
    }

    /// Abandon a download whose future was dropped part way through.
    ///
    /// A download that is still being polled is stopped through
    /// [`LocalModelService::cancellation_handle`].
    async fn cancel_download(&mut self) -> Result<()> {
        if self.download_progress == 0 || self.download_progress >= 100 {
            return Err(ModelError::NoActiveDownload(self.descriptor.id.clone()).into());
        }

        tracing::info!("Cancelling download of model {}", self.descriptor.id);
        self.cancel.cancel();
        self.reset_download();
        Ok(())
    }
}
