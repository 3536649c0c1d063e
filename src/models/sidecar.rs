use crate::error::{AssistantError, Result};
use crate::models::catalog::ModelInfo;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Metadata stored in `<model>.json` next to a model file.
///
/// Every field is optional so hand-written sidecars only need the values
/// that can't be derived from the file itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMetadata {
    pub id: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub size: Option<u64>,
    pub parameters: Option<u64>,
    pub format: Option<String>,
    pub quantization: Option<String>,
    pub download_url: Option<String>,
    pub description: Option<String>,
    pub sha256: Option<String>,
    pub downloaded_at: Option<String>,
}

/// Record written after a completed download
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SidecarRecord<'a> {
    #[serde(flatten)]
    model: &'a ModelInfo,
    downloaded_at: String,
}

impl SidecarMetadata {
    /// Read a sidecar file. Returns `Ok(None)` when the file doesn't exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            AssistantError::Other(format!(
                "Failed to parse sidecar {}: {e}",
                path.display()
            ))
        })
    }

    /// Overlay the sidecar values onto a discovered model.
    ///
    /// `downloaded` and `path` are left alone: they describe the file actually found.
    pub fn apply_to(self, info: &mut ModelInfo) {
        if let Some(id) = self.id {
            info.id = id;
        }
        if let Some(name) = self.name {
            info.name = name;
        }
        if let Some(provider) = self.provider {
            info.provider = provider;
        }
        if let Some(size) = self.size {
            info.size = size;
        }
        if let Some(parameters) = self.parameters {
            info.parameters = parameters;
        }
        if let Some(format) = self.format {
            info.format = format;
        }
        info.quantization = self.quantization.or(info.quantization.take());
        info.download_url = self.download_url.or(info.download_url.take());
        info.description = self.description.or(info.description.take());
        info.sha256 = self.sha256.or(info.sha256.take());
    }
}

/// Sidecar path for a model file (same base name, `.json` extension)
#[must_use]
pub fn sidecar_path(model_file: &Path) -> PathBuf {
    model_file.with_extension("json")
}

/// Write the sidecar for a downloaded model atomically (tmp + rename)
pub async fn write_sidecar(path: &Path, model: &ModelInfo) -> Result<()> {
    let record = SidecarRecord {
        model,
        downloaded_at: chrono::Utc::now().to_rfc3339(),
    };
    let content = serde_json::to_string_pretty(&record)
        .map_err(|e| AssistantError::Other(format!("Failed to serialize sidecar: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    Ok(())
}

/// Remove a sidecar file, treating a missing file as success
pub async fn remove_sidecar(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Get the platform models directory
pub fn default_models_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AssistantError::Config("Cannot determine home directory".to_string()))?;

    let dir = if cfg!(target_os = "macos") {
        home.join("Library")
            .join("Application Support")
            .join("AI Assistant")
            .join("models")
    } else if cfg!(target_os = "windows") {
        home.join("AppData")
            .join("Local")
            .join("AI Assistant")
            .join("models")
    } else {
        home.join(".ai-assistant").join("models")
    };

    Ok(dir)
}
