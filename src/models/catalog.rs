use crate::config::CatalogSource;
use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Catalog entry for a model that is known locally, remotely, or both
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Size in bytes
    pub size: u64,
    #[serde(default)]
    pub parameters: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex SHA-256 of the model file, verified after download when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ModelInfo {
    /// Entry for a model file found on disk, before sidecar overrides
    #[must_use]
    pub fn discovered(stem: &str, format: &str, size: u64, path: PathBuf) -> Self {
        Self {
            id: stem.to_string(),
            name: stem.to_string(),
            provider: "Local".to_string(),
            size,
            parameters: 0,
            quantization: None,
            format: format.to_string(),
            download_url: None,
            description: None,
            sha256: None,
            downloaded: true,
            path: Some(path),
        }
    }

    /// Merge a catalog entry with the locally discovered record of the same model.
    ///
    /// Local values win; optional fields the local record lacks are taken from the catalog.
    #[must_use]
    pub fn merge_with_local(self, local: &Self) -> Self {
        Self {
            id: local.id.clone(),
            name: local.name.clone(),
            provider: local.provider.clone(),
            size: local.size,
            parameters: local.parameters,
            quantization: local.quantization.clone().or(self.quantization),
            format: local.format.clone(),
            download_url: local.download_url.clone().or(self.download_url),
            description: local.description.clone().or(self.description),
            sha256: local.sha256.clone().or(self.sha256),
            downloaded: true,
            path: local.path.clone(),
        }
    }
}

/// Built-in list of downloadable models
#[must_use]
pub fn builtin_catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "llama-2-7b-chat-q4_0".to_string(),
            name: "Llama 2 7B Chat Q4_0".to_string(),
            provider: "Meta".to_string(),
            size: 3_800_000_000,
            parameters: 7_000_000_000,
            quantization: Some("Q4_0".to_string()),
            format: "gguf".to_string(),
            download_url: Some(
                "https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_0.gguf"
                    .to_string(),
            ),
            description: Some(
                "Llama 2 7B Chat model optimized for dialogue use cases, quantized to 4-bit."
                    .to_string(),
            ),
            sha256: None,
            downloaded: false,
            path: None,
        },
        ModelInfo {
            id: "mistral-7b-instruct-v0.2-q4_0".to_string(),
            name: "Mistral 7B Instruct Q4_0".to_string(),
            provider: "Mistral AI".to_string(),
            size: 3_700_000_000,
            parameters: 7_000_000_000,
            quantization: Some("Q4_0".to_string()),
            format: "gguf".to_string(),
            download_url: Some(
                "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.2-GGUF/resolve/main/mistral-7b-instruct-v0.2.Q4_0.gguf"
                    .to_string(),
            ),
            description: Some(
                "Mistral 7B Instruct v0.2 model fine-tuned for instruction following, quantized to 4-bit."
                    .to_string(),
            ),
            sha256: None,
            downloaded: false,
            path: None,
        },
    ]
}

/// Parse a catalog manifest (JSON array of model records)
pub fn parse_manifest(content: &str) -> Result<Vec<ModelInfo>> {
    let mut models: Vec<ModelInfo> = serde_json::from_str(content)
        .map_err(|e| ModelError::Catalog(format!("Failed to parse manifest: {e}")))?;

    for model in &mut models {
        if model.id.trim().is_empty() {
            return Err(ModelError::Catalog("Manifest entry with empty id".to_string()).into());
        }
        // Both end up in the model's file name inside the models directory
        if !is_file_name_component(&model.id) {
            return Err(ModelError::Catalog(format!("Invalid model id '{}'", model.id)).into());
        }
        if !is_file_name_component(&model.format) {
            return Err(ModelError::Catalog(format!(
                "Invalid format '{}' for model {}",
                model.format, model.id
            ))
            .into());
        }
        // Download state is owned by the local side, never by the manifest
        model.downloaded = false;
        model.path = None;
    }

    Ok(models)
}

/// Whether `value` can be used as part of a file name without leaving its directory
#[must_use]
pub fn is_file_name_component(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.contains("..")
        && !value.contains(['/', '\\', '\0'])
}

/// Load the catalog from the configured source
pub async fn load_catalog(source: &CatalogSource, client: &reqwest::Client) -> Result<Vec<ModelInfo>> {
    match source {
        CatalogSource::Builtin => Ok(builtin_catalog()),
        CatalogSource::File { path } => {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                ModelError::Catalog(format!("Failed to read {}: {e}", path.display()))
            })?;
            parse_manifest(&content)
        }
        CatalogSource::Url { url } => {
            tracing::debug!("Fetching model catalog from {url}");
            let response = client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| ModelError::Catalog(format!("Failed to fetch {url}: {e}")))?;
            let content = response
                .text()
                .await
                .map_err(|e| ModelError::Catalog(format!("Failed to read {url}: {e}")))?;
            parse_manifest(&content)
        }
    }
}

/// Find the closest model id using Levenshtein distance
#[must_use]
pub fn suggest<'a>(id: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    if id.is_empty() {
        return None;
    }

    candidates
        .into_iter()
        .map(|candidate| (candidate, levenshtein_distance(id, candidate)))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
        .map(|(candidate, _)| candidate.to_string())
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
