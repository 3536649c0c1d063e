use crate::error::{AssistantError, ModelError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Phase of an in-flight download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Verifying,
    Extracting,
    Completed,
    Error,
}

/// Progress of a single model download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub model_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    /// 0-100, rounded half up
    pub percentage: u8,
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgress {
    #[must_use]
    pub fn new(model_id: &str, total_bytes: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            bytes_downloaded: 0,
            total_bytes,
            percentage: 0,
            status: DownloadStatus::Downloading,
            error: None,
        }
    }

    /// Account for a received chunk
    pub fn record_chunk(&mut self, len: u64) {
        self.bytes_downloaded += len;
        self.percentage = percentage(self.bytes_downloaded, self.total_bytes);
    }

    pub fn complete(&mut self) {
        self.status = DownloadStatus::Completed;
        self.percentage = 100;
        self.error = None;
    }

    pub fn fail(&mut self, error: String) {
        self.status = DownloadStatus::Error;
        self.error = Some(error);
    }

    /// Whether the download has reached a terminal state
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Completed | DownloadStatus::Error
        )
    }
}

/// Download completion percentage, rounded half up and capped at 100.
///
/// Returns 0 while the total size is unknown.
#[must_use]
pub fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let scaled = (u128::from(downloaded) * 100 + u128::from(total) / 2) / u128::from(total);
    u8::try_from(scaled.min(100)).unwrap_or(100)
}

/// Callback invoked on every progress update
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// An opened transfer: declared length plus the body as a chunk stream
pub struct Transfer {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("content_length", &self.content_length)
            .field("body", &"Stream { ... }")
            .finish()
    }
}

/// Source of model file bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a transfer for `url`
    async fn open(&self, url: &str) -> Result<Transfer>;
}

/// HTTP(S) transport backed by reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<Transfer> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::Transfer(format!("Failed to start download: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                ModelError::Transfer(format!("Download failed with status: {status}")).into(),
            );
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|e| -> AssistantError { ModelError::Transfer(e.to_string()).into() })
            .boxed();

        Ok(Transfer {
            content_length,
            body,
        })
    }
}

/// In-progress path for a model file (`<file>.part`)
#[must_use]
pub fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".part");
    output_path.with_file_name(name)
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 1000), 0);
        assert_eq!(percentage(500, 1000), 50);
        assert_eq!(percentage(1000, 1000), 100);
        // Round half up
        assert_eq!(percentage(5, 1000), 1);
        assert_eq!(percentage(4, 1000), 0);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        // Unknown total, overshoot
        assert_eq!(percentage(123, 0), 0);
        assert_eq!(percentage(2000, 1000), 100);
        // No overflow on huge sizes
        assert_eq!(percentage(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn test_progress_lifecycle() {
        let mut progress = DownloadProgress::new("m1", 1000);
        assert_eq!(progress.status, DownloadStatus::Downloading);
        assert!(!progress.is_settled());

        progress.record_chunk(500);
        assert_eq!(progress.percentage, 50);
        progress.record_chunk(250);
        assert_eq!(progress.bytes_downloaded, 750);
        assert_eq!(progress.percentage, 75);

        progress.complete();
        assert_eq!(progress.percentage, 100);
        assert!(progress.is_settled());
    }

    #[test]
    fn test_progress_serializes_camel_case() {
        let mut progress = DownloadProgress::new("m1", 10);
        progress.fail("boom".to_string());

        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["modelId"], "m1");
        assert_eq!(json["totalBytes"], 10);
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_partial_path() {
        let path = Path::new("/models/mistral-7b-instruct-v0.2-q4_0.gguf");
        assert_eq!(
            partial_path(path),
            PathBuf::from("/models/mistral-7b-instruct-v0.2-q4_0.gguf.part")
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
        assert_eq!(format_bytes(3_800_000_000), "3.54 GB");
    }
}
