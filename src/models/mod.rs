pub mod catalog;
pub mod download;
pub mod manager;
pub mod sidecar;

pub use catalog::ModelInfo;
pub use download::{DownloadProgress, DownloadStatus, HttpTransport, ProgressCallback, Transport};
pub use manager::{ModelManager, SubscriptionId};
