use thiserror::Error;

/// Main error type for the assistant model subsystem
#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/ai-assistant/config.toml\n- Remove the file to fall back to built-in defaults\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Local model catalog and download errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model {id} not found{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    NotFound {
        id: String,
        suggestion: Option<String>,
    },

    #[error("Model {0} is already downloaded")]
    AlreadyDownloaded(String),

    #[error("Model {0} is not downloaded")]
    NotDownloaded(String),

    #[error("No download URL available for model {0}")]
    NoDownloadUrl(String),

    #[error("Model {0} is already being downloaded")]
    DownloadInProgress(String),

    #[error("Download failed: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify the model's download URL is still valid\n- Ensure there is enough free disk space in the models directory")]
    Transfer(String),

    #[error("Checksum mismatch for model {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Download of model {0} was cancelled")]
    Cancelled(String),

    #[error("No download of model {0} is in progress")]
    NoActiveDownload(String),

    #[error("Failed to load model catalog: {0}")]
    Catalog(String),
}

/// Chat provider errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("No API key for {provider} (looked in ${env})\n\nTroubleshooting:\n- Export the key: export {env}=<key>\n- Or set api_key_env in the [{section}] config section")]
    MissingApiKey {
        provider: String,
        env: String,
        section: String,
    },

    #[error("Service {0} has not been initialized. Call initialize() first")]
    NotInitialized(String),

    #[error("Service {0} is not available")]
    Unavailable(String),

    #[error("Invalid API key\n\nTroubleshooting:\n- Verify the key has not been revoked\n- Ensure api_key_env points at the right environment variable")]
    InvalidApiKey,

    #[error("API quota exceeded\n\nTroubleshooting:\n- Check your account quota and billing\n- Switch to a local model: assistant-models models list --local")]
    QuotaExceeded,

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify firewall settings\n- Try increasing timeout_secs in config")]
    NetworkError(String),

    #[error("{0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, AssistantError>;
