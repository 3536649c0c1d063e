use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::services::http::{resolve_api_key, send_json};
use crate::services::{
    format_response, ModelMessage, ModelResponse, ModelService, Provider, RequestOptions,
    ServiceDescriptor, ServiceStatus,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Chat models registered when the config doesn't list any
pub const DEFAULT_MODELS: [&str; 4] = ["gpt-4o", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"];

/// Display name, description, and output token limit for a known model id
fn profile(model_id: &str) -> (&str, &'static str, u32) {
    match model_id {
        "gpt-4o" => (
            "GPT-4o",
            "OpenAI's most capable model with vision and audio abilities",
            4096,
        ),
        "gpt-4-turbo" => (
            "GPT-4 Turbo",
            "Fast and powerful model with a large context window",
            4096,
        ),
        "gpt-4" => (
            "GPT-4",
            "OpenAI's high-capability model with improved reasoning",
            8192,
        ),
        "gpt-3.5-turbo" => (
            "GPT-3.5 Turbo",
            "Fast and cost-effective model for general tasks",
            4096,
        ),
        other => (other, "OpenAI model", DEFAULT_MAX_TOKENS),
    }
}

/// OpenAI chat completions service
pub struct OpenAIService {
    descriptor: ServiceDescriptor,
    client: Option<reqwest::Client>,
    api_key: Option<String>,
    explicit_key: Option<String>,
    api_key_env: String,
    base_url: String,
    timeout: Option<Duration>,
    verify_on_init: bool,
}

impl std::fmt::Debug for OpenAIService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIService")
            .field("id", &self.descriptor.id)
            .field("client", &self.client.as_ref().map(|_| "Client { ... }"))
            .field("api_key", &"***")
            .field("api_key_env", &self.api_key_env)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("status", &self.descriptor.status)
            .finish()
    }
}

impl OpenAIService {
    /// Create a service for `model_id`. Unknown ids are accepted with a generic profile.
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let (name, description, max_tokens) = profile(&model_id);

        let mut descriptor = ServiceDescriptor::new(model_id.as_str(), name, Provider::OpenAI);
        descriptor.max_tokens = Some(max_tokens);
        descriptor.description = Some(description.to_string());

        Self {
            descriptor,
            client: None,
            api_key: None,
            explicit_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: None,
            verify_on_init: false,
        }
    }

    /// Create from the `[openai]` config section
    pub fn from_config(model_id: impl Into<String>, config: &ProviderConfig) -> Self {
        let mut service = Self::new(model_id);
        if let Some(env) = &config.api_key_env {
            service.api_key_env.clone_from(env);
        }
        if let Some(base_url) = &config.base_url {
            service.base_url.clone_from(base_url);
        }
        service.timeout = config.timeout_secs.map(Duration::from_secs);
        service.verify_on_init = config.verify_on_init;
        service
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.explicit_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Use a preconfigured HTTP client instead of building one on initialize
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, messages: &[ModelMessage], options: &RequestOptions) -> Value {
        let mut turns = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &options.system_prompt {
            turns.push(json!({ "role": "system", "content": system }));
        }
        turns.extend(
            messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );

        let mut body = json!({
            "model": self.descriptor.id,
            "max_tokens": options
                .max_tokens
                .or(self.descriptor.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": options.temperature_or(self.descriptor.temperature),
            "messages": turns,
        });

        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|function| json!({ "type": "function", "function": function }))
                .collect();
            body["tools"] = Value::Array(tools);
        }

        body
    }

    /// Confirm the key works by listing models
    async fn verify(&self) -> Result<()> {
        let (Some(client), Some(api_key)) = (&self.client, &self.api_key) else {
            return Err(ProviderError::NotInitialized(self.descriptor.id.clone()).into());
        };

        let request = client.get(self.endpoint("/v1/models")).bearer_auth(api_key);
        send_json(request, self.timeout).await.map(|_| ())
    }
}

#[async_trait]
impl ModelService for OpenAIService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn initialize(&mut self) -> ServiceStatus {
        if self.descriptor.status == ServiceStatus::Ready {
            return ServiceStatus::Ready;
        }

        let Some(api_key) = resolve_api_key(self.explicit_key.as_deref(), &self.api_key_env) else {
            let err = ProviderError::MissingApiKey {
                provider: Provider::OpenAI.to_string(),
                env: self.api_key_env.clone(),
                section: "openai".to_string(),
            };
            tracing::warn!("{} unavailable: {err}", self.descriptor.id);
            return self.descriptor.mark_unavailable();
        };

        self.client.get_or_insert_with(reqwest::Client::new);
        self.api_key = Some(api_key);

        if self.verify_on_init {
            if let Err(e) = self.verify().await {
                tracing::warn!("Failed to initialize {}: {e}", self.descriptor.id);
                return self.descriptor.mark_unavailable();
            }
        }

        tracing::debug!("{} ready", self.descriptor.id);
        self.descriptor.mark_ready()
    }

    async fn send_message(
        &self,
        messages: &[ModelMessage],
        options: &RequestOptions,
    ) -> Result<ModelResponse> {
        if !self.descriptor.is_available {
            return Err(self.descriptor.unavailable_error().into());
        }
        let (Some(client), Some(api_key)) = (&self.client, &self.api_key) else {
            return Err(ProviderError::NotInitialized(self.descriptor.id.clone()).into());
        };

        let body = self.build_request(messages, options);
        let request = client
            .post(self.endpoint("/v1/chat/completions"))
            .bearer_auth(api_key)
            .json(&body);

        let raw = send_json(request, self.timeout).await?;
        Ok(format_response(&raw, &self.descriptor.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssistantError;
    use serial_test::serial;

    #[test]
    fn test_known_and_unknown_profiles() {
        let service = OpenAIService::new("gpt-4");
        assert_eq!(service.descriptor().name, "GPT-4");
        assert_eq!(service.descriptor().max_tokens, Some(8192));

        let service = OpenAIService::new("gpt-4o");
        assert_eq!(service.descriptor().name, "GPT-4o");
        assert_eq!(service.descriptor().max_tokens, Some(4096));

        let service = OpenAIService::new("gpt-5-preview");
        assert_eq!(service.descriptor().name, "gpt-5-preview");
        assert_eq!(service.descriptor().description.as_deref(), Some("OpenAI model"));
        assert_eq!(service.descriptor().provider, Provider::OpenAI);
    }

    #[test]
    fn test_build_request() {
        let service = OpenAIService::new("gpt-3.5-turbo");
        let messages = vec![ModelMessage::user("Hi"), ModelMessage::assistant("Hello")];
        let options = RequestOptions {
            temperature: Some(0.2),
            system_prompt: Some("Answer in French.".to_string()),
            top_k: Some(5),
            tools: vec![json!({ "name": "get_weather", "parameters": { "type": "object" } })],
            ..RequestOptions::default()
        };

        let body = service.build_request(&messages, &options);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 4096);

        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["role"], "system");
        assert_eq!(turns[0]["content"], "Answer in French.");
        assert_eq!(turns[2]["role"], "assistant");

        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        // top_k is not an OpenAI parameter
        assert!(body.get("top_k").is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_initialize_reads_env_key() {
        let original = std::env::var("OPENAI_API_KEY_TEST").ok();
        std::env::set_var("OPENAI_API_KEY_TEST", "sk-test");

        let config = ProviderConfig {
            api_key_env: Some("OPENAI_API_KEY_TEST".to_string()),
            ..ProviderConfig::default()
        };
        let mut service = OpenAIService::from_config("gpt-4o", &config);
        assert_eq!(service.initialize().await, ServiceStatus::Ready);
        assert!(service.descriptor().is_available);

        std::env::remove_var("OPENAI_API_KEY_TEST");
        let mut service = OpenAIService::from_config("gpt-4o", &config);
        assert_eq!(service.initialize().await, ServiceStatus::Error);
        assert!(!service.descriptor().is_available);

        // Restore original env var
        if let Some(val) = original {
            std::env::set_var("OPENAI_API_KEY_TEST", val);
        }
    }

    #[tokio::test]
    async fn test_send_before_initialize() {
        let service = OpenAIService::new("gpt-4o").with_api_key("sk-test");
        let result = service
            .send_message(&[ModelMessage::user("Hi")], &RequestOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(AssistantError::Provider(ProviderError::NotInitialized(_)))
        ));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let service = OpenAIService::new("gpt-4").with_api_key("sk-secret-123");
        let debug = format!("{service:?}");
        assert!(!debug.contains("sk-secret-123"));
    }
}
