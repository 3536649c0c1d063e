//! Application root: owns the config, the model manager, and the service registry.
//!
//! Startup order is fixed: load config, initialize the model manager, register
//! the remote chat services, then register a local service for every model
//! already on disk. [`AppContext::shutdown`] tears the registry down again.

use crate::config::Config;
use crate::error::Result;
use crate::models::ModelManager;
use crate::services::openai::DEFAULT_MODELS;
use crate::services::{
    ClaudeModel, ClaudeService, ModelBackend, ModelService, OpenAIService, RequestOptions,
    ServiceRegistry, ServiceStatus,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct AppContext {
    config: Config,
    manager: Arc<ModelManager>,
    registry: ServiceRegistry,
}

impl AppContext {
    /// Build the model manager from config and bring everything up
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let manager = ModelManager::from_config(&config)?;
        Ok(Self::bootstrap_with(config, manager).await)
    }

    /// Bring everything up around an already constructed manager
    pub async fn bootstrap_with(config: Config, manager: ModelManager) -> Self {
        if let Err(e) = manager.initialize().await {
            tracing::warn!("Model manager not ready: {e}");
        }

        let mut context = Self {
            config,
            manager: Arc::new(manager),
            registry: ServiceRegistry::new(),
        };

        context.register_remote_services().await;

        for model in context.manager.get_local_models() {
            if let Err(e) = context.register_downloaded(&model.id).await {
                tracing::warn!("Skipping local model {}: {e}", model.id);
            }
        }

        tracing::info!(
            "{} service(s) registered, {} available",
            context.registry.len(),
            context.registry.list_available().len()
        );
        context
    }

    async fn register_remote_services(&mut self) {
        let anthropic = &self.config.anthropic;
        if anthropic.enabled {
            let ids: Vec<String> = if anthropic.models.is_empty() {
                ClaudeModel::ALL.iter().map(|m| m.id().to_string()).collect()
            } else {
                anthropic.models.clone()
            };

            for id in ids {
                let Some(model) = ClaudeModel::from_id(&id) else {
                    tracing::warn!("Unknown Claude model '{id}' in [anthropic].models, skipping");
                    continue;
                };
                let mut service = ClaudeService::from_config(model, &self.config.anthropic);
                initialize_logged(&mut service).await;
                self.registry.register(service);
            }
        }

        let openai = &self.config.openai;
        if openai.enabled {
            let ids: Vec<String> = if openai.models.is_empty() {
                DEFAULT_MODELS.iter().map(|id| (*id).to_string()).collect()
            } else {
                openai.models.clone()
            };

            for id in ids {
                let mut service = OpenAIService::from_config(id, &self.config.openai);
                initialize_logged(&mut service).await;
                self.registry.register(service);
            }
        }
    }

    /// Create, initialize, and register the local service for a downloaded model
    pub async fn register_downloaded(&mut self, model_id: &str) -> Result<ServiceStatus> {
        let step = Duration::from_millis(self.config.local.simulated_step_ms);
        let mut service = self
            .manager
            .create_model_service(model_id)?
            .with_step_interval(step);

        let status = initialize_logged(&mut service).await;
        self.registry.register(service);
        Ok(status)
    }

    /// Request options seeded from the `[defaults]` config section
    #[must_use]
    pub fn default_request_options(&self) -> RequestOptions {
        RequestOptions {
            temperature: Some(self.config.defaults.temperature),
            max_tokens: self.config.defaults.max_tokens,
            ..RequestOptions::default()
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    #[must_use]
    pub const fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.registry
    }

    /// Stop local inference backends and empty the registry
    pub fn shutdown(&mut self) {
        for backend in self.registry.iter_mut() {
            if let ModelBackend::Local(service) = backend {
                service.cleanup();
            }
        }
        self.registry.clear();
        tracing::debug!("Service registry cleared");
    }
}

async fn initialize_logged(service: &mut impl ModelService) -> ServiceStatus {
    let status = service.initialize().await;
    tracing::debug!("{} initialized: {status:?}", service.descriptor().id);
    status
}
