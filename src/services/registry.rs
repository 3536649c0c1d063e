use crate::services::{ModelBackend, Provider};
use std::collections::{BTreeMap, HashMap};

/// Lookup table from service id to registered backend.
///
/// Registration order is preserved for listing. Registering an id that is
/// already present replaces the old service in place (last write wins).
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<ModelBackend>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, returning the one it replaced, if any
    pub fn register(&mut self, service: impl Into<ModelBackend>) -> Option<ModelBackend> {
        let service = service.into();
        let id = service.id().to_string();

        if let Some(&slot) = self.index.get(&id) {
            tracing::warn!("Service {id} already registered, replacing it");
            return Some(std::mem::replace(&mut self.services[slot], service));
        }

        tracing::debug!("Registered service {id} ({})", service.provider());
        self.index.insert(id, self.services.len());
        self.services.push(service);
        None
    }

    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<&ModelBackend> {
        self.index.get(id).map(|&slot| &self.services[slot])
    }

    pub fn lookup_mut(&mut self, id: &str) -> Option<&mut ModelBackend> {
        self.index.get(id).map(|&slot| &mut self.services[slot])
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All services in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ModelBackend> {
        self.services.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModelBackend> {
        self.services.iter_mut()
    }

    /// Services whose `is_available` flag is set
    #[must_use]
    pub fn list_available(&self) -> Vec<&ModelBackend> {
        self.services.iter().filter(|s| s.is_available()).collect()
    }

    #[must_use]
    pub fn list_local(&self) -> Vec<&ModelBackend> {
        self.services.iter().filter(|s| s.is_local()).collect()
    }

    #[must_use]
    pub fn list_by_provider(&self, provider: Provider) -> Vec<&ModelBackend> {
        self.services
            .iter()
            .filter(|s| s.provider() == provider)
            .collect()
    }

    /// Services grouped by provider; providers with no services are omitted
    #[must_use]
    pub fn group_by_provider(&self) -> BTreeMap<Provider, Vec<&ModelBackend>> {
        let mut groups: BTreeMap<Provider, Vec<&ModelBackend>> = BTreeMap::new();
        for service in &self.services {
            groups.entry(service.provider()).or_default().push(service);
        }
        groups
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Drop every registered service
    pub fn clear(&mut self) {
        self.services.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ClaudeModel, ClaudeService, LocalModelOptions, LocalModelService};

    fn local(id: &str, name: &str, downloaded: bool) -> LocalModelService {
        LocalModelService::new(LocalModelOptions {
            id: id.to_string(),
            name: name.to_string(),
            is_downloaded: downloaded,
            ..LocalModelOptions::default()
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.register(local("phi3", "Phi-3", true)).is_none());
        assert!(registry
            .register(ClaudeService::new(ClaudeModel::Haiku))
            .is_none());

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("claude-3-haiku"));
        assert_eq!(registry.lookup("phi3").unwrap().name(), "Phi-3");
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = ServiceRegistry::new();
        registry.register(local("phi3", "First", false));
        registry.register(local("qwen", "Qwen", false));

        let replaced = registry.register(local("phi3", "Second", true));
        assert_eq!(replaced.unwrap().name(), "First");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("phi3").unwrap().name(), "Second");
        // Replacement keeps the original position
        let ids: Vec<&str> = registry.iter().map(ModelBackend::id).collect();
        assert_eq!(ids, vec!["phi3", "qwen"]);
    }

    #[test]
    fn test_filters_and_grouping() {
        let mut registry = ServiceRegistry::new();
        registry.register(local("phi3", "Phi-3", true));
        registry.register(local("qwen", "Qwen", false));
        registry.register(ClaudeService::new(ClaudeModel::Opus));

        let available: Vec<&str> = registry.list_available().iter().map(|s| s.id()).collect();
        assert_eq!(available, vec!["phi3"]);
        assert_eq!(registry.list_local().len(), 2);
        assert_eq!(registry.list_by_provider(Provider::Anthropic).len(), 1);

        let groups = registry.group_by_provider();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&Provider::Local].len(), 2);
        assert!(!groups.contains_key(&Provider::OpenAI));

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.lookup("phi3").is_none());
    }
}
