//! `Engine`: the process-wide owner of configuration, concurrency control,
//! provider clients, and evidence providers (spec §9 "Re-architecture
//! hint"). Sessions are a per-request concern built from the engine's
//! services, never an ambient singleton themselves.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigRegistry;
use crate::error::EngineError;
use crate::evidence::{EvidenceCollector, EvidenceProvider};
use crate::event::ProgressSink;
use crate::governor::{governor_for_providers, ConcurrencyGovernor};
use crate::llm::LLMClient;
use crate::llm::providers::OpenAiCompatibleProvider;
use crate::session::{AnalyzeRequest, SessionCoordinator, SessionHandle, SessionOutcome};

/// Holds every collaborator a [`SessionCoordinator`] needs, constructed once
/// per process. Building a session from it is cheap (a handful of `Arc`
/// clones); building the engine itself does real I/O (loading the catalogue).
pub struct Engine {
    config: Arc<ConfigRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    llm_clients: HashMap<String, Arc<dyn LLMClient>>,
    evidence: Arc<EvidenceCollector>,
}

impl Engine {
    /// Load the agent catalogue from `catalogue_path`/`state_path`, build one
    /// governor pool per distinct provider referenced by the catalogue, and
    /// wire the four built-in OpenAI-compatible provider clients.
    pub async fn load(
        catalogue_path: impl AsRef<Path>,
        state_path: impl AsRef<Path>,
        evidence_providers: HashMap<String, Arc<dyn EvidenceProvider>>,
        governor_capacity: usize,
    ) -> Result<Self, EngineError> {
        let config = ConfigRegistry::load(catalogue_path, state_path).await?;
        let providers_in_use: Vec<String> = config
            .list()
            .iter()
            .map(|s| s.provider_binding.provider.clone())
            .collect();
        let governor = Arc::new(governor_for_providers(governor_capacity, providers_in_use));

        let mut llm_clients: HashMap<String, Arc<dyn LLMClient>> = HashMap::new();
        llm_clients.insert("openai".to_string(), Arc::new(OpenAiCompatibleProvider::openai()));
        llm_clients.insert("claude".to_string(), Arc::new(OpenAiCompatibleProvider::claude()));
        llm_clients.insert("gemini".to_string(), Arc::new(OpenAiCompatibleProvider::gemini()));
        llm_clients.insert("grok".to_string(), Arc::new(OpenAiCompatibleProvider::grok()));

        Ok(Self {
            config: Arc::new(config),
            governor,
            llm_clients,
            evidence: Arc::new(EvidenceCollector::new(evidence_providers)),
        })
    }

    /// Replace the registered LLM client for `provider` — primarily for
    /// tests and for wiring providers beyond the four built-ins.
    pub fn register_llm_client(&mut self, provider: impl Into<String>, client: Arc<dyn LLMClient>) {
        self.llm_clients.insert(provider.into(), client);
    }

    pub fn config(&self) -> &ConfigRegistry {
        &self.config
    }

    /// Start one analysis session. Returns a [`SessionHandle`] for
    /// cancellation and a `JoinHandle` resolving to the session's outcome.
    pub async fn start_session(
        &self,
        request: AnalyzeRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> (SessionHandle, tokio::task::JoinHandle<Result<SessionOutcome, EngineError>>) {
        let coordinator = SessionCoordinator::new(
            self.config.clone(),
            self.evidence.clone(),
            self.governor.clone(),
            self.llm_clients.clone(),
        );
        coordinator.run(request, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_wires_one_governor_pool_per_distinct_provider() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue_path = dir.path().join("agents.json");
        let state_path = dir.path().join("state.json");
        let doc = serde_json::json!({
            "agents": [
                {
                    "id": "a1",
                    "role": "Analyst",
                    "stage": 1,
                    "providerBinding": {"provider": "openai", "model": "gpt-4o-mini", "temperature": 0.0, "maxOutputTokens": null},
                    "systemPrompt": "s",
                    "priority": "core",
                    "dependencies": [],
                    "evidenceBindings": [],
                    "enabled": true
                }
            ],
            "profiles": {},
            "providerKeys": {}
        });
        tokio::fs::write(&catalogue_path, doc.to_string()).await.unwrap();

        let engine = Engine::load(&catalogue_path, &state_path, HashMap::new(), 2).await.unwrap();
        assert_eq!(engine.config().list().len(), 1);
    }
}
