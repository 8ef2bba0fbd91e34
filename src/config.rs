//! Persisted agent catalogue and overrides document (spec §4.1, §6).
//!
//! [`ConfigRegistry`] loads a single JSON document at startup and serves two
//! read paths (`list`, `enabled_for`) plus two write paths
//! (`apply_profile`, `save_overrides`), both of which persist atomically via
//! write-to-temp + rename. Reads never block on a writer: the document is
//! held behind a `tokio::sync::RwLock`, matching the "read-mostly, writes
//! serialised by an internal lock" policy in spec §5.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::model::AgentSpec;

/// A named enabled-set override bundle (spec §3 "Profile").
pub type Profile = HashMap<String, bool>;

/// On-disk layout for the overrides + profile document (spec §6 "Persisted state").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    #[serde(rename = "selectedProfile")]
    selected_profile: String,
    overrides: Profile,
    profiles: HashMap<String, Profile>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            selected_profile: "default".to_string(),
            overrides: Profile::new(),
            profiles: HashMap::new(),
        }
    }
}

/// Top-level document schema loaded at startup (spec §4.1 "Schema").
#[derive(Debug, Clone, Deserialize)]
struct AgentCatalogueDocument {
    agents: Vec<AgentSpec>,
    #[serde(default)]
    profiles: HashMap<String, Profile>,
    #[serde(default)]
    #[allow(dead_code)] // credential handles are resolved by the caller, not stored here
    provider_keys: HashMap<String, String>,
}

/// Loads and serves the agent catalogue; the sole owner of every [`AgentSpec`].
pub struct ConfigRegistry {
    specs: Vec<AgentSpec>,
    profiles: HashMap<String, Profile>,
    catalogue_path: PathBuf,
    state_path: PathBuf,
    state: RwLock<PersistedState>,
}

impl ConfigRegistry {
    /// Load the agent catalogue from `catalogue_path` and the overrides
    /// document from `state_path` (created with defaults if absent).
    pub async fn load(
        catalogue_path: impl AsRef<Path>,
        state_path: impl AsRef<Path>,
    ) -> Result<Self, EngineError> {
        let catalogue_path = catalogue_path.as_ref().to_path_buf();
        let state_path = state_path.as_ref().to_path_buf();

        let raw = tokio::fs::read_to_string(&catalogue_path)
            .await
            .map_err(|e| EngineError::ConfigWriteError(format!("reading catalogue: {}", e)))?;
        let doc: AgentCatalogueDocument = serde_json::from_str(&raw)
            .map_err(|e| EngineError::ConfigWriteError(format!("parsing catalogue: {}", e)))?;

        validate(&doc.agents)?;

        let state = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| EngineError::ConfigWriteError(format!("parsing state: {}", e)))?,
            Err(_) => PersistedState::default(),
        };

        Ok(Self {
            specs: doc.agents,
            profiles: doc.profiles,
            catalogue_path,
            state_path,
            state: RwLock::new(state),
        })
    }

    /// All loaded specs, in catalogue order.
    pub fn list(&self) -> &[AgentSpec] {
        &self.specs
    }

    /// Resolve the enabled set for the active profile, with sparse `overrides`
    /// merged on top (spec §4.1 `enabledFor`).
    pub async fn enabled_for(
        &self,
        overrides: Option<&HashMap<String, bool>>,
    ) -> Result<Vec<Arc<AgentSpec>>, EngineError> {
        let state = self.state.read().await;
        let profile = self
            .profiles
            .get(&state.selected_profile)
            .cloned()
            .unwrap_or_default();

        let mut enabled_map: HashMap<&str, bool> = HashMap::new();
        for spec in &self.specs {
            enabled_map.insert(&spec.id, spec.enabled);
        }
        for (id, flag) in &profile {
            enabled_map.insert(id.as_str(), *flag);
        }
        for (id, flag) in &state.overrides {
            enabled_map.insert(id.as_str(), *flag);
        }
        if let Some(overrides) = overrides {
            for (id, flag) in overrides {
                if !self.specs.iter().any(|s| &s.id == id) {
                    return Err(EngineError::InvariantViolation(format!(
                        "unknown agent id in overrides: {}",
                        id
                    )));
                }
                enabled_map.insert(id.as_str(), *flag);
            }
        }

        // core agents can never be disabled by any override or profile (spec §4.1, §8 invariant 4).
        for spec in &self.specs {
            if spec.is_core() && enabled_map.get(spec.id.as_str()) == Some(&false) {
                return Err(EngineError::InvariantViolation(format!(
                    "core agent '{}' cannot be disabled",
                    spec.id
                )));
            }
        }

        Ok(self
            .specs
            .iter()
            .filter(|s| enabled_map.get(s.id.as_str()).copied().unwrap_or(s.enabled))
            .map(|s| Arc::new(s.clone()))
            .collect())
    }

    /// Switch the active profile and persist the change atomically.
    pub async fn apply_profile(&self, name: &str) -> Result<(), EngineError> {
        if !self.profiles.contains_key(name) {
            return Err(EngineError::ConfigWriteError(format!(
                "unknown profile: {}",
                name
            )));
        }
        let mut state = self.state.write().await;
        let previous = state.selected_profile.clone();
        state.selected_profile = name.to_string();
        if let Err(e) = self.persist(&state).await {
            state.selected_profile = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Merge sparse patches onto the persisted overrides and write atomically
    /// (spec §4.1 `saveOverrides`; spec §8 invariant 6 read-your-write).
    pub async fn save_overrides(&self, patch: HashMap<String, bool>) -> Result<(), EngineError> {
        for (id, flag) in &patch {
            let spec = self
                .specs
                .iter()
                .find(|s| &s.id == id)
                .ok_or_else(|| EngineError::ConfigWriteError(format!("unknown agent: {}", id)))?;
            if spec.is_core() && !flag {
                return Err(EngineError::InvariantViolation(format!(
                    "core agent '{}' cannot be disabled",
                    id
                )));
            }
        }

        let mut state = self.state.write().await;
        let previous = state.overrides.clone();
        state.overrides.extend(patch);
        if let Err(e) = self.persist(&state).await {
            state.overrides = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Reload the catalogue file from disk, validating the new spec set
    /// before replacing the in-memory copy.
    pub async fn reload(&mut self) -> Result<(), EngineError> {
        let raw = tokio::fs::read_to_string(&self.catalogue_path)
            .await
            .map_err(|e| EngineError::ConfigWriteError(format!("reading catalogue: {}", e)))?;
        let doc: AgentCatalogueDocument = serde_json::from_str(&raw)
            .map_err(|e| EngineError::ConfigWriteError(format!("parsing catalogue: {}", e)))?;
        validate(&doc.agents)?;
        self.specs = doc.agents;
        self.profiles = doc.profiles;
        Ok(())
    }

    async fn persist(&self, state: &PersistedState) -> Result<(), EngineError> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::ConfigWriteError(e.to_string()))?;
        let tmp_path = self.state_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serialized)
            .await
            .map_err(|e| EngineError::ConfigWriteError(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .map_err(|e| EngineError::ConfigWriteError(e.to_string()))?;
        Ok(())
    }
}

/// Reject cycles in `dependencies`, unknown provider bindings, negative
/// temperatures, and stages outside `{1,2,3,4}` (spec §4.1 `validate`).
pub fn validate(specs: &[AgentSpec]) -> Result<(), EngineError> {
    let ids: std::collections::HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();

    for spec in specs {
        if !(1..=4).contains(&spec.stage) {
            return Err(EngineError::InvariantViolation(format!(
                "agent '{}' has invalid stage {}",
                spec.id, spec.stage
            )));
        }
        if spec.provider_binding.temperature < 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "agent '{}' has negative temperature",
                spec.id
            )));
        }
        if !crate::llm::providers::KNOWN_PROVIDERS.contains(&spec.provider_binding.provider.as_str()) {
            return Err(EngineError::InvariantViolation(format!(
                "agent '{}' is bound to unknown provider '{}'",
                spec.id, spec.provider_binding.provider
            )));
        }
        for dep in &spec.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::InvariantViolation(format!(
                    "agent '{}' depends on unknown agent '{}'",
                    spec.id, dep
                )));
            }
        }
    }

    detect_cycle(specs)?;
    Ok(())
}

/// Depth-first cycle detection over the dependency graph.
fn detect_cycle(specs: &[AgentSpec]) -> Result<(), EngineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let by_id: HashMap<&str, &AgentSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = specs.iter().map(|s| (s.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a AgentSpec>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), EngineError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(EngineError::InvariantViolation(format!(
                    "dependency cycle detected at '{}'",
                    id
                )))
            }
            _ => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(spec) = by_id.get(id) {
            for dep in &spec.dependencies {
                visit(dep, by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for id in by_id.keys() {
        visit(id, &by_id, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, ProviderBinding};
    use std::collections::HashSet;

    fn spec(id: &str, stage: u8, deps: &[&str], priority: Priority) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            role: id.to_string(),
            stage,
            provider_binding: ProviderBinding {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                temperature: 0.0,
                max_output_tokens: None,
            },
            system_prompt: "prompt".to_string(),
            priority,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            evidence_bindings: vec![],
            enabled: true,
        }
    }

    #[test]
    fn validate_rejects_cycle() {
        let specs = vec![
            spec("a", 1, &["b"], Priority::Optional),
            spec("b", 2, &["a"], Priority::Optional),
        ];
        let err = validate(&specs).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn validate_rejects_bad_stage() {
        let specs = vec![spec("a", 5, &[], Priority::Optional)];
        assert!(validate(&specs).is_err());
    }

    #[test]
    fn validate_rejects_unknown_provider() {
        let mut bad = spec("a", 1, &[], Priority::Optional);
        bad.provider_binding.provider = "not-a-real-provider".to_string();
        let err = validate(&[bad]).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn validate_accepts_dag() {
        let specs = vec![
            spec("a", 1, &[], Priority::Core),
            spec("b", 2, &["a"], Priority::Optional),
        ];
        assert!(validate(&specs).is_ok());
    }

    #[tokio::test]
    async fn save_overrides_rejects_disabling_core() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue_path = dir.path().join("agents.json");
        let state_path = dir.path().join("state.json");

        let doc = serde_json::json!({
            "agents": [spec_json("core1", 1, HashSet::<String>::new(), "core")],
            "profiles": {},
            "providerKeys": {}
        });
        tokio::fs::write(&catalogue_path, doc.to_string()).await.unwrap();

        let registry = ConfigRegistry::load(&catalogue_path, &state_path).await.unwrap();
        let mut patch = HashMap::new();
        patch.insert("core1".to_string(), false);
        let err = registry.save_overrides(patch).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn save_overrides_is_read_your_write() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue_path = dir.path().join("agents.json");
        let state_path = dir.path().join("state.json");

        let doc = serde_json::json!({
            "agents": [
                spec_json("core1", 1, HashSet::<String>::new(), "core"),
                spec_json("opt1", 1, HashSet::<String>::new(), "optional"),
            ],
            "profiles": {},
            "providerKeys": {}
        });
        tokio::fs::write(&catalogue_path, doc.to_string()).await.unwrap();

        let registry = ConfigRegistry::load(&catalogue_path, &state_path).await.unwrap();
        let mut patch = HashMap::new();
        patch.insert("opt1".to_string(), false);
        registry.save_overrides(patch).await.unwrap();

        let enabled = registry.enabled_for(None).await.unwrap();
        assert!(!enabled.iter().any(|s| s.id == "opt1"));
        assert!(enabled.iter().any(|s| s.id == "core1"));
    }

    fn spec_json(id: &str, stage: u8, deps: HashSet<String>, priority: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "role": id,
            "stage": stage,
            "providerBinding": {
                "provider": "openai",
                "model": "gpt-4o-mini",
                "temperature": 0.0,
                "maxOutputTokens": null
            },
            "systemPrompt": "prompt",
            "priority": priority,
            "dependencies": deps,
            "evidenceBindings": [],
            "enabled": true
        })
    }
}
