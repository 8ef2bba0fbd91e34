//! Evidence gathering: the `EvidenceProvider` collaborator contract and the
//! `EvidenceCollector` that interprets an [`AgentSpec::evidence_bindings`]
//! table against it (spec §4.2, §9 "data-driven dispatch").
//!
//! Adding a new agent requires only a new spec and, if needed, a new
//! [`EvidenceProvider`] registration — never a per-agent branch here.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::Mutex;

use crate::model::{AgentSpec, EvidenceBundle, EvidenceEntry};

/// Default per-provider deadline (spec §4.2).
pub const DEFAULT_PROVIDER_DEADLINE: Duration = Duration::from_secs(10);

/// A replaceable market-data / reference-data collaborator keyed by
/// `evidence_bindings[i].provider_key` (spec §1 "Out of scope").
///
/// Implementations are expected to be cheap to call repeatedly and must not
/// block the LLM call on failure — the collector converts any `Err` or
/// timeout into an `unavailable` entry.
#[async_trait]
pub trait EvidenceProvider: Send + Sync {
    /// Fetch raw evidence for `symbol`, returning a count and a short sample
    /// description alongside the raw JSON payload.
    async fn fetch(
        &self,
        symbol: &str,
        agent_id: &str,
    ) -> Result<(usize, String, serde_json::Value), Box<dyn Error + Send + Sync>>;
}

/// Registry of evidence providers keyed by provider key, plus the
/// at-most-one-concurrent-invocation-per-`(agentId, providerKey)` guarantee
/// from spec §4.2.
pub struct EvidenceCollector {
    providers: HashMap<String, Arc<dyn EvidenceProvider>>,
    deadline: Duration,
    inflight: Mutex<HashMap<(String, String), ()>>,
}

impl EvidenceCollector {
    pub fn new(providers: HashMap<String, Arc<dyn EvidenceProvider>>) -> Self {
        Self {
            providers,
            deadline: DEFAULT_PROVIDER_DEADLINE,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Gather evidence for `spec` against `symbol`, invoking every bound
    /// provider in parallel. Order of the returned bundle matches
    /// `spec.evidence_bindings` regardless of completion order.
    pub async fn collect(&self, spec: &AgentSpec, symbol: &str) -> EvidenceBundle {
        let mut tasks = Vec::with_capacity(spec.evidence_bindings.len());

        for binding in &spec.evidence_bindings {
            let key = (spec.id.clone(), binding.provider_key.clone());
            {
                let mut inflight = self.inflight.lock().await;
                if inflight.contains_key(&key) {
                    warn!(
                        "evidence provider '{}' already in flight for agent '{}', skipping duplicate",
                        binding.provider_key, spec.id
                    );
                    continue;
                }
                inflight.insert(key.clone(), ());
            }

            let provider = self.providers.get(&binding.provider_key).cloned();
            let label = binding.label.clone();
            let symbol = symbol.to_string();
            let agent_id = spec.id.clone();
            let deadline = self.deadline;

            tasks.push(async move {
                let entry = match provider {
                    Some(provider) => {
                        match tokio::time::timeout(deadline, provider.fetch(&symbol, &agent_id)).await
                        {
                            Ok(Ok((count, sample, raw))) => EvidenceEntry {
                                label: label.clone(),
                                count,
                                sample_description: sample,
                                raw,
                            },
                            Ok(Err(e)) => {
                                warn!("evidence provider '{}' failed for {}: {}", label, agent_id, e);
                                unavailable(label.clone())
                            }
                            Err(_) => {
                                warn!(
                                    "evidence provider '{}' exceeded {:?} deadline for {}",
                                    label, deadline, agent_id
                                );
                                unavailable(label.clone())
                            }
                        }
                    }
                    None => {
                        warn!("no evidence provider registered for key '{}'", label);
                        unavailable(label.clone())
                    }
                };
                (key, entry)
            });
        }

        let results = futures_util::future::join_all(tasks).await;
        let mut inflight = self.inflight.lock().await;
        let mut entries = Vec::with_capacity(results.len());
        for (key, entry) in results {
            inflight.remove(&key);
            entries.push(entry);
        }
        drop(inflight);

        EvidenceBundle { entries }
    }
}

fn unavailable(label: String) -> EvidenceEntry {
    EvidenceEntry {
        label,
        count: 0,
        sample_description: "unavailable".to_string(),
        raw: serde_json::Value::Null,
    }
}
