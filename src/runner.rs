//! `AgentRunner`: executes one agent end-to-end — evidence → prompt → LLM →
//! emit result — enforcing the per-agent deadline and retry policy of
//! spec §4.5.
//!
//! ```text
//!   idle → fetching_evidence → assembling → awaiting_budget → calling_llm
//!                                                            ├→ success
//!                                                            ├→ timeout     (→ retry or error)
//!                                                            ├→ refused     (→ error)
//!                                                            └→ cancelled   (→ cancelled)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::EngineError;
use crate::evidence::EvidenceCollector;
use crate::event::{ProgressEvent, ProgressSink};
use crate::governor::ConcurrencyGovernor;
use crate::llm::{retry::call_with_policy, LLMClient, LlmRequest, DEFAULT_MAX_OUTPUT_TOKENS_CAP};
use crate::model::{AgentRecord, AgentSpec, AgentStatus, PriorOutputs, StockContext};
use crate::prompt::build_prompt;

/// Default total per-agent deadline (spec §4.5).
pub const DEFAULT_AGENT_DEADLINE: Duration = Duration::from_secs(180);
/// Default per-LLM-call deadline (spec §5 "Timeouts").
pub const DEFAULT_LLM_CALL_DEADLINE: Duration = Duration::from_secs(120);

/// A cooperative, session-wide cancellation signal (spec §5 "Cancellation
/// semantics"). Cloned cheaply; every suspension point polls it via
/// `tokio::select!`.
#[derive(Clone)]
pub struct CancelToken(tokio::sync::watch::Receiver<bool>);

pub struct CancelSource(tokio::sync::watch::Sender<bool>);

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (Self(tx), CancelToken(rx))
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    async fn cancelled(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Runs a single agent. Consumed by the `StageScheduler`'s batch loop
/// (spec §4.6); one instance per agent invocation.
pub struct AgentRunner {
    pub spec: Arc<AgentSpec>,
    evidence: Arc<EvidenceCollector>,
    governor: Arc<ConcurrencyGovernor>,
    llm_clients: std::collections::HashMap<String, Arc<dyn LLMClient>>,
    sink: Arc<dyn ProgressSink>,
    agent_deadline: Duration,
    llm_call_deadline: Duration,
}

impl AgentRunner {
    pub fn new(
        spec: Arc<AgentSpec>,
        evidence: Arc<EvidenceCollector>,
        governor: Arc<ConcurrencyGovernor>,
        llm_clients: std::collections::HashMap<String, Arc<dyn LLMClient>>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            spec,
            evidence,
            governor,
            llm_clients,
            sink,
            agent_deadline: DEFAULT_AGENT_DEADLINE,
            llm_call_deadline: DEFAULT_LLM_CALL_DEADLINE,
        }
    }

    pub fn with_deadlines(mut self, agent_deadline: Duration, llm_call_deadline: Duration) -> Self {
        self.agent_deadline = agent_deadline;
        self.llm_call_deadline = llm_call_deadline;
        self
    }

    /// Run this agent to completion, writing exactly one terminal state into
    /// `record`. Re-entry (calling this twice on the same record) is a
    /// programming error the scheduler must not commit.
    pub async fn run(
        &self,
        record: &mut AgentRecord,
        stock: &StockContext,
        prior_outputs: PriorOutputs,
        upstream_labels: Vec<(String, String)>,
        operator_instruction: Option<String>,
        mut cancel: CancelToken,
    ) {
        debug_assert!(!record.status.is_terminal(), "re-entry into a terminal AgentRecord");

        let agent_budget_start = Instant::now();
        record.started_at = Some(chrono::Utc::now());
        record.status = AgentStatus::FetchingEvidence;
        self.sink
            .emit(ProgressEvent::AgentStarted {
                agent_id: self.spec.id.clone(),
            })
            .await;
        debug!("agent '{}' started", self.spec.id);

        if cancel.is_cancelled() {
            self.finish_cancelled(record).await;
            return;
        }

        let evidence = self.evidence.collect(&self.spec, &stock.symbol).await;
        let unavailable = evidence.unavailable_count();
        record.evidence_bundle = Some(evidence.clone());
        record.status = AgentStatus::Assembling;
        self.sink
            .emit(ProgressEvent::AgentEvidenceReady {
                agent_id: self.spec.id.clone(),
                sources_unavailable: unavailable,
            })
            .await;

        // Snapshot taken here is what the PromptBuilder sees; it is never
        // mutated again for this call (spec §5 ordering guarantee).
        let assembled = build_prompt(
            &self.spec,
            stock,
            &evidence,
            &prior_outputs,
            &upstream_labels,
            operator_instruction.as_deref(),
        );
        record.prompt_chars = Some(assembled.user_prompt_chars());

        let remaining = self
            .agent_deadline
            .checked_sub(agent_budget_start.elapsed())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            self.finish_error(record, EngineError::Timeout("agent budget exhausted before LLM call".to_string()))
                .await;
            return;
        }

        let client = match self.llm_clients.get(&self.spec.provider_binding.provider) {
            Some(c) => c.clone(),
            None => {
                self.finish_error(
                    record,
                    EngineError::AuthMissing(self.spec.provider_binding.provider.clone()),
                )
                .await;
                return;
            }
        };

        // Fail fast on a missing credential before AwaitingBudget: an
        // unauthenticated agent must never consume a governor token (spec §6).
        if !client.is_authenticated() {
            self.finish_error(
                record,
                EngineError::AuthMissing(self.spec.provider_binding.provider.clone()),
            )
            .await;
            return;
        }

        record.status = AgentStatus::AwaitingBudget;
        let governor_wait = async {
            self.governor.acquire(&self.spec.provider_binding.provider).await
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.finish_cancelled(record).await;
                return;
            }
            permit = governor_wait => permit,
        };

        record.status = AgentStatus::CallingLlm;
        record.attempt = 1;

        // A per-binding override may only lower the process-wide cap, never
        // raise it — otherwise a misconfigured override reintroduces the
        // hard 4xx refusals the cap exists to prevent (spec §4.4 Policy,
        // §8 scenario 3).
        let cap = self
            .spec
            .provider_binding
            .max_output_tokens
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS_CAP)
            .min(DEFAULT_MAX_OUTPUT_TOKENS_CAP);
        let request = LlmRequest {
            provider: self.spec.provider_binding.provider.clone(),
            model: self.spec.provider_binding.model.clone(),
            system_prompt: assembled.system_prompt.clone(),
            user_prompt: assembled.user_prompt.clone(),
            temperature: self.spec.provider_binding.temperature,
            max_output_tokens: cap,
        };

        let per_call_deadline = std::cmp::min(self.llm_call_deadline, remaining);

        let call_future = call_with_policy(client.as_ref(), &request, cap, per_call_deadline);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(permit);
                self.finish_cancelled(record).await;
                return;
            }
            outcome = call_future => outcome,
        };
        drop(permit);

        match outcome {
            Ok(response) => {
                record.output_text = Some(response.text.clone());
                self.finish_success(record, response.text.len()).await;
            }
            Err(EngineError::Timeout(msg)) => {
                // Agent-level retry: one additional attempt if budget allows
                // (spec §4.5 "Retry loop"), independent of the client's own
                // retry policy inside `call_with_policy`.
                let remaining_after = self
                    .agent_deadline
                    .checked_sub(agent_budget_start.elapsed())
                    .unwrap_or(Duration::ZERO);
                if remaining_after.is_zero() {
                    warn!("agent '{}' exhausted its deadline after a timeout: {}", self.spec.id, msg);
                    self.finish_error(record, EngineError::Timeout(msg)).await;
                    return;
                }
                record.attempt = 2;
                let permit = self.governor.acquire(&self.spec.provider_binding.provider).await;
                let retry_deadline = std::cmp::min(self.llm_call_deadline, remaining_after);
                let retried = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        drop(permit);
                        self.finish_cancelled(record).await;
                        return;
                    }
                    outcome = call_with_policy(client.as_ref(), &request, cap, retry_deadline) => outcome,
                };
                drop(permit);
                match retried {
                    Ok(response) => {
                        record.output_text = Some(response.text.clone());
                        self.finish_success(record, response.text.len()).await;
                    }
                    Err(e) => self.finish_error(record, e).await,
                }
            }
            Err(e) => self.finish_error(record, e).await,
        }
    }

    async fn finish_success(&self, record: &mut AgentRecord, output_chars: usize) {
        record.ended_at = Some(chrono::Utc::now());
        record.status = AgentStatus::Success;
        debug!("agent '{}' succeeded ({} chars)", self.spec.id, output_chars);
        self.sink
            .emit(ProgressEvent::AgentCompleted {
                agent_id: self.spec.id.clone(),
                output_chars,
            })
            .await;
    }

    async fn finish_error(&self, record: &mut AgentRecord, err: EngineError) {
        record.ended_at = Some(chrono::Utc::now());
        record.status = match &err {
            EngineError::Timeout(_) => AgentStatus::Timeout,
            EngineError::ProviderRefused { .. } | EngineError::TokenLimitExceeded { .. } => {
                AgentStatus::Refused
            }
            _ => AgentStatus::Failed,
        };
        record.error_kind = Some(err.kind_tag().to_string());
        record.error_message = Some(err.to_string());
        error!("agent '{}' failed: {}", self.spec.id, err);
        self.sink
            .emit(ProgressEvent::agent_failed(self.spec.id.clone(), &err))
            .await;
    }

    async fn finish_cancelled(&self, record: &mut AgentRecord) {
        record.ended_at = Some(chrono::Utc::now());
        record.status = AgentStatus::Cancelled;
        self.sink
            .emit(ProgressEvent::AgentCancelled {
                agent_id: self.spec.id.clone(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionStatus;
    use crate::governor::governor_for_providers;
    use crate::llm::{LlmResponse, LlmUsage};
    use crate::model::{Priority, ProviderBinding, Quote};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<ProgressEvent>>);
    impl RecordingSink {
        fn new() -> Self {
            Self(StdMutex::new(Vec::new()))
        }
    }
    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct AlwaysSucceeds;
    #[async_trait]
    impl LLMClient for AlwaysSucceeds {
        async fn call(&self, request: &LlmRequest, _deadline: Duration) -> Result<LlmResponse, EngineError> {
            Ok(LlmResponse {
                text: format!("analysis for {}", request.model),
                usage: LlmUsage::default(),
                provider_code: "200".to_string(),
            })
        }
    }

    struct AlwaysTimesOut;
    #[async_trait]
    impl LLMClient for AlwaysTimesOut {
        async fn call(&self, _request: &LlmRequest, _deadline: Duration) -> Result<LlmResponse, EngineError> {
            Err(EngineError::Timeout("simulated".to_string()))
        }
    }

    struct Unauthenticated;
    #[async_trait]
    impl LLMClient for Unauthenticated {
        fn is_authenticated(&self) -> bool {
            false
        }

        async fn call(&self, _request: &LlmRequest, _deadline: Duration) -> Result<LlmResponse, EngineError> {
            panic!("call must never be reached for an unauthenticated client");
        }
    }

    fn spec(id: &str, priority: Priority) -> Arc<AgentSpec> {
        Arc::new(AgentSpec {
            id: id.to_string(),
            role: id.to_string(),
            stage: 1,
            provider_binding: ProviderBinding {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                temperature: 0.0,
                max_output_tokens: None,
            },
            system_prompt: "system".to_string(),
            priority,
            dependencies: Default::default(),
            evidence_bindings: vec![],
            enabled: true,
        })
    }

    fn stock() -> StockContext {
        StockContext {
            symbol: "600519".to_string(),
            name: "Moutai".to_string(),
            quote: Quote {
                price: "1".to_string(),
                open: "1".to_string(),
                high: "1".to_string(),
                low: "1".to_string(),
                change: "0".to_string(),
            },
            extra: vec![],
        }
    }

    fn runner_with_client(
        spec: Arc<AgentSpec>,
        client: Arc<dyn LLMClient>,
        sink: Arc<dyn ProgressSink>,
    ) -> AgentRunner {
        let evidence = Arc::new(EvidenceCollector::new(HashMap::new()));
        let governor = Arc::new(governor_for_providers(2, vec!["openai".to_string()]));
        let mut clients: std::collections::HashMap<String, Arc<dyn LLMClient>> = HashMap::new();
        clients.insert("openai".to_string(), client);
        AgentRunner::new(spec, evidence, governor, clients, sink)
    }

    #[tokio::test]
    async fn successful_agent_emits_started_evidence_completed() {
        let sink = Arc::new(RecordingSink::new());
        let runner = runner_with_client(spec("funds", Priority::Optional), Arc::new(AlwaysSucceeds), sink.clone());
        let (_src, cancel) = CancelSource::new();

        let mut record = AgentRecord::new("funds");
        runner
            .run(&mut record, &stock(), PriorOutputs::new(), vec![], None, cancel)
            .await;

        assert_eq!(record.status, AgentStatus::Success);
        assert!(record.output_text.is_some());
        let events = sink.0.lock().unwrap();
        assert!(matches!(events[0], ProgressEvent::AgentStarted { .. }));
        assert!(matches!(events[1], ProgressEvent::AgentEvidenceReady { .. }));
        assert!(matches!(events.last().unwrap(), ProgressEvent::AgentCompleted { .. }));
    }

    #[tokio::test]
    async fn retries_once_then_fails_on_persistent_timeout() {
        let sink = Arc::new(RecordingSink::new());
        let runner = runner_with_client(spec("funds", Priority::Optional), Arc::new(AlwaysTimesOut), sink);
        let (_src, cancel) = CancelSource::new();

        let mut record = AgentRecord::new("funds");
        runner
            .run(&mut record, &stock(), PriorOutputs::new(), vec![], None, cancel)
            .await;

        assert_eq!(record.status, AgentStatus::Timeout);
        assert_eq!(record.attempt, 2);
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_cancelled_not_failed() {
        let sink = Arc::new(RecordingSink::new());
        let runner = runner_with_client(spec("funds", Priority::Optional), Arc::new(AlwaysSucceeds), sink);
        let (src, cancel) = CancelSource::new();
        src.cancel();

        let mut record = AgentRecord::new("funds");
        runner
            .run(&mut record, &stock(), PriorOutputs::new(), vec![], None, cancel)
            .await;

        assert_eq!(record.status, AgentStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_provider_client_fails_fast_without_governor_token() {
        let sink = Arc::new(RecordingSink::new());
        let spec = spec("funds", Priority::Optional);
        let evidence = Arc::new(EvidenceCollector::new(HashMap::new()));
        let governor = Arc::new(governor_for_providers(2, vec!["openai".to_string()]));
        let runner = AgentRunner::new(spec, evidence, governor, HashMap::new(), sink);
        let (_src, cancel) = CancelSource::new();

        let mut record = AgentRecord::new("funds");
        runner
            .run(&mut record, &stock(), PriorOutputs::new(), vec![], None, cancel)
            .await;

        assert_eq!(record.status, AgentStatus::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("AuthMissing"));
    }

    #[tokio::test]
    async fn unauthenticated_client_fails_fast_without_acquiring_governor_token() {
        let sink = Arc::new(RecordingSink::new());
        let spec = spec("funds", Priority::Optional);
        let evidence = Arc::new(EvidenceCollector::new(HashMap::new()));
        // Zero capacity: if `run` ever called `governor.acquire`, it would
        // block forever and the surrounding timeout below would fire.
        let governor = Arc::new(governor_for_providers(0, vec!["openai".to_string()]));
        let mut clients: std::collections::HashMap<String, Arc<dyn LLMClient>> = HashMap::new();
        clients.insert("openai".to_string(), Arc::new(Unauthenticated));
        let runner = AgentRunner::new(spec, evidence, governor, clients, sink);
        let (_src, cancel) = CancelSource::new();

        let mut record = AgentRecord::new("funds");
        tokio::time::timeout(
            Duration::from_secs(2),
            runner.run(&mut record, &stock(), PriorOutputs::new(), vec![], None, cancel),
        )
        .await
        .expect("run must not block on the governor for an unauthenticated client");

        assert_eq!(record.status, AgentStatus::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("AuthMissing"));
    }

    #[allow(dead_code)]
    fn _unused_status_marker() -> SessionStatus {
        SessionStatus::Success
    }
}
