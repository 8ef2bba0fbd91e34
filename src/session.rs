//! `SessionCoordinator`: owns one analysis request end-to-end (spec §4.8) —
//! builds the `StockContext`, runs the `StageScheduler`, aggregates the
//! final status, and wires cooperative cancellation through both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{error, info};
use uuid::Uuid;

use crate::config::ConfigRegistry;
use crate::error::EngineError;
use crate::event::{ProgressEvent, ProgressSink, SessionStatus};
use crate::evidence::EvidenceCollector;
use crate::governor::ConcurrencyGovernor;
use crate::llm::LLMClient;
use crate::model::{AgentRecord, AgentSpec, Quote, StockContext};
use crate::runner::CancelSource;
use crate::scheduler::{aggregate_status, StageScheduler};

/// The quote-snapshot provider key `SessionCoordinator` queries before
/// running any stage (spec §4.8 first bullet).
pub const QUOTE_PROVIDER_KEY: &str = "quote-snapshot";
const QUOTE_DEADLINE: Duration = Duration::from_secs(5);

/// What a client submits to start an analysis (spec §6 "POST analyze" body).
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    pub symbol: String,
    pub enabled_overrides: Option<HashMap<String, bool>>,
    pub operator_instructions: HashMap<String, String>,
    pub stages: Option<Vec<u8>>,
}

/// The finished session's externally visible shape (spec §3 `Session`).
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub stock_context: StockContext,
    pub records: HashMap<String, AgentRecord>,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub ended_at: SystemTime,
}

/// A handle a caller can use to cancel a running session (spec §4.8 "On
/// cancel"). Dropping it without calling `cancel` lets the session run to
/// completion normally.
pub struct SessionHandle {
    cancel_source: Arc<CancelSource>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel_source.cancel();
    }
}

/// Drives one `(symbol, overrides, instructions, stages)` request from
/// intake to `session_completed` (spec §4.8).
pub struct SessionCoordinator {
    config: Arc<ConfigRegistry>,
    evidence: Arc<EvidenceCollector>,
    governor: Arc<ConcurrencyGovernor>,
    llm_clients: HashMap<String, Arc<dyn LLMClient>>,
}

impl SessionCoordinator {
    pub fn new(
        config: Arc<ConfigRegistry>,
        evidence: Arc<EvidenceCollector>,
        governor: Arc<ConcurrencyGovernor>,
        llm_clients: HashMap<String, Arc<dyn LLMClient>>,
    ) -> Self {
        Self {
            config,
            evidence,
            governor,
            llm_clients,
        }
    }

    /// Run one session to completion, publishing every progress event to
    /// `sink`. Returns the aggregate outcome; `SessionHandle` lets a caller
    /// cancel it from another task.
    pub async fn run(
        &self,
        request: AnalyzeRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> (SessionHandle, tokio::task::JoinHandle<Result<SessionOutcome, EngineError>>) {
        let session_id = Uuid::new_v4();
        let (cancel_source, cancel_token) = CancelSource::new();
        let cancel_source = Arc::new(cancel_source);
        let handle = SessionHandle {
            cancel_source: cancel_source.clone(),
        };

        let config = self.config.clone();
        let evidence = self.evidence.clone();
        let governor = self.governor.clone();
        let llm_clients = self.llm_clients.clone();

        let join = tokio::spawn(async move {
            info!("session {} started for symbol {}", session_id, request.symbol);
            let created_at = SystemTime::now();

            let enabled = config.enabled_for(request.enabled_overrides.as_ref()).await?;
            let enabled: Vec<Arc<AgentSpec>> = match &request.stages {
                Some(stages) => enabled
                    .into_iter()
                    .filter(|s| stages.contains(&s.stage))
                    .collect(),
                None => enabled,
            };

            let stock_context = match fetch_stock_context(&evidence, &request.symbol).await {
                Ok(ctx) => ctx,
                Err(err) => {
                    error!("session {} could not obtain stock data: {}", session_id, err);
                    sink.emit(ProgressEvent::SessionCompleted {
                        status: SessionStatus::Error,
                    })
                    .await;
                    return Err(err);
                }
            };

            let scheduler = StageScheduler::new(evidence, governor, llm_clients, sink.clone());
            let mut records = HashMap::new();
            scheduler
                .run(
                    &enabled,
                    &stock_context,
                    &request.operator_instructions,
                    cancel_token.clone(),
                    &mut records,
                )
                .await;

            let status = if cancel_token.is_cancelled() {
                SessionStatus::Cancelled
            } else {
                aggregate_status(&enabled, &records)
            };

            sink.emit(ProgressEvent::SessionCompleted { status }).await;
            info!("session {} completed with status {:?}", session_id, status);

            Ok(SessionOutcome {
                session_id,
                stock_context,
                records,
                status,
                created_at,
                ended_at: SystemTime::now(),
            })
        });

        (handle, join)
    }
}

/// Fetch the quote snapshot that seeds every agent's prompt (spec §4.8 first
/// bullet). Any failure — missing provider, transport error, or deadline
/// exceeded — becomes `NoStockData`; the session aborts before any LLM call.
async fn fetch_stock_context(
    evidence: &EvidenceCollector,
    symbol: &str,
) -> Result<StockContext, EngineError> {
    let quote_spec = quote_probe_spec(symbol);
    let bundle = tokio::time::timeout(QUOTE_DEADLINE, evidence.collect(&quote_spec, symbol))
        .await
        .map_err(|_| EngineError::NoStockData(symbol.to_string()))?;

    let entry = bundle
        .entries
        .first()
        .filter(|e| e.sample_description != "unavailable")
        .ok_or_else(|| EngineError::NoStockData(symbol.to_string()))?;

    let quote: Quote = serde_json::from_value(entry.raw.clone())
        .map_err(|_| EngineError::NoStockData(symbol.to_string()))?;

    let name = entry
        .raw
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(symbol)
        .to_string();

    Ok(StockContext {
        symbol: symbol.to_string(),
        name,
        quote,
        extra: Vec::new(),
    })
}

/// A minimal, throwaway `AgentSpec` used only to drive `EvidenceCollector`
/// against the quote-snapshot provider — never scheduled, never surfaced.
fn quote_probe_spec(symbol: &str) -> AgentSpec {
    use crate::model::{EvidenceBinding, Priority, ProviderBinding};
    AgentSpec {
        id: format!("__quote_probe_{}", symbol),
        role: "quote probe".to_string(),
        stage: 0,
        provider_binding: ProviderBinding {
            provider: "none".to_string(),
            model: "none".to_string(),
            temperature: 0.0,
            max_output_tokens: None,
        },
        system_prompt: String::new(),
        priority: Priority::Optional,
        dependencies: Default::default(),
        evidence_bindings: vec![EvidenceBinding {
            provider_key: QUOTE_PROVIDER_KEY.to_string(),
            label: "quote".to_string(),
            transformer_id: None,
        }],
        enabled: true,
    }
}
