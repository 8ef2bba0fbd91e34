//! `StageScheduler`: partitions enabled agents by stage, selects the
//! dependency-satisfied subset for each stage, and runs them in
//! `B_stage`-sized batches with a hard barrier between stages (spec §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::event::{ProgressEvent, ProgressSink};
use crate::evidence::EvidenceCollector;
use crate::governor::ConcurrencyGovernor;
use crate::llm::LLMClient;
use crate::model::{AgentRecord, AgentSpec, AgentStatus, PriorOutputs, StockContext};
use crate::runner::{AgentRunner, CancelToken};

/// Batch size per stage, tunable (spec §4.6 "B_stage policy"). Bounding
/// stage 3 is the primary remedy for provider stalls when several long
/// prompts land on the same API key at once.
#[derive(Debug, Clone, Copy)]
pub struct BatchSizes {
    pub stage1: usize,
    pub stage2: usize,
    pub stage3: usize,
    pub stage4: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            stage1: 4,
            stage2: 2,
            stage3: 2,
            stage4: 1,
        }
    }
}

impl BatchSizes {
    fn for_stage(&self, stage: u8) -> usize {
        match stage {
            1 => self.stage1,
            2 => self.stage2,
            3 => self.stage3,
            4 => self.stage4,
            _ => 1,
        }
    }
}

pub struct StageScheduler {
    evidence: Arc<EvidenceCollector>,
    governor: Arc<ConcurrencyGovernor>,
    llm_clients: HashMap<String, Arc<dyn LLMClient>>,
    sink: Arc<dyn ProgressSink>,
    batch_sizes: BatchSizes,
}

impl StageScheduler {
    pub fn new(
        evidence: Arc<EvidenceCollector>,
        governor: Arc<ConcurrencyGovernor>,
        llm_clients: HashMap<String, Arc<dyn LLMClient>>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            evidence,
            governor,
            llm_clients,
            sink,
            batch_sizes: BatchSizes::default(),
        }
    }

    pub fn with_batch_sizes(mut self, batch_sizes: BatchSizes) -> Self {
        self.batch_sizes = batch_sizes;
        self
    }

    /// Run `enabled` (already filtered for the active profile/overrides)
    /// against `stock`, writing terminal state into `records` and publishing
    /// progress through the session's sink.
    ///
    /// `operator_instructions` carries a per-agent operator instruction
    /// string keyed by agent id.
    pub async fn run(
        &self,
        enabled: &[Arc<AgentSpec>],
        stock: &StockContext,
        operator_instructions: &HashMap<String, String>,
        cancel: CancelToken,
        records: &mut HashMap<String, AgentRecord>,
    ) {
        let role_by_id: HashMap<String, String> = enabled
            .iter()
            .map(|s| (s.id.clone(), s.role.clone()))
            .collect();

        let mut by_stage: HashMap<u8, Vec<Arc<AgentSpec>>> = HashMap::new();
        for spec in enabled {
            by_stage.entry(spec.stage).or_default().push(spec.clone());
        }

        for stage in 1..=4u8 {
            let Some(specs) = by_stage.get(&stage) else {
                continue;
            };
            if specs.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                for spec in specs {
                    cancel_without_running(records, &spec.id);
                }
                continue;
            }

            self.sink.emit(ProgressEvent::StageStarted { stage }).await;
            info!("stage {} started with {} agents", stage, specs.len());

            // Only dependencies that actually ran (successfully or not) ever
            // appear here — an id absent from `records` was never scheduled
            // (disabled by an override) and contributes nothing (spec §8
            // scenario 5).
            let prior_outputs: PriorOutputs = records
                .iter()
                .filter_map(|(id, record)| match &record.status {
                    AgentStatus::Success => {
                        Some((id.clone(), record.output_text.clone().unwrap_or_default()))
                    }
                    s if s.is_terminal() => Some((id.clone(), String::new())),
                    _ => None,
                })
                .collect();

            let batch_size = self.batch_sizes.for_stage(stage).max(1);
            for batch in specs.chunks(batch_size) {
                let mut handles = Vec::with_capacity(batch.len());
                for spec in batch {
                    let runner = AgentRunner::new(
                        spec.clone(),
                        self.evidence.clone(),
                        self.governor.clone(),
                        self.llm_clients.clone(),
                        self.sink.clone(),
                    );
                    let mut record = AgentRecord::new(spec.id.clone());
                    let upstream_labels: Vec<(String, String)> = spec
                        .dependencies
                        .iter()
                        .filter_map(|id| role_by_id.get(id).map(|role| (id.clone(), role.clone())))
                        .collect();
                    let prior_outputs = prior_outputs.clone();
                    let operator_instruction = operator_instructions.get(&spec.id).cloned();
                    let cancel = cancel.clone();
                    let stock = stock.clone();

                    handles.push(tokio::spawn(async move {
                        runner
                            .run(
                                &mut record,
                                &stock,
                                prior_outputs,
                                upstream_labels,
                                operator_instruction,
                                cancel,
                            )
                            .await;
                        record
                    }));
                }

                for handle in handles {
                    match handle.await {
                        Ok(record) => {
                            records.insert(record.agent_id.clone(), record);
                        }
                        Err(join_err) => {
                            // A runner task panicked; surface as a failed record
                            // rather than silently dropping the agent.
                            log::error!("agent task panicked: {}", join_err);
                        }
                    }
                }
            }

            self.sink.emit(ProgressEvent::StageCompleted { stage }).await;
            info!("stage {} completed", stage);
        }
    }
}

fn cancel_without_running(records: &mut HashMap<String, AgentRecord>, agent_id: &str) {
    let mut record = AgentRecord::new(agent_id);
    record.status = AgentStatus::Cancelled;
    records.insert(agent_id.to_string(), record);
}

/// Aggregate the session-level terminal status from completed records (spec
/// §4.6 step 3 and §8): success requires every `core` agent to have
/// succeeded and at least the configured minimum per stage to have
/// succeeded; a failed core agent is always `Error`.
pub fn aggregate_status(
    specs: &[Arc<AgentSpec>],
    records: &HashMap<String, AgentRecord>,
) -> crate::event::SessionStatus {
    use crate::event::SessionStatus;

    let mut any_cancelled = false;
    let mut any_non_core_failure = false;

    for spec in specs {
        let Some(record) = records.get(&spec.id) else {
            continue;
        };
        match record.status {
            AgentStatus::Cancelled => any_cancelled = true,
            AgentStatus::Success => {}
            _ if spec.is_core() => return SessionStatus::Error,
            _ => any_non_core_failure = true,
        }
    }

    if any_cancelled {
        return SessionStatus::Cancelled;
    }
    if any_non_core_failure {
        return SessionStatus::Partial;
    }
    SessionStatus::Success
}
