//! Core data model: [`AgentSpec`], [`StockContext`], [`EvidenceBundle`], and
//! the session-scoped [`AgentRecord`].
//!
//! Ownership mirrors the design notes: [`crate::config::ConfigRegistry`] is
//! the sole owner of [`AgentSpec`] instances (consumers hold `Arc<AgentSpec>`
//! read-only references); a [`crate::session::Session`] is the sole owner of
//! its [`AgentRecord`]s, with exactly one [`crate::runner::AgentRunner`]
//! writing to any given record.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative importance of an agent within its stage.
///
/// `Core` agents can never be disabled (spec §4.1, §8 invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Core,
    Important,
    Optional,
}

/// The `{provider, model, temperature, maxOutputTokens}` tuple attached to an
/// agent spec (spec §3, §6 "Wire contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBinding {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    /// Per-binding override of the process-wide default cap (spec §9 OQ3).
    /// `None` means "use [`crate::llm::DEFAULT_MAX_OUTPUT_TOKENS_CAP`]".
    pub max_output_tokens: Option<u32>,
}

/// One entry in an [`AgentSpec::evidence_bindings`] table: a provider key, the
/// label shown in the prompt's evidence block, and an optional transformer id
/// the `EvidenceCollector` can use to post-process raw payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBinding {
    pub provider_key: String,
    pub label: String,
    pub transformer_id: Option<String>,
}

/// The static description of one analyst role (spec §3 `AgentSpec`).
///
/// Immutable after `ConfigRegistry` loads it; `dependencies` names agent ids
/// whose outputs must be present (successful) before this agent may be
/// considered runnable, and every dependency must live in an earlier stage
/// (validated at load, see [`crate::config::validate`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    pub stage: u8,
    pub provider_binding: ProviderBinding,
    pub system_prompt: String,
    pub priority: Priority,
    pub dependencies: HashSet<String>,
    pub evidence_bindings: Vec<EvidenceBinding>,
    pub enabled: bool,
}

impl AgentSpec {
    pub fn is_core(&self) -> bool {
        matches!(self.priority, Priority::Core)
    }
}

/// Quote snapshot plus an opaque extra-fields map the `PromptBuilder` formats
/// verbatim (spec §3 `StockContext`). Immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub price: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub change: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockContext {
    pub symbol: String,
    pub name: String,
    pub quote: Quote,
    /// Additional provider-supplied fields, formatted verbatim by the prompt
    /// builder in the order they were inserted.
    pub extra: Vec<(String, String)>,
}

/// One normalized evidence source: a label, a record count, and a short
/// sample description (spec §3 `EvidenceBundle`).
#[derive(Debug, Clone)]
pub struct EvidenceEntry {
    pub label: String,
    pub count: usize,
    pub sample_description: String,
    /// Raw payload as returned by the provider, kept for downstream transformers.
    pub raw: serde_json::Value,
}

/// Ordered, read-only bundle of evidence entries for one agent (spec §3, §4.2).
///
/// Order matches `AgentSpec::evidence_bindings`. A provider that timed out or
/// raised is represented as `count == 0` with
/// `sample_description == "unavailable"` rather than being omitted — the
/// agent still proceeds (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct EvidenceBundle {
    pub entries: Vec<EvidenceEntry>,
}

impl EvidenceBundle {
    pub fn unavailable_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.sample_description == "unavailable")
            .count()
    }
}

/// Terminal-branch state machine for one agent within a session (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    FetchingEvidence,
    Assembling,
    AwaitingBudget,
    CallingLlm,
    Success,
    Timeout,
    Refused,
    Cancelled,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Success
                | AgentStatus::Timeout
                | AgentStatus::Refused
                | AgentStatus::Cancelled
                | AgentStatus::Failed
        )
    }

    /// Whether a sibling depending on this agent may treat it as a satisfied
    /// upstream dependency (spec §4.6: "failed upstreams are treated as absent").
    pub fn is_successful_upstream(&self) -> bool {
        matches!(self, AgentStatus::Success)
    }
}

/// Session-scoped, mutable-by-exactly-one-runner record for a single agent
/// (spec §3 `AgentRecord`). Re-entry into a terminal status is forbidden —
/// enforced by [`crate::runner::AgentRunner`], not by this type.
///
/// `started_at`/`ended_at` are wall-clock timestamps for reporting to the
/// client (spec §7 "elapsed time"); the per-agent deadline itself is tracked
/// separately against a monotonic clock in [`crate::runner::AgentRunner`],
/// which is never affected by wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub status: AgentStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt_chars: Option<usize>,
    pub output_text: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub evidence_bundle: Option<EvidenceBundle>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            attempt: 0,
            started_at: None,
            ended_at: None,
            prompt_chars: None,
            output_text: None,
            error_kind: None,
            error_message: None,
            evidence_bundle: None,
        }
    }

    /// Elapsed wall time, available once the record has a `started_at`.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let started = self.started_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        ended.signed_duration_since(started).to_std().ok()
    }
}

/// Map of upstream agent id -> final output text, visible to a stage-N agent's
/// `PromptBuilder` call. Snapshotted at `assembling` (spec §5 ordering
/// guarantees) so it never changes mid-call.
pub type PriorOutputs = HashMap<String, String>;
