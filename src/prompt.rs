//! Deterministic prompt assembly (spec §4.3).
//!
//! Assembly is intentionally boring: no truncation, no reordering, no
//! conditional logic beyond "omit an empty section" — tests depend on the
//! exact shape. Token-budget enforcement lives entirely in
//! [`crate::llm::LLMClient`], never here.

use crate::model::{AgentSpec, EvidenceBundle, PriorOutputs, StockContext};

const TASK_DIRECTIVE: &str =
    "Produce your analysis for this stage using only the information above. \
     Be concise and specific; cite the evidence counts where they support your conclusion.";

const PRIOR_OUTPUT_SEPARATOR: &str = "\n---\n";
const UPSTREAM_UNAVAILABLE_MARKER: &str = "(upstream unavailable)";

/// A fully assembled system/user prompt pair, ready for [`crate::llm::LLMClient::call`].
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl AssembledPrompt {
    /// Character length of the user prompt, recorded on the `AgentRecord`
    /// (spec §4.3 rule 3).
    pub fn user_prompt_chars(&self) -> usize {
        self.user_prompt.chars().count()
    }
}

/// Roles whose final output should appear in the prior-outputs block, mapped
/// from `priorOutputs` id -> display role label.
pub struct UpstreamLabels<'a>(pub &'a [(&'a str, &'a str)]);

/// Assembles the system + user prompt for one agent invocation (spec §4.3).
pub fn build_prompt(
    spec: &AgentSpec,
    stock: &StockContext,
    evidence: &EvidenceBundle,
    prior_outputs: &PriorOutputs,
    upstream_labels: &[(String, String)],
    operator_instruction: Option<&str>,
) -> AssembledPrompt {
    let system_prompt = spec.system_prompt.clone();

    let mut sections = Vec::new();

    sections.push(quote_block(stock));
    if let Some(block) = evidence_block(evidence) {
        sections.push(block);
    }
    if let Some(block) = prior_outputs_block(spec, prior_outputs, upstream_labels) {
        sections.push(block);
    }
    if let Some(instruction) = operator_instruction {
        if !instruction.trim().is_empty() {
            sections.push(format!("Operator instruction: {}", instruction.trim()));
        }
    }
    sections.push(TASK_DIRECTIVE.to_string());

    let user_prompt = sections
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    AssembledPrompt {
        system_prompt,
        user_prompt,
    }
}

fn quote_block(stock: &StockContext) -> String {
    let mut lines = vec![format!("Stock: {} ({})", stock.name, stock.symbol)];
    lines.push(format!(
        "Quote: price={} open={} high={} low={} change={}",
        stock.quote.price, stock.quote.open, stock.quote.high, stock.quote.low, stock.quote.change
    ));
    for (key, value) in &stock.extra {
        lines.push(format!("{}: {}", key, value));
    }
    lines.join("\n")
}

fn evidence_block(evidence: &EvidenceBundle) -> Option<String> {
    if evidence.entries.is_empty() {
        return None;
    }
    let mut lines = vec!["Evidence:".to_string()];
    for entry in &evidence.entries {
        lines.push(format!(
            "- {}: {} ({})",
            entry.label, entry.count, entry.sample_description
        ));
    }
    Some(lines.join("\n"))
}

/// Builds the prior-outputs block strictly from what's present in
/// `prior_outputs` — a dependency that was never scheduled (disabled by an
/// override) simply has no key in the map and contributes nothing, even
/// though it's still named in `spec.dependencies`. A dependency that *ran*
/// but failed still gets a key (mapped to an empty string by the scheduler)
/// and renders as "(upstream unavailable)". An entirely empty map yields no
/// block at all — dependencies are informational at runtime, not a promise
/// that the block exists.
fn prior_outputs_block(
    spec: &AgentSpec,
    prior_outputs: &PriorOutputs,
    upstream_labels: &[(String, String)],
) -> Option<String> {
    if prior_outputs.is_empty() {
        return None;
    }

    let mut blocks = Vec::new();
    for dep_id in ordered_dependencies(spec, prior_outputs, upstream_labels) {
        let label = upstream_labels
            .iter()
            .find(|(id, _)| id == &dep_id)
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| dep_id.clone());

        match prior_outputs.get(&dep_id) {
            Some(text) if !text.is_empty() => {
                blocks.push(format!("[{}]\n{}", label, text));
            }
            _ => {
                blocks.push(format!("[{}]\n{}", label, UPSTREAM_UNAVAILABLE_MARKER));
            }
        }
    }

    if blocks.is_empty() {
        return None;
    }

    Some(format!(
        "Prior outputs:\n{}",
        blocks.join(PRIOR_OUTPUT_SEPARATOR)
    ))
}

/// Keys of `prior_outputs`, in spec declaration order where possible, falling
/// back to encounter order in `upstream_labels` for ids not declared as a
/// dependency (defensive — the scheduler should never populate those).
fn ordered_dependencies(
    spec: &AgentSpec,
    prior_outputs: &PriorOutputs,
    upstream_labels: &[(String, String)],
) -> Vec<String> {
    let mut ordered: Vec<String> = upstream_labels
        .iter()
        .map(|(id, _)| id.clone())
        .filter(|id| prior_outputs.contains_key(id))
        .collect();
    for dep in &spec.dependencies {
        if prior_outputs.contains_key(dep) && !ordered.contains(dep) {
            ordered.push(dep.clone());
        }
    }
    for key in prior_outputs.keys() {
        if !ordered.contains(key) {
            ordered.push(key.clone());
        }
    }
    ordered
}
