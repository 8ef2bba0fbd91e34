//! Progress events published from a running session to its client (spec
//! §4.8, §5 ordering guarantees). Mirrors the shape of the teacher's
//! `AgentEvent`/`OrchestrationEvent` enums: flat variants, each self-
//! contained enough that a handler never needs external state to attribute
//! it to a session/stage/agent.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::EngineError;

/// One progress event emitted during a session (spec §4.6, §4.8).
///
/// Ordering is per-session only (spec §5): stage events are emitted in stage
/// order; within a stage, per-agent terminal events may interleave; for a
/// given agent its own events are always in state-machine order.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A stage's batches are about to begin.
    StageStarted { stage: u8 },
    /// Every agent selected for this stage has reached a terminal state.
    StageCompleted { stage: u8 },

    /// An `AgentRunner` began work on this agent (spec §4.5).
    AgentStarted { agent_id: String },
    /// Evidence gathering finished (successfully or with `unavailable`
    /// entries) and the agent is about to assemble its prompt.
    AgentEvidenceReady { agent_id: String, sources_unavailable: usize },
    /// The agent reached a terminal `success` state.
    AgentCompleted { agent_id: String, output_chars: usize },
    /// The agent reached a terminal failure state (`timeout`/`refused`/other).
    AgentFailed { agent_id: String, error_kind: String, message: String },
    /// The agent was cancelled before reaching `success`/`failed`.
    AgentCancelled { agent_id: String },

    /// Final event for the session; always the last event emitted.
    SessionCompleted { status: SessionStatus },
}

/// Session terminal status, aggregated per spec §4.6 step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// All `core` agents succeeded and at least the per-stage minimum succeeded.
    Success,
    /// Core succeeded but some non-core agent failed.
    Partial,
    /// A `core` agent failed, or the session could not start (e.g. `NoStockData`).
    Error,
    /// The client cancelled the session.
    Cancelled,
}

impl ProgressEvent {
    pub fn agent_failed(agent_id: impl Into<String>, err: &EngineError) -> Self {
        ProgressEvent::AgentFailed {
            agent_id: agent_id.into(),
            error_kind: err.kind_tag().to_string(),
            message: err.to_string(),
        }
    }
}

/// Non-blocking (or boundedly-blocking) sink a session publishes events to
/// (spec §5 "Suspension points": `ProgressSink.emit` must never stall the
/// scheduler). Implementations backed by a bounded channel should drop the
/// oldest *non-terminal* event rather than block or drop a terminal one.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

fn is_terminal_event(event: &ProgressEvent) -> bool {
    matches!(
        event,
        ProgressEvent::AgentCompleted { .. }
            | ProgressEvent::AgentFailed { .. }
            | ProgressEvent::AgentCancelled { .. }
            | ProgressEvent::StageCompleted { .. }
            | ProgressEvent::SessionCompleted { .. }
    )
}

struct RingBuffer {
    queue: VecDeque<ProgressEvent>,
    capacity: usize,
    closed: bool,
}

/// A [`ProgressSink`] backed by a capacity-bounded ring buffer rather than a
/// plain `tokio::sync::mpsc` channel, because a bounded mpsc channel can only
/// refuse a full send — it has no way to evict an already-queued entry. Once
/// the buffer is at capacity, a new non-terminal event evicts the oldest
/// *non-terminal* entry still queued (spec §5: "a sink that cannot keep up
/// may drop oldest non-terminal events, never terminal ones"). Terminal
/// events are always appended, growing the buffer past `capacity` if
/// necessary, and are never evicted or dropped.
pub struct ChannelProgressSink {
    inner: Arc<Mutex<RingBuffer>>,
    notify: Arc<Notify>,
}

/// The receiving half of a [`ChannelProgressSink`].
pub struct ChannelProgressReceiver {
    inner: Arc<Mutex<RingBuffer>>,
    notify: Arc<Notify>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, ChannelProgressReceiver) {
        let inner = Arc::new(Mutex::new(RingBuffer {
            queue: VecDeque::new(),
            capacity,
            closed: false,
        }));
        let notify = Arc::new(Notify::new());
        (
            Self {
                inner: inner.clone(),
                notify: notify.clone(),
            },
            ChannelProgressReceiver { inner, notify },
        )
    }
}

impl Drop for ChannelProgressSink {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 2 {
            // Only the receiver's clone remains; mark closed so a pending
            // `recv` wakes up and returns `None` instead of waiting forever.
            if let Ok(mut guard) = self.inner.try_lock() {
                guard.closed = true;
                self.notify.notify_waiters();
            }
        }
    }
}

#[async_trait::async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        {
            let mut buf = self.inner.lock().await;
            if is_terminal_event(&event) || buf.queue.len() < buf.capacity {
                buf.queue.push_back(event);
            } else if let Some(pos) = buf.queue.iter().position(|e| !is_terminal_event(e)) {
                let dropped = buf.queue.remove(pos);
                log::warn!("progress sink full, dropping oldest non-terminal event: {:?}", dropped);
                buf.queue.push_back(event);
            } else {
                // Buffer is full of terminal events awaiting drain; the new
                // non-terminal event is dropped outright rather than growing
                // the buffer, since nothing non-terminal is left to evict.
                log::warn!("progress sink full of terminal events, dropping new non-terminal event: {:?}", event);
            }
        }
        self.notify.notify_waiters();
    }
}

impl ChannelProgressReceiver {
    /// Waits for and removes the oldest queued event, or returns `None` once
    /// every [`ChannelProgressSink`] clone has been dropped and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut buf = self.inner.lock().await;
                if let Some(event) = buf.queue.pop_front() {
                    return Some(event);
                }
                if buf.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}
