//! Two-level admission control for LLM calls (spec §4.7): a global pool plus
//! a per-provider pool. A token is bound to exactly one
//! [`crate::llm::LLMClient::call`] and must be released on every exit path —
//! [`GovernorPermit`]'s `Drop` takes care of that unconditionally.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Default global and per-provider pool size for a single-key deployment
/// (spec §4.7).
pub const DEFAULT_CAPACITY: usize = 2;

/// Holds both semaphore permits for the lifetime of one LLM call. Dropping it
/// (on any exit path — success, error, cancel) releases both tokens.
pub struct GovernorPermit<'a> {
    _global: SemaphorePermit<'a>,
    _provider: SemaphorePermit<'a>,
}

/// Owns the global token pool and one pool per provider.
///
/// Acquisition blocks (cancellable via the caller's own `tokio::select!`)
/// and is FIFO within a provider pool; there is no cross-provider fairness
/// guarantee (spec §4.7).
pub struct ConcurrencyGovernor {
    global: Semaphore,
    per_provider: HashMap<String, Semaphore>,
    global_capacity: usize,
}

impl ConcurrencyGovernor {
    /// Build a governor with `global_capacity` global tokens and, for each
    /// provider in `providers`, a same-sized pool unless overridden in
    /// `provider_capacities`.
    pub fn new(
        global_capacity: usize,
        providers: &[&str],
        provider_capacities: &HashMap<String, usize>,
    ) -> Self {
        let per_provider = providers
            .iter()
            .map(|p| {
                let capacity = provider_capacities
                    .get(*p)
                    .copied()
                    .unwrap_or(global_capacity);
                (p.to_string(), Semaphore::new(capacity))
            })
            .collect();

        Self {
            global: Semaphore::new(global_capacity),
            per_provider,
            global_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.global_capacity
    }

    /// Acquire one token from the global pool and one from `provider`'s pool.
    /// Blocks (cancellable at the await point) until both are available.
    ///
    /// `B_stage` may exceed this governor's capacity; excess agents in a
    /// batch simply queue here — they are already past `assembling` and hold
    /// no other resource while they wait (spec §4.7 Admission policy).
    pub async fn acquire(&self, provider: &str) -> GovernorPermit<'_> {
        let global = self
            .global
            .acquire()
            .await
            .expect("governor semaphore is never closed");
        let provider_sem = self
            .per_provider
            .get(provider)
            .unwrap_or(&self.global);
        let provider_permit = provider_sem
            .acquire()
            .await
            .expect("governor semaphore is never closed");
        GovernorPermit {
            _global: global,
            _provider: provider_permit,
        }
    }
}

/// Convenience constructor wired from a spec set: one provider pool per
/// distinct `provider_binding.provider` value.
pub fn governor_for_providers(
    global_capacity: usize,
    providers: impl IntoIterator<Item = String>,
) -> ConcurrencyGovernor {
    let providers: Vec<String> = {
        let mut seen = std::collections::HashSet::new();
        providers.into_iter().filter(|p| seen.insert(p.clone())).collect()
    };
    let provider_refs: Vec<&str> = providers.iter().map(|s| s.as_str()).collect();
    ConcurrencyGovernor::new(global_capacity, &provider_refs, &HashMap::new())
}

/// Thin wrapper so tests can assert on "at most N concurrent" without
/// threading the governor's internal semaphore count through call sites.
pub struct InFlightGauge {
    count: Arc<std::sync::atomic::AtomicUsize>,
    peak: Arc<std::sync::atomic::AtomicUsize>,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self {
            count: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            peak: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub fn enter(&self) -> InFlightGuard {
        use std::sync::atomic::Ordering;
        let current = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        InFlightGuard { count: self.count.clone() }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for InFlightGauge {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    count: Arc<std::sync::atomic::AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn capacity_one_serializes_calls_regardless_of_batch_size() {
        let governor = governor_for_providers(1, vec!["openai".to_string()]);
        let gauge = InFlightGauge::new();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let governor = &governor;
            let gauge_guard_holder = &gauge;
            handles.push(async move {
                let _permit = governor.acquire("openai").await;
                let _guard = gauge_guard_holder.enter();
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
        futures_util::future::join_all(handles).await;
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test]
    async fn capacity_n_allows_up_to_n_concurrent() {
        let governor = governor_for_providers(3, vec!["openai".to_string()]);
        let gauge = InFlightGauge::new();

        let mut handles = Vec::new();
        for _ in 0..9 {
            let governor = &governor;
            let gauge_guard_holder = &gauge;
            handles.push(async move {
                let _permit = governor.acquire("openai").await;
                let _guard = gauge_guard_holder.enter();
                tokio::time::sleep(Duration::from_millis(15)).await;
            });
        }
        futures_util::future::join_all(handles).await;
        assert!(gauge.peak() <= 3);
        assert!(gauge.peak() >= 2);
    }

    #[tokio::test]
    async fn per_provider_pools_are_independent() {
        let mut caps = HashMap::new();
        caps.insert("openai".to_string(), 1);
        caps.insert("claude".to_string(), 1);
        let governor = ConcurrencyGovernor::new(2, &["openai", "claude"], &caps);

        let permit_a = governor.acquire("openai").await;
        let permit_b = governor.acquire("claude").await;
        // both acquired without deadlock because they're independent provider pools
        drop(permit_a);
        drop(permit_b);
    }
}
