//! Sampling-decision engine.
//!
//! For each new trace the [`Sampler`] evaluates configured
//! [`SamplingRule`]s in priority order and lets the first match decide:
//! the rule's [`Reservoir`] guarantees a per-second quota of sampled
//! requests, after which a fixed-rate coin flip applies. A decision
//! already carried by an inbound header is never overridden, preserving
//! end-to-end consistency of a single trace's recording.
//!
//! Rule sets can be replaced at runtime, locally or from a periodically
//! polled [`RuleSource`], and the swap is atomic: in-flight evaluations
//! keep reading the set they started with and never observe a
//! half-updated list.

mod reservoir;
mod rule;

pub use reservoir::Reservoir;
pub use rule::{SamplingRequest, SamplingRule};

use crate::header::SamplingDecision;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Reservoir size of the built-in default rule.
pub const DEFAULT_RESERVOIR_SIZE: u32 = 1;
/// Fixed rate of the built-in default rule.
pub const DEFAULT_FIXED_RATE: f64 = 0.05;

/// Error returned by a [`RuleSource`] fetch.
#[derive(Debug, Clone, Error)]
#[error("rule source error: {0}")]
pub struct RuleSourceError(pub String);

/// A remote (or local) origin of sampling rules, polled periodically by
/// [`Sampler::spawn_refresh`].
pub trait RuleSource: Send + Sync {
    /// Fetches the current rule set.
    fn fetch(&self) -> impl Future<Output = Result<Vec<SamplingRule>, RuleSourceError>> + Send;

    /// Returns the source name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`RuleSource`] for dynamic dispatch.
pub trait RuleSourceBoxed: Send + Sync {
    /// Fetches the current rule set (boxed future for object safety).
    fn fetch_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SamplingRule>, RuleSourceError>> + Send + '_>>;

    /// Returns the source name for logging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any `RuleSource` can be used as `RuleSourceBoxed`.
impl<T: RuleSource> RuleSourceBoxed for T {
    fn fetch_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SamplingRule>, RuleSourceError>> + Send + '_>> {
        Box::pin(self.fetch())
    }

    fn name(&self) -> &str {
        RuleSource::name(self)
    }
}

/// A rule with its live reservoir state.
struct RuleState {
    rule: SamplingRule,
    reservoir: Reservoir,
}

impl RuleState {
    fn new(rule: SamplingRule) -> Self {
        let reservoir = Reservoir::new(rule.reservoir_size);
        Self { rule, reservoir }
    }

    fn decide(&self) -> SamplingDecision {
        if self.reservoir.take() {
            return SamplingDecision::Sampled;
        }
        let rate = self.rule.fixed_rate.clamp(0.0, 1.0);
        if rand::thread_rng().gen_bool(rate) {
            SamplingDecision::Sampled
        } else {
            SamplingDecision::NotSampled
        }
    }
}

/// The sampling-decision engine.
pub struct Sampler {
    /// Active rules, sorted by (priority, declaration order). Replaced
    /// wholesale under the write lock; readers clone the `Arc` out.
    rules: RwLock<Arc<Vec<RuleState>>>,
    fallback: RuleState,
}

impl Sampler {
    /// Creates a sampler with an initial local rule set. An empty set
    /// leaves every decision to the built-in default rule.
    pub fn new(rules: Vec<SamplingRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Self::build(rules))),
            fallback: RuleState::new(
                SamplingRule::new("default", u32::MAX)
                    .with_fixed_rate(DEFAULT_FIXED_RATE)
                    .with_reservoir(DEFAULT_RESERVOIR_SIZE),
            ),
        }
    }

    fn build(rules: Vec<SamplingRule>) -> Vec<RuleState> {
        let mut states: Vec<RuleState> = rules.into_iter().map(RuleState::new).collect();
        // Stable sort keeps declaration order within a priority.
        states.sort_by_key(|s| s.rule.priority);
        states
    }

    /// Replaces the active rule set atomically. Reservoir state of the
    /// outgoing rules is discarded with them.
    pub fn replace_rules(&self, rules: Vec<SamplingRule>) {
        let states = Arc::new(Self::build(rules));
        let mut active = self
            .rules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *active = states;
    }

    /// Number of configured rules (excluding the built-in default).
    pub fn rule_count(&self) -> usize {
        self.active().len()
    }

    fn active(&self) -> Arc<Vec<RuleState>> {
        Arc::clone(
            &self
                .rules
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Decides whether a new trace is recorded.
    ///
    /// A decision already carried by the caller (`Sampled`/`NotSampled`)
    /// is returned unchanged. Otherwise the first matching rule decides,
    /// or the built-in default rule when none matches. The returned
    /// decision is always final.
    pub fn decide(
        &self,
        existing: SamplingDecision,
        request: &SamplingRequest,
    ) -> SamplingDecision {
        if existing.is_decided() {
            return existing;
        }
        let rules = self.active();
        let state = rules
            .iter()
            .find(|s| s.rule.matches(request))
            .unwrap_or(&self.fallback);
        state.decide()
    }

    /// Spawns a task that polls `source` every `interval`, atomically
    /// swapping in each successfully fetched rule set. Fetch failures are
    /// logged and leave the active set untouched.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        source: Arc<dyn RuleSourceBoxed>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let sampler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match source.fetch_boxed().await {
                    Ok(rules) => {
                        tracing::debug!(
                            source = source.name(),
                            count = rules.len(),
                            "refreshed sampling rules"
                        );
                        sampler.replace_rules(rules);
                    }
                    Err(e) => {
                        tracing::warn!(
                            source = source.name(),
                            error = %e,
                            "sampling rule refresh failed"
                        );
                    }
                }
            }
        })
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(name: &str, priority: u32, rate: f64, reservoir: u32) -> SamplingRule {
        SamplingRule::new(name, priority)
            .with_fixed_rate(rate)
            .with_reservoir(reservoir)
    }

    #[test]
    fn existing_decision_is_never_overridden() {
        let sampler = Sampler::new(vec![always("all", 1, 0.0, 0)]);
        let request = SamplingRequest::default();
        assert_eq!(
            sampler.decide(SamplingDecision::Sampled, &request),
            SamplingDecision::Sampled
        );
        assert_eq!(
            sampler.decide(SamplingDecision::NotSampled, &request),
            SamplingDecision::NotSampled
        );
    }

    #[test]
    fn unknown_and_requested_are_decided() {
        let sampler = Sampler::new(vec![always("none", 1, 0.0, 0)]);
        let request = SamplingRequest::default();
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &request),
            SamplingDecision::NotSampled
        );
        assert_eq!(
            sampler.decide(SamplingDecision::Requested, &request),
            SamplingDecision::NotSampled
        );
    }

    #[test]
    fn first_matching_rule_by_priority_wins() {
        let sampler = Sampler::new(vec![
            always("never", 10, 0.0, 0),
            always("always", 1, 1.0, 0).with_path("/api/*"),
        ]);
        let api = SamplingRequest {
            url_path: "/api/users".to_string(),
            ..SamplingRequest::default()
        };
        let other = SamplingRequest {
            url_path: "/health".to_string(),
            ..SamplingRequest::default()
        };
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &api),
            SamplingDecision::Sampled
        );
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &other),
            SamplingDecision::NotSampled
        );
    }

    #[test]
    fn declaration_order_breaks_priority_ties() {
        let sampler = Sampler::new(vec![
            always("first", 5, 1.0, 0),
            always("second", 5, 0.0, 0),
        ]);
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &SamplingRequest::default()),
            SamplingDecision::Sampled
        );
    }

    #[test]
    fn reservoir_bounds_guaranteed_sampling() {
        // Reservoir of 5 with zero fixed rate: at most the reservoir quota
        // is sampled, with one extra window tolerated if the test straddles
        // a second boundary.
        let sampler = Sampler::new(vec![always("quota", 1, 0.0, 5)]);
        let request = SamplingRequest::default();
        let sampled = (0..100)
            .filter(|_| {
                sampler
                    .decide(SamplingDecision::Unknown, &request)
                    .is_sampled()
            })
            .count();
        assert!((5..=10).contains(&sampled), "sampled {sampled} of 100");
    }

    #[test]
    fn fixed_rate_applies_after_reservoir() {
        let sampler = Sampler::new(vec![always("all", 1, 1.0, 0)]);
        let request = SamplingRequest::default();
        for _ in 0..20 {
            assert!(sampler
                .decide(SamplingDecision::Unknown, &request)
                .is_sampled());
        }
    }

    #[test]
    fn no_match_falls_back_to_default_rule() {
        let sampler = Sampler::new(vec![always("api-only", 1, 1.0, 100).with_path("/api/*")]);
        let request = SamplingRequest {
            url_path: "/health".to_string(),
            ..SamplingRequest::default()
        };
        // Default rule: reservoir of one, then a 5% coin flip. The first
        // call lands the reservoir permit.
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &request),
            SamplingDecision::Sampled
        );
    }

    #[test]
    fn replace_rules_swaps_atomically() {
        let sampler = Sampler::new(vec![always("never", 1, 0.0, 0)]);
        let request = SamplingRequest::default();
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &request),
            SamplingDecision::NotSampled
        );
        sampler.replace_rules(vec![always("always", 1, 1.0, 0)]);
        assert_eq!(sampler.rule_count(), 1);
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &request),
            SamplingDecision::Sampled
        );
    }

    struct StaticSource {
        rules: Vec<SamplingRule>,
    }

    impl RuleSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<SamplingRule>, RuleSourceError> {
            Ok(self.rules.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    struct FailingSource;

    impl RuleSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<SamplingRule>, RuleSourceError> {
            Err(RuleSourceError("unreachable".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn refresh_task_swaps_in_fetched_rules() {
        let sampler = Arc::new(Sampler::new(vec![always("never", 1, 0.0, 0)]));
        let source = Arc::new(StaticSource {
            rules: vec![always("always", 1, 1.0, 0)],
        });
        let task = sampler.spawn_refresh(source, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &SamplingRequest::default()),
            SamplingDecision::Sampled
        );
    }

    #[tokio::test]
    async fn failed_refresh_leaves_active_set_untouched() {
        let sampler = Arc::new(Sampler::new(vec![always("always", 1, 1.0, 0)]));
        let task = sampler.spawn_refresh(Arc::new(FailingSource), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(sampler.rule_count(), 1);
        assert_eq!(
            sampler.decide(SamplingDecision::Unknown, &SamplingRequest::default()),
            SamplingDecision::Sampled
        );
    }
}
