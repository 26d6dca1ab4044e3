//! Trace context propagation.
//!
//! A [`TraceContext`] carries "the currently active segment or subsegment
//! for this logical call chain" as an ordinary value: deriving a child
//! context for a nested or concurrent call produces a new context and
//! never mutates the caller's view, so sibling branches cannot observe
//! each other. The [`Recorder`] is the explicit assembly point for the
//! sampler and emitter: there is no ambient global.

use crate::config::Config;
use crate::emitter::{Emitter, EmitterMetrics, TransportBoxed, UdpTransport};
use crate::error::TraceError;
use crate::header::{Header, SamplingDecision};
use crate::id::TraceId;
use crate::sampling::{Sampler, SamplingRequest};
use crate::segment::{Entity, Namespace};
use std::io;
use std::sync::Arc;

struct Shared {
    config: Config,
    sampler: Arc<Sampler>,
    emitter: Arc<Emitter>,
}

/// Owns the sampler and emitter and mints trace contexts.
///
/// Construct one per process and pass it (or contexts derived from it) by
/// reference to all producers.
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    /// Creates a recorder that emits to the collector daemon named in
    /// `config` over UDP. Must be called within a tokio runtime.
    pub async fn new(config: Config) -> io::Result<Self> {
        let transport = UdpTransport::connect(config.daemon_address).await?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Creates a recorder over an explicit transport, with a default
    /// sampler. Must be called within a tokio runtime.
    pub fn with_transport(config: Config, transport: Arc<dyn TransportBoxed>) -> Self {
        Self::with_parts(config, Sampler::default(), transport)
    }

    /// Creates a recorder from explicit parts.
    pub fn with_parts(
        config: Config,
        sampler: Sampler,
        transport: Arc<dyn TransportBoxed>,
    ) -> Self {
        let emitter = Arc::new(Emitter::new(config.emitter.clone(), transport));
        Self {
            shared: Arc::new(Shared {
                config,
                sampler: Arc::new(sampler),
                emitter,
            }),
        }
    }

    /// The recorder's sampler, for rule replacement or refresh tasks.
    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.shared.sampler
    }

    /// Emitter counters.
    pub fn emitter_metrics(&self) -> &Arc<EmitterMetrics> {
        self.shared.emitter.metrics()
    }

    /// An empty context: the next `begin` starts a fresh trace.
    pub fn context(&self) -> TraceContext {
        TraceContext {
            shared: Arc::clone(&self.shared),
            entity: None,
            inbound: None,
        }
    }

    /// A context resuming the trace identity carried by an inbound
    /// header. A header without a usable trace id behaves like an empty
    /// context and the next `begin` mints a fresh trace.
    pub fn context_from_header(&self, header: &Header) -> TraceContext {
        TraceContext {
            shared: Arc::clone(&self.shared),
            entity: None,
            inbound: Some(header.clone()),
        }
    }

    /// Drains and stops the emitter worker.
    pub async fn shutdown(&self) {
        self.shared.emitter.shutdown().await;
    }
}

/// The currently active entity for one logical call chain.
///
/// Cloning is cheap; derived contexts share the recorder but reference
/// their own entity. Concurrent derivation from the same parent is safe:
/// appends to the shared parent are synchronized inside the segment
/// model.
#[derive(Clone)]
pub struct TraceContext {
    shared: Arc<Shared>,
    entity: Option<Arc<Entity>>,
    inbound: Option<Header>,
}

impl TraceContext {
    /// Begins a unit of work: a subsegment when this context has an
    /// active entity, otherwise a new local root (resuming the inbound
    /// header's trace identity when one is present).
    ///
    /// Returns the derived child context together with the new entity.
    pub fn begin(&self, name: &str) -> Result<(TraceContext, Arc<Entity>), TraceError> {
        let request = SamplingRequest::for_service(self.shared.config.service_name.clone());
        self.begin_inner(name, &request, Namespace::Local, None)
    }

    /// Begins a root with an explicit sampling request descriptor, for
    /// callers instrumenting a request boundary.
    pub fn begin_with_request(
        &self,
        name: &str,
        request: &SamplingRequest,
    ) -> Result<(TraceContext, Arc<Entity>), TraceError> {
        self.begin_inner(name, request, Namespace::Local, None)
    }

    /// Begins a subsegment covering a downstream call to another service.
    pub fn begin_remote(&self, name: &str) -> Result<(TraceContext, Arc<Entity>), TraceError> {
        let request = SamplingRequest::for_service(self.shared.config.service_name.clone());
        self.begin_inner(name, &request, Namespace::Remote, None)
    }

    /// Begins a unit of work that is never sampled, regardless of the
    /// trace's decision, for bypass and health-check paths that must
    /// skip collection.
    pub fn begin_unsampled(&self, name: &str) -> Result<(TraceContext, Arc<Entity>), TraceError> {
        let request = SamplingRequest::for_service(self.shared.config.service_name.clone());
        self.begin_inner(name, &request, Namespace::Local, Some(false))
    }

    fn begin_inner(
        &self,
        name: &str,
        request: &SamplingRequest,
        namespace: Namespace,
        sampled_override: Option<bool>,
    ) -> Result<(TraceContext, Arc<Entity>), TraceError> {
        let entity = match &self.entity {
            Some(parent) => parent.new_child(name, namespace, sampled_override)?,
            None => {
                let (trace_id, remote_parent, carried) = match &self.inbound {
                    Some(Header {
                        trace_id: Some(trace_id),
                        parent_id,
                        decision,
                        ..
                    }) => (*trace_id, *parent_id, *decision),
                    _ => (TraceId::new(), None, SamplingDecision::Unknown),
                };
                let sampled = match sampled_override {
                    Some(sampled) => sampled,
                    None => self.shared.sampler.decide(carried, request).is_sampled(),
                };
                Entity::new_root(
                    name,
                    trace_id,
                    remote_parent,
                    sampled,
                    Arc::clone(&self.shared.emitter),
                    self.shared.config.close_deadline,
                )
            }
        };
        let child_ctx = TraceContext {
            shared: Arc::clone(&self.shared),
            entity: Some(Arc::clone(&entity)),
            inbound: None,
        };
        Ok((child_ctx, entity))
    }

    /// The active entity, if any.
    pub fn current(&self) -> Option<Arc<Entity>> {
        self.entity.clone()
    }

    /// Force-closes the entity subtree owned by this call chain, flagging
    /// forced entities with a fault and the cancellation cause. Siblings
    /// under a shared parent are unaffected.
    pub fn cancel(&self, cause: &str) {
        if let Some(entity) = &self.entity {
            entity.force_close(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::MemoryTransport;
    use crate::sampling::SamplingRule;
    use crate::segment::EntityState;

    fn test_recorder(rules: Vec<SamplingRule>) -> (Recorder, MemoryTransport) {
        let transport = MemoryTransport::new();
        let recorder = Recorder::with_parts(
            Config::default().with_service_name("test-service"),
            Sampler::new(rules),
            Arc::new(transport.clone()),
        );
        (recorder, transport)
    }

    fn always_on() -> Vec<SamplingRule> {
        vec![SamplingRule::new("all", 1).with_fixed_rate(1.0)]
    }

    fn always_off() -> Vec<SamplingRule> {
        vec![SamplingRule::new("none", 1)]
    }

    #[tokio::test]
    async fn begin_without_context_mints_fresh_trace() {
        let (recorder, _transport) = test_recorder(always_on());
        let ctx = recorder.context();
        assert!(ctx.current().is_none());

        let (child_ctx, segment) = ctx.begin("web").unwrap();
        assert!(segment.is_sampled());
        assert_eq!(segment.parent_id(), None);
        assert_eq!(child_ctx.current().unwrap().id(), segment.id());
        // The original context is unchanged.
        assert!(ctx.current().is_none());
    }

    #[tokio::test]
    async fn begin_resumes_inbound_header_identity() {
        let (recorder, _transport) = test_recorder(always_off());
        let header =
            Header::decode("Root=1-57ff426a-80c11c39b0c928905eb0828d;Parent=1234abcd1234abcd;Sampled=1");
        let ctx = recorder.context_from_header(&header);

        let (_child_ctx, segment) = ctx.begin("test").unwrap();
        assert_eq!(
            segment.trace_id().to_string(),
            "1-57ff426a-80c11c39b0c928905eb0828d"
        );
        assert_eq!(segment.parent_id().unwrap().to_string(), "1234abcd1234abcd");
        // Sampled=1 wins over the never-sample rule set.
        assert!(segment.is_sampled());
    }

    #[tokio::test]
    async fn malformed_inbound_trace_id_starts_fresh_trace() {
        let (recorder, _transport) = test_recorder(always_on());
        let header = Header::decode("Root=fakeid;Parent=1234abcd1234abcd;Sampled=1");
        let ctx = recorder.context_from_header(&header);

        let (_child_ctx, segment) = ctx.begin("web").unwrap();
        assert_ne!(segment.trace_id().to_string(), "fakeid");
        assert_eq!(segment.parent_id(), None);
    }

    #[tokio::test]
    async fn nested_begin_creates_subsegment() {
        let (recorder, _transport) = test_recorder(always_on());
        let (ctx, segment) = recorder.context().begin("web").unwrap();
        let (_ctx2, subsegment) = ctx.begin("db").unwrap();

        assert_eq!(subsegment.trace_id(), segment.trace_id());
        assert_eq!(subsegment.parent_id(), Some(segment.id()));
        assert!(subsegment.is_sampled());
    }

    #[tokio::test]
    async fn begin_unsampled_subtree_stays_unsampled() {
        let (recorder, _transport) = test_recorder(always_on());
        let (ctx, segment) = recorder.context().begin("web").unwrap();
        assert!(segment.is_sampled());

        let (health_ctx, health) = ctx.begin_unsampled("health").unwrap();
        assert!(!health.is_sampled());
        assert_eq!(health.downstream_header().decision, SamplingDecision::NotSampled);

        // Children of the unsampled subsegment inherit the override.
        let (_ctx3, probe) = health_ctx.begin("probe").unwrap();
        assert!(!probe.is_sampled());
    }

    #[tokio::test]
    async fn unsampled_root_is_never_emitted() {
        let (recorder, transport) = test_recorder(always_off());
        let (_ctx, segment) = recorder.context().begin("web").unwrap();
        segment.close().unwrap();
        recorder.shutdown().await;

        assert_eq!(segment.state(), EntityState::Emitted);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn sampled_root_reaches_the_transport() {
        let (recorder, transport) = test_recorder(always_on());
        let (ctx, segment) = recorder.context().begin("web").unwrap();
        let (_ctx2, subsegment) = ctx.begin("db").unwrap();
        subsegment.close().unwrap();
        segment.close().unwrap();
        recorder.shutdown().await;

        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["name"], "web");
        assert_eq!(bodies[0]["subsegments"][0]["name"], "db");
        assert!(bodies[0].get("type").is_none());
    }

    #[tokio::test]
    async fn resumed_root_is_emitted_as_subsegment() {
        let (recorder, transport) = test_recorder(always_off());
        let header =
            Header::decode("Root=1-57ff426a-80c11c39b0c928905eb0828d;Parent=1234abcd1234abcd;Sampled=1");
        let (_ctx, segment) = recorder.context_from_header(&header).begin("test").unwrap();
        segment.close().unwrap();
        recorder.shutdown().await;

        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["type"], "subsegment");
        assert_eq!(bodies[0]["trace_id"], "1-57ff426a-80c11c39b0c928905eb0828d");
        assert_eq!(bodies[0]["parent_id"], "1234abcd1234abcd");
    }

    #[tokio::test]
    async fn cancel_spares_siblings() {
        let (recorder, _transport) = test_recorder(always_on());
        let (ctx, segment) = recorder.context().begin("web").unwrap();
        let (stuck_ctx, stuck) = ctx.begin("stuck").unwrap();
        let (_ok_ctx, ok) = ctx.begin("ok").unwrap();

        stuck_ctx.cancel("deadline exceeded");
        assert_eq!(stuck.state(), EntityState::Closed);
        assert_eq!(ok.state(), EntityState::Open);

        ok.close().unwrap();
        segment.close().unwrap();
        let doc = segment.snapshot();
        let stuck_doc = doc.subsegments.iter().find(|d| d.name == "stuck").unwrap();
        assert!(stuck_doc.fault);
        let ok_doc = doc.subsegments.iter().find(|d| d.name == "ok").unwrap();
        assert!(!ok_doc.fault);
    }

    #[tokio::test]
    async fn concurrent_branches_from_one_parent() {
        let (recorder, _transport) = test_recorder(always_on());
        let (ctx, segment) = recorder.context().begin("web").unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let (branch_ctx, subsegment) = ctx.begin(&format!("branch-{i}")).unwrap();
                let (_leaf_ctx, leaf) = branch_ctx.begin("leaf").unwrap();
                leaf.close().unwrap();
                subsegment.close().unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        segment.close().unwrap();
        assert_eq!(segment.state(), EntityState::Emitted);
        assert_eq!(segment.snapshot().subsegments.len(), 8);
    }
}
