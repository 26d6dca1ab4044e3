//! Distributed-tracing instrumentation core.
//!
//! Tracks units of work (segments and subsegments) inside a process,
//! propagates trace identity and sampling decisions across process
//! boundaries via a compact textual header, decides probabilistically
//! which traces to keep, and ships completed trace documents to a local
//! collector daemon over fire-and-forget UDP.
//!
//! The pieces fit together like this: an inbound call carries (or lacks)
//! a trace [`Header`] → a [`TraceContext`] resumes or starts the trace →
//! the [`Sampler`] fixes the sampling decision once per trace → nested
//! work units open and close [`Entity`]s → closing the root hands the
//! finished tree to the [`Emitter`].
//!
//! ```ignore
//! let recorder = Recorder::new(Config::default()).await?;
//! let header = Header::decode(inbound_header_value);
//! let (ctx, segment) = recorder.context_from_header(&header).begin("web")?;
//! let (_, subsegment) = ctx.begin_remote("db")?;
//! subsegment.close()?;
//! segment.close()?;
//! ```

pub mod config;
pub mod context;
pub mod emitter;
pub mod error;
pub mod header;
pub mod id;
pub mod sampling;
pub mod segment;

// Re-export main types
pub use config::{Config, DEFAULT_DAEMON_ADDRESS};
pub use context::{Recorder, TraceContext};
pub use emitter::{
    Emitter, EmitterConfig, EmitterMetrics, SegmentDocument, Transport, TransportBoxed,
    UdpTransport, DAEMON_FRAMING,
};
pub use error::{EmitError, TraceError};
pub use header::{Header, SamplingDecision, TRACE_HEADER_NAME};
pub use id::{EntityId, ParseIdError, TraceId};
pub use sampling::{
    Reservoir, RuleSource, RuleSourceBoxed, RuleSourceError, Sampler, SamplingRequest,
    SamplingRule,
};
pub use segment::{AnnotationValue, Entity, EntityState, Namespace};
