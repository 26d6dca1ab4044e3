//! Segment and subsegment model.
//!
//! An [`Entity`] is one recorded unit of work: a segment when it roots a
//! trace inside this process, a subsegment when nested under another
//! entity. Entities form a tree owned by the local root; a child never
//! outlives its parent and is never shared across traces.
//!
//! The lifecycle is `Open → Closing → Closed → Emitted`. A close request
//! on an entity with open children parks it in `Closing`; the last child
//! to close advances it to `Closed`. When a local root reaches `Closed`
//! the tree is snapshotted, handed to the emitter if sampled, and marked
//! `Emitted`.

use crate::emitter::{Emitter, SegmentDocument};
use crate::error::TraceError;
use crate::header::{Header, SamplingDecision};
use crate::id::{EntityId, TraceId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Annotation key inserted on entities closed by a deadline or
/// cancellation rather than by their own work unit.
pub const FORCE_CLOSED_ANNOTATION: &str = "force_closed";

const MAX_ANNOTATION_KEY_LEN: usize = 250;

/// Lifecycle state of a segment or subsegment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityState {
    /// Accepting mutations and children.
    Open,
    /// Close requested; waiting for open children.
    Closing,
    /// Fully closed and immutable.
    Closed,
    /// Serialized and handed off (or discarded); tree is read-only.
    Emitted,
}

/// Namespace tag of a subsegment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Work performed by a downstream call to another service.
    Remote,
    /// Work performed inside this process.
    Local,
}

impl Namespace {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Scalar value of an indexed annotation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    /// Text value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Boolean value.
    Bool(bool),
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for AnnotationValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for AnnotationValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for AnnotationValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn valid_annotation_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_ANNOTATION_KEY_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Emitter handle and policy carried only by local roots.
struct RootHandle {
    emitter: Arc<Emitter>,
    close_deadline: Duration,
}

struct EntityInner {
    state: EntityState,
    end_time: Option<f64>,
    error: bool,
    fault: bool,
    throttle: bool,
    annotations: BTreeMap<String, AnnotationValue>,
    metadata: BTreeMap<String, Value>,
    children: Vec<Arc<Entity>>,
    open_children: usize,
}

impl EntityInner {
    fn open() -> Self {
        Self {
            state: EntityState::Open,
            end_time: None,
            error: false,
            fault: false,
            throttle: false,
            annotations: BTreeMap::new(),
            metadata: BTreeMap::new(),
            children: Vec::new(),
            open_children: 0,
        }
    }
}

/// One segment or subsegment.
///
/// Identity, names and the sampling flag are fixed at creation; everything
/// else lives behind one mutex so concurrent branches of a call chain can
/// append children and close safely.
pub struct Entity {
    id: EntityId,
    trace_id: TraceId,
    name: String,
    sampled: bool,
    start_time: f64,
    namespace: Option<Namespace>,
    parent: Option<Weak<Entity>>,
    remote_parent: Option<EntityId>,
    root: Option<RootHandle>,
    inner: Mutex<EntityInner>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("trace_id", &self.trace_id)
            .field("name", &self.name)
            .field("sampled", &self.sampled)
            .finish_non_exhaustive()
    }
}

impl Entity {
    pub(crate) fn new_root(
        name: &str,
        trace_id: TraceId,
        remote_parent: Option<EntityId>,
        sampled: bool,
        emitter: Arc<Emitter>,
        close_deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EntityId::new(),
            trace_id,
            name: name.to_string(),
            sampled,
            start_time: epoch_seconds(),
            namespace: None,
            parent: None,
            remote_parent,
            root: Some(RootHandle {
                emitter,
                close_deadline,
            }),
            inner: Mutex::new(EntityInner::open()),
        })
    }

    /// Creates a subsegment under `self`. The parent must be `Open`.
    pub(crate) fn new_child(
        self: &Arc<Self>,
        name: &str,
        namespace: Namespace,
        sampled_override: Option<bool>,
    ) -> Result<Arc<Self>, TraceError> {
        let mut inner = self.lock();
        if inner.state != EntityState::Open {
            return Err(TraceError::NotOpen {
                name: self.name.clone(),
            });
        }
        let child = Arc::new(Self {
            id: EntityId::new(),
            trace_id: self.trace_id,
            name: name.to_string(),
            sampled: sampled_override.unwrap_or(self.sampled),
            start_time: epoch_seconds(),
            namespace: Some(namespace),
            parent: Some(Arc::downgrade(self)),
            remote_parent: None,
            root: None,
            inner: Mutex::new(EntityInner::open()),
        });
        inner.children.push(Arc::clone(&child));
        inner.open_children += 1;
        Ok(child)
    }

    fn lock(&self) -> MutexGuard<'_, EntityInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entity id, unique within the trace.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Trace identity shared by the whole tree.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this entity's trace is recorded.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.lock().state
    }

    /// Id of the parent entity: the in-process parent if one exists, or
    /// the remote caller resumed from an inbound header.
    pub fn parent_id(&self) -> Option<EntityId> {
        match &self.parent {
            Some(weak) => weak.upgrade().map(|p| p.id),
            None => self.remote_parent,
        }
    }

    /// Attaches an indexed key/value fact. The key must be non-empty
    /// ASCII alphanumerics or underscores and the entity must be `Open`.
    pub fn put_annotation(
        &self,
        key: impl Into<String>,
        value: impl Into<AnnotationValue>,
    ) -> Result<(), TraceError> {
        let key = key.into();
        if !valid_annotation_key(&key) {
            return Err(TraceError::InvalidAnnotationKey(key));
        }
        let mut inner = self.lock();
        if inner.state != EntityState::Open {
            return Err(TraceError::NotOpen {
                name: self.name.clone(),
            });
        }
        inner.annotations.insert(key, value.into());
        Ok(())
    }

    /// Attaches non-indexed structured data under `key`.
    pub fn put_metadata(&self, key: impl Into<String>, value: Value) -> Result<(), TraceError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TraceError::InvalidAnnotationKey(key));
        }
        let mut inner = self.lock();
        if inner.state != EntityState::Open {
            return Err(TraceError::NotOpen {
                name: self.name.clone(),
            });
        }
        inner.metadata.insert(key, value);
        Ok(())
    }

    /// Flags a client-side error on this entity.
    pub fn set_error(&self) -> Result<(), TraceError> {
        self.set_flags(true, false, false)
    }

    /// Flags the entity as throttled by a downstream dependency.
    /// Throttling implies an error.
    pub fn set_throttle(&self) -> Result<(), TraceError> {
        self.set_flags(true, false, true)
    }

    /// Records a fault with an explanatory message in metadata.
    pub fn add_exception(&self, message: impl Into<String>) -> Result<(), TraceError> {
        let message = message.into();
        let mut inner = self.lock();
        if inner.state != EntityState::Open {
            return Err(TraceError::NotOpen {
                name: self.name.clone(),
            });
        }
        inner.fault = true;
        inner.metadata.insert("cause".to_string(), Value::String(message));
        Ok(())
    }

    fn set_flags(&self, error: bool, fault: bool, throttle: bool) -> Result<(), TraceError> {
        let mut inner = self.lock();
        if inner.state != EntityState::Open {
            return Err(TraceError::NotOpen {
                name: self.name.clone(),
            });
        }
        inner.error |= error;
        inner.fault |= fault;
        inner.throttle |= throttle;
        Ok(())
    }

    /// Closes this entity.
    ///
    /// If children are still open the entity parks in `Closing` and fully
    /// closes once the last child does. Closing a local root triggers
    /// serialization and emitter hand-off. Double close is an error.
    pub fn close(self: &Arc<Self>) -> Result<(), TraceError> {
        self.close_inner(None)
    }

    /// Closes this entity, flagging a fault with the given cause.
    pub fn close_with_fault(
        self: &Arc<Self>,
        cause: impl Into<String>,
    ) -> Result<(), TraceError> {
        self.close_inner(Some(cause.into()))
    }

    fn close_inner(self: &Arc<Self>, fault: Option<String>) -> Result<(), TraceError> {
        let fully_closed = {
            let mut inner = self.lock();
            if inner.state != EntityState::Open {
                return Err(TraceError::AlreadyClosed {
                    name: self.name.clone(),
                });
            }
            inner.end_time = Some(epoch_seconds());
            if let Some(cause) = fault {
                inner.fault = true;
                inner.metadata.insert("cause".to_string(), Value::String(cause));
            }
            if inner.open_children > 0 {
                inner.state = EntityState::Closing;
                false
            } else {
                inner.state = EntityState::Closed;
                true
            }
        };
        if fully_closed {
            self.on_closed();
        } else {
            self.arm_close_deadline();
        }
        Ok(())
    }

    /// Force-closes this entity and every still-open descendant.
    ///
    /// Each entity that had not requested a close gets a fault flag and a
    /// [`FORCE_CLOSED_ANNOTATION`] recording the cause. Already-closed
    /// entities are untouched, so the call is idempotent and safe while
    /// siblings close concurrently.
    pub fn force_close(self: &Arc<Self>, cause: &str) {
        let children = self.lock().children.clone();
        for child in children {
            child.force_close(cause);
        }
        let advanced = {
            let mut inner = self.lock();
            match inner.state {
                EntityState::Open => {
                    inner.fault = true;
                    inner.annotations.insert(
                        FORCE_CLOSED_ANNOTATION.to_string(),
                        AnnotationValue::String(cause.to_string()),
                    );
                    inner.end_time = Some(epoch_seconds());
                    inner.state = EntityState::Closed;
                    inner.open_children = 0;
                    true
                }
                EntityState::Closing => {
                    // Close was requested in time; only the stragglers
                    // above are at fault.
                    inner.state = EntityState::Closed;
                    inner.open_children = 0;
                    true
                }
                EntityState::Closed | EntityState::Emitted => false,
            }
        };
        if advanced {
            self.on_closed();
        }
    }

    /// Advances the parent once this entity is fully `Closed`, or emits
    /// when this entity is a local root.
    fn on_closed(self: &Arc<Self>) {
        if let Some(weak) = &self.parent {
            if let Some(parent) = weak.upgrade() {
                parent.child_closed();
            }
            return;
        }
        if self.sampled {
            if let Some(root) = &self.root {
                root.emitter.emit_root(self);
            }
        }
        self.mark_emitted();
    }

    fn child_closed(self: &Arc<Self>) {
        let advanced = {
            let mut inner = self.lock();
            inner.open_children = inner.open_children.saturating_sub(1);
            if inner.state == EntityState::Closing && inner.open_children == 0 {
                inner.state = EntityState::Closed;
                true
            } else {
                false
            }
        };
        if advanced {
            self.on_closed();
        }
    }

    fn mark_emitted(&self) {
        let children = {
            let mut inner = self.lock();
            if inner.state == EntityState::Closed {
                inner.state = EntityState::Emitted;
            }
            inner.children.clone()
        };
        for child in children {
            child.mark_emitted();
        }
    }

    /// Arms the hard close deadline on a local root parked in `Closing`,
    /// so an abandoned child can never block emission forever. Skipped
    /// when no tokio runtime is available.
    fn arm_close_deadline(self: &Arc<Self>) {
        let Some(root) = &self.root else { return };
        let deadline = root.close_deadline;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(segment = %self.name, "no runtime; close deadline not armed");
            return;
        };
        let entity = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(entity) = entity.upgrade() {
                if entity.state() < EntityState::Closed {
                    tracing::warn!(segment = %entity.name, "segment did not close before deadline");
                    entity.force_close("segment did not close before deadline");
                }
            }
        });
    }

    /// Renders this entity's identity as a trace header for a downstream
    /// call.
    pub fn downstream_header(&self) -> Header {
        Header {
            trace_id: Some(self.trace_id),
            parent_id: Some(self.id),
            decision: if self.sampled {
                SamplingDecision::Sampled
            } else {
                SamplingDecision::NotSampled
            },
            additional: Vec::new(),
        }
    }

    /// Snapshots this entity (and, transitively, its sampled children)
    /// into a wire document. Standalone documents carry trace and parent
    /// linkage; inline children leave it to the enclosing document.
    pub(crate) fn snapshot(&self) -> SegmentDocument {
        self.snapshot_as(true)
    }

    fn snapshot_as(&self, standalone: bool) -> SegmentDocument {
        let inner = self.lock();
        let open = inner.state == EntityState::Open;
        SegmentDocument {
            id: self.id.to_string(),
            trace_id: standalone.then(|| self.trace_id.to_string()),
            parent_id: if standalone {
                self.parent_id().map(|id| id.to_string())
            } else {
                None
            },
            name: self.name.clone(),
            start_time: self.start_time,
            end_time: inner.end_time,
            in_progress: open.then_some(true),
            error: inner.error,
            fault: inner.fault,
            throttle: inner.throttle,
            annotations: inner.annotations.clone(),
            metadata: inner.metadata.clone(),
            subsegments: inner
                .children
                .iter()
                .filter(|c| c.sampled)
                .map(|c| c.snapshot_as(false))
                .collect(),
            doc_type: self
                .parent_id()
                .is_some()
                .then(|| "subsegment".to_string()),
            namespace: self.namespace.map(|n| n.as_str().to_string()),
        }
    }
}
