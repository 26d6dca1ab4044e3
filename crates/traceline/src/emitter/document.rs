//! Collector wire documents and packet splitting.
//!
//! Each datagram sent to the collector is a fixed framing line identifying
//! the payload format, a newline, and a JSON body describing one segment
//! (with subsegments nested inline) or one streamed subsegment. When a
//! whole tree does not fit inside the packet limit it is split into
//! independent streamed documents, each carrying enough trace and parent
//! linkage for the collector to reassemble the tree. A single entity is
//! never split mid-field.

use crate::error::EmitError;
use crate::segment::AnnotationValue;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Framing line prefixed to every datagram, identifying the payload
/// format and version for the collector.
pub const DAEMON_FRAMING: &[u8] = b"{\"format\": \"json\", \"version\": 1}\n";

fn is_false(value: &bool) -> bool {
    !*value
}

/// JSON body of one collector datagram: a snapshot of a single segment or
/// subsegment, with inline children for the nested form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentDocument {
    /// Entity id, 16 hex characters.
    pub id: String,
    /// Trace identity; present on standalone documents, omitted on inline
    /// children where the enclosing document carries it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Id of the parent entity, in this process or a remote one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Entity name.
    pub name: String,
    /// Start time, epoch seconds.
    pub start_time: f64,
    /// End time, epoch seconds; omitted while the entity is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    /// Present (true) only while the entity is still open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<bool>,
    /// Client-fault flag; omitted when false.
    #[serde(skip_serializing_if = "is_false")]
    pub error: bool,
    /// Server-fault flag; omitted when false.
    #[serde(skip_serializing_if = "is_false")]
    pub fault: bool,
    /// Throttling flag; omitted when false.
    #[serde(skip_serializing_if = "is_false")]
    pub throttle: bool,
    /// Indexed key/value facts.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, AnnotationValue>,
    /// Non-indexed structured data.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Nested children; empty (omitted) on streamed documents.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<SegmentDocument>,
    /// `"subsegment"` for any entity with a parent; omitted on true roots.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Namespace tag of a subsegment (`remote` or `local`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Frames a document into a complete datagram payload.
pub(crate) fn encode_frame(doc: &SegmentDocument) -> Result<Vec<u8>, EmitError> {
    let body = serde_json::to_vec(doc).map_err(|e| EmitError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(DAEMON_FRAMING.len() + body.len());
    frame.extend_from_slice(DAEMON_FRAMING);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Splits a document into datagram frames, each at most `limit` bytes.
///
/// A document that fits becomes a single frame. One that does not has its
/// subsegments detached and streamed as independent documents (stamped
/// with `trace_id` and `parent_id` linkage), recursively, followed by the
/// stripped parent. An entity that still exceeds the limit on its own is
/// recorded in `dropped`; frames already produced for its children remain
/// valid since they carry their own linkage.
pub(crate) fn split_into_frames(
    mut doc: SegmentDocument,
    trace_id: &str,
    limit: usize,
    frames: &mut Vec<Vec<u8>>,
    dropped: &mut Vec<EmitError>,
) {
    match encode_frame(&doc) {
        Ok(frame) if frame.len() <= limit => {
            frames.push(frame);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            dropped.push(e);
            return;
        }
    }

    let children = std::mem::take(&mut doc.subsegments);
    for mut child in children {
        child.trace_id = Some(trace_id.to_string());
        child.parent_id = Some(doc.id.clone());
        split_into_frames(child, trace_id, limit, frames, dropped);
    }

    match encode_frame(&doc) {
        Ok(frame) if frame.len() <= limit => frames.push(frame),
        Ok(frame) => dropped.push(EmitError::Oversized {
            name: doc.name,
            size: frame.len(),
            limit,
        }),
        Err(e) => dropped.push(e),
    }
}
