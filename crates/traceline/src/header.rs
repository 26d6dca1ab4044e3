//! Codec for the textual trace header exchanged between services.
//!
//! The wire form is a single line of semicolon-separated `Key=Value`
//! fields: `Root=<trace id>;Parent=<entity id>;Sampled=<0|1|?>`. Unknown
//! keys are preserved verbatim so they survive a round trip through this
//! process. The same string may arrive as an HTTP header value or as an
//! externally-supplied execution context string; the codec does not care
//! which carrier delivered it.

use crate::id::{EntityId, TraceId};
use std::fmt;

/// Conventional HTTP header name used to carry the trace header across
/// service boundaries.
pub const TRACE_HEADER_NAME: &str = "X-Amzn-Trace-Id";

/// Whether a trace is recorded, as carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingDecision {
    /// The trace is recorded (`Sampled=1`).
    Sampled,
    /// The trace is not recorded (`Sampled=0`).
    NotSampled,
    /// The caller asks the callee to decide (`Sampled=?`).
    Requested,
    /// No decision was carried.
    #[default]
    Unknown,
}

impl SamplingDecision {
    /// Returns `true` for [`SamplingDecision::Sampled`].
    #[inline]
    pub fn is_sampled(self) -> bool {
        matches!(self, Self::Sampled)
    }

    /// Returns `true` if the decision is final (`Sampled` or `NotSampled`)
    /// and must not be overridden downstream.
    #[inline]
    pub fn is_decided(self) -> bool {
        matches!(self, Self::Sampled | Self::NotSampled)
    }

    fn wire_value(self) -> Option<&'static str> {
        match self {
            Self::Sampled => Some("1"),
            Self::NotSampled => Some("0"),
            Self::Requested => Some("?"),
            Self::Unknown => None,
        }
    }
}

/// Decoded trace header.
///
/// A missing or malformed `Root` field decodes to `trace_id: None`; the
/// caller must treat that as "no incoming trace" and mint a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// Trace identity shared by every segment of the trace.
    pub trace_id: Option<TraceId>,
    /// Segment or subsegment id of the caller, if any.
    pub parent_id: Option<EntityId>,
    /// Sampling decision carried by the caller.
    pub decision: SamplingDecision,
    /// Unrecognized fields, preserved in arrival order and re-emitted.
    pub additional: Vec<(String, String)>,
}

impl Header {
    /// Decodes a header from its textual wire form.
    ///
    /// Decoding never fails: malformed fields are dropped (or, for unknown
    /// keys, preserved verbatim) and whitespace around fields is tolerated.
    pub fn decode(text: &str) -> Self {
        let mut header = Self::default();
        for field in text.split(';') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "Root" => header.trace_id = value.parse().ok(),
                "Parent" => header.parent_id = value.parse().ok(),
                "Sampled" => {
                    header.decision = match value {
                        "1" => SamplingDecision::Sampled,
                        "0" => SamplingDecision::NotSampled,
                        "?" => SamplingDecision::Requested,
                        _ => SamplingDecision::Unknown,
                    };
                }
                _ => header
                    .additional
                    .push((key.to_string(), value.to_string())),
            }
        }
        header
    }

    /// Encodes the header to its textual wire form.
    ///
    /// Field order is stable (`Root`, `Parent`, `Sampled`, then additional
    /// fields in insertion order) and empty fields are omitted, keeping the
    /// encoded form minimal and deterministic.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str(";")
            }
        };
        if let Some(trace_id) = &self.trace_id {
            sep(f)?;
            write!(f, "Root={trace_id}")?;
        }
        if let Some(parent_id) = &self.parent_id {
            sep(f)?;
            write!(f, "Parent={parent_id}")?;
        }
        if let Some(value) = self.decision.wire_value() {
            sep(f)?;
            write!(f, "Sampled={value}")?;
        }
        for (key, value) in &self.additional {
            sep(f)?;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
