//! Printable snapshot of the references held on one object

use super::{HolderId, RefKind, RefOp, TrackingMode};
use crate::errors::RefError;
use crate::refs::LifetimePolicy;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefEvent {
    pub sequence: u64,
    pub kind: RefKind,
    pub op: RefOp,
    pub holder: HolderId,
    pub count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceReport {
    /// Owner address, or 0 once the object was destroyed
    pub object: usize,
    pub refs: usize,
    pub strong: i32,
    pub weak: i32,
    pub policy: LifetimePolicy,
    pub mode: Option<TrackingMode>,
    pub entries: Vec<RefEvent>,
}

impl ReferenceReport {
    pub fn is_tracking(&self) -> bool {
        self.mode.is_some()
    }

    pub fn outstanding(&self, kind: RefKind) -> impl Iterator<Item = &RefEvent> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn to_json(&self) -> Result<String, RefError> {
        serde_json::to_string_pretty(self).map_err(|e| RefError::config(e.to_string()))
    }
}

impl fmt::Display for ReferenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "References on object 0x{:x} (refs 0x{:x}, {}): strong={} weak={}",
            self.object, self.refs, self.policy, self.strong, self.weak
        )?;
        if self.mode.is_none() {
            return writeln!(f, "  (tracking disabled)");
        }
        for kind in [RefKind::Strong, RefKind::Weak] {
            let label = match kind {
                RefKind::Strong => "strong",
                RefKind::Weak => "weak",
            };
            let entries: Vec<&RefEvent> = self.outstanding(kind).collect();
            writeln!(f, "  {} references: {}", label, entries.len())?;
            for event in entries {
                let sign = match event.op {
                    RefOp::Acquire => '+',
                    RefOp::Release => '-',
                };
                writeln!(f, "    {}{} count={}", sign, event.holder, event.count)?;
                if let Some(trace) = &event.backtrace {
                    for line in trace.lines() {
                        writeln!(f, "      {}", line)?;
                    }
                }
            }
        }
        Ok(())
    }
}
