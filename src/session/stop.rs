use crate::engine::{BreakpointId, StopReason, ThreadId, ThreadInfo};
use serde_json::{json, Value};

/// Why the process stopped, as reported in a `stopped` event.
#[derive(Clone, Debug, PartialEq)]
pub struct StopInfo {
    pub reason: &'static str,
    pub thread_id: Option<ThreadId>,
    pub description: Option<String>,
    pub hit_breakpoint_ids: Vec<BreakpointId>,
}

impl StopInfo {
    pub fn body(&self) -> Value {
        let mut body = json!({
            "reason": self.reason,
            "allThreadsStopped": true,
        });
        if let Some(tid) = self.thread_id {
            body["threadId"] = json!(tid);
        }
        if let Some(description) = &self.description {
            body["description"] = json!(description);
        }
        if !self.hit_breakpoint_ids.is_empty() {
            body["hitBreakpointIds"] = json!(self.hit_breakpoint_ids);
        }
        body
    }
}

/// Lower is more important, `None` for threads that did not cause the stop.
fn priority(reason: &StopReason) -> Option<u8> {
    match reason {
        StopReason::None => None,
        StopReason::Breakpoint(_) | StopReason::Watchpoint(_) => Some(0),
        StopReason::Exception(_) => Some(1),
        StopReason::Trace | StopReason::PlanComplete => Some(2),
        StopReason::Signal { .. } => Some(3),
        StopReason::Halted | StopReason::Other(_) => Some(4),
    }
}

/// Pick the thread that caused the stop and name the reason.
///
/// Threads are ranked breakpoint, exception, step, signal, other; ties go to the selected
/// thread, then to engine order. A breakpoint that is one of `exception_breakpoints` is
/// reported as `exception`. With no stopping thread at all the selected (or first) thread is
/// reported with `fallback`.
pub fn classify_stop(
    threads: &[ThreadInfo],
    selected: Option<ThreadId>,
    exception_breakpoints: &[BreakpointId],
    fallback: &'static str,
) -> StopInfo {
    let stopped = threads
        .iter()
        .filter_map(|t| priority(&t.stop_reason).map(|p| (p, t)))
        .min_by_key(|(p, t)| (*p, Some(t.id) != selected));

    let Some((_, thread)) = stopped else {
        return StopInfo {
            reason: fallback,
            thread_id: selected.or_else(|| threads.first().map(|t| t.id)),
            description: None,
            hit_breakpoint_ids: vec![],
        };
    };

    let (reason, hit_breakpoint_ids) = match &thread.stop_reason {
        StopReason::Breakpoint(ids) => {
            if ids.iter().any(|id| exception_breakpoints.contains(id)) {
                ("exception", vec![])
            } else {
                ("breakpoint", ids.clone())
            }
        }
        StopReason::Watchpoint(id) => ("data breakpoint", vec![*id]),
        StopReason::Exception(_) => ("exception", vec![]),
        StopReason::Trace | StopReason::PlanComplete => ("step", vec![]),
        StopReason::Signal { .. } => ("signal", vec![]),
        StopReason::Halted => ("pause", vec![]),
        StopReason::Other(_) | StopReason::None => ("unknown", vec![]),
    };
    let description = match &thread.stop_reason {
        StopReason::Exception(text) | StopReason::Other(text) => Some(text.clone()),
        StopReason::Signal { name, .. } => Some(format!("signal {name}")),
        _ => thread.stop_description.clone().filter(|_| reason == "exception"),
    };
    StopInfo {
        reason,
        thread_id: Some(thread.id),
        description,
        hit_breakpoint_ids,
    }
}
