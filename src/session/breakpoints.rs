//! Reconciliation of the client breakpoint set with the engine breakpoints.
//!
//! Every `setBreakpoints`-like request carries the full desired state of its scope (one source,
//! all function breakpoints, all exception filters). Entries that disappeared are deleted, new
//! ones are created and surviving ones keep their engine id.

use crate::dap::protocol::{Breakpoint, DapRequest, FunctionBreakpoint, Source, SourceBreakpoint};
use crate::engine::{BreakpointChange, BreakpointId, EngineError, FrameRef, ThreadInfo, StopReason};
use crate::error::{Error, Result};
use crate::lang::{self, ExceptionFilter};
use crate::session::disassembly::DisassembledRange;
use crate::session::format::{render_value, Format};
use crate::session::handles::Handle;
use crate::session::{parse_args, DebugSession, HandlerResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::str::FromStr;

/// How often a breakpoint must be hit before it stops the debuggee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitCondition {
    Lt(u32),
    Le(u32),
    Eq(u32),
    Ge(u32),
    Gt(u32),
    /// Every N-th hit.
    Mod(u32),
}

impl FromStr for HitCondition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = || format!("Invalid hit condition: {s}");
        let (ctor, number): (fn(u32) -> HitCondition, &str) =
            if let Some(rest) = text.strip_prefix("<=") {
                (HitCondition::Le, rest)
            } else if let Some(rest) = text.strip_prefix(">=") {
                (HitCondition::Ge, rest)
            } else if let Some(rest) = text.strip_prefix("==") {
                (HitCondition::Eq, rest)
            } else if let Some(rest) = text.strip_prefix('<') {
                (HitCondition::Lt, rest)
            } else if let Some(rest) = text.strip_prefix('>') {
                (HitCondition::Gt, rest)
            } else if let Some(rest) = text.strip_prefix('=') {
                (HitCondition::Eq, rest)
            } else if let Some(rest) = text.strip_prefix('%') {
                (HitCondition::Mod, rest)
            } else {
                (HitCondition::Ge, text)
            };
        let number: u32 = number.trim().parse().map_err(|_| invalid())?;
        let condition = ctor(number);
        if condition == HitCondition::Mod(0) {
            return Err(invalid());
        }
        Ok(condition)
    }
}

impl HitCondition {
    pub fn is_satisfied(self, hit_count: u32) -> bool {
        match self {
            HitCondition::Lt(n) => hit_count < n,
            HitCondition::Le(n) => hit_count <= n,
            HitCondition::Eq(n) => hit_count == n,
            HitCondition::Ge(n) => hit_count >= n,
            HitCondition::Gt(n) => hit_count > n,
            HitCondition::Mod(n) => n != 0 && hit_count % n == 0,
        }
    }
}

impl Display for HitCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HitCondition::Lt(n) => write!(f, "<{n}"),
            HitCondition::Le(n) => write!(f, "<={n}"),
            HitCondition::Eq(n) => write!(f, "=={n}"),
            HitCondition::Ge(n) => write!(f, ">={n}"),
            HitCondition::Gt(n) => write!(f, ">{n}"),
            HitCondition::Mod(n) => write!(f, "%{n}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Path(String),
    /// Disassembly source reference.
    Reference(Handle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    Source,
    Function,
    Exception,
    /// Created by the engine itself (console commands, init commands).
    External,
}

#[derive(Debug)]
pub struct BreakpointInfo {
    pub kind: BreakpointKind,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub log_message: Option<String>,
    pub hit_count: u32,
    pub is_disassembly: bool,
}

impl BreakpointInfo {
    fn new(kind: BreakpointKind) -> Self {
        Self {
            kind,
            condition: None,
            hit_condition: None,
            log_message: None,
            hit_count: 0,
            is_disassembly: false,
        }
    }
}

/// Breakpoints known to the session.
///
/// An engine id lives in at most one of `source`, `function` and `exception`; `info` has an
/// entry for every tracked id.
#[derive(Default)]
pub struct Breakpoints {
    source: HashMap<SourceKey, BTreeMap<u32, BreakpointId>>,
    function: HashMap<String, BreakpointId>,
    exception: Vec<BreakpointId>,
    info: HashMap<BreakpointId, BreakpointInfo>,
    /// Deleted by the session, the engine removal event is still in flight.
    deleted: HashSet<BreakpointId>,
}

impl Breakpoints {
    pub fn exception_ids(&self) -> &[BreakpointId] {
        &self.exception
    }

    pub fn info(&self, id: BreakpointId) -> Option<&BreakpointInfo> {
        self.info.get(&id)
    }

    pub fn is_tracked(&self, id: BreakpointId) -> bool {
        self.info.contains_key(&id)
    }

    pub fn source_lines(&self, key: &SourceKey) -> Vec<(u32, BreakpointId)> {
        self.source
            .get(key)
            .map(|lines| lines.iter().map(|(l, id)| (*l, *id)).collect())
            .unwrap_or_default()
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.function.keys().map(String::as_str).collect()
    }

    fn forget(&mut self, id: BreakpointId) {
        self.info.remove(&id);
        for lines in self.source.values_mut() {
            lines.retain(|_, bp| *bp != id);
        }
        self.function.retain(|_, bp| *bp != id);
        self.exception.retain(|bp| *bp != id);
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointsArguments {
    source: Source,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFunctionBreakpointsArguments {
    #[serde(default)]
    breakpoints: Vec<FunctionBreakpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    filters: Vec<String>,
}

const NO_DEBUG_MESSAGE: &str = "Breakpoints are disabled in noDebug mode";

impl DebugSession {
    pub(super) fn handle_set_breakpoints(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: SetBreakpointsArguments = parse_args(req)?;
        if self.no_debug {
            return Ok(HandlerResult::Body(no_debug_response(args.breakpoints.len())));
        }

        let (key, range) = match (args.source.source_reference, &args.source.path) {
            (Some(reference), _) if reference > 0 => {
                let range = self.disassembly.find_by_handle(reference).ok_or_else(|| {
                    Error::user(format!("Unknown source reference {reference}"))
                })?;
                (SourceKey::Reference(reference), Some(range))
            }
            (_, Some(path)) => (SourceKey::Path(path.clone()), None),
            _ => {
                return Err(Error::Protocol(
                    "source has neither a path nor a source reference".to_string(),
                ))
            }
        };

        self.ignore_bp_events = true;
        let breakpoints = self.reconcile_source(key, range, &args.breakpoints);
        self.ignore_bp_events = false;
        Ok(HandlerResult::Body(json!({ "breakpoints": breakpoints })))
    }

    fn reconcile_source(
        &mut self,
        key: SourceKey,
        range: Option<Rc<DisassembledRange>>,
        requests: &[SourceBreakpoint],
    ) -> Vec<Breakpoint> {
        let desired: HashSet<u32> = requests.iter().map(|r| r.line).collect();
        let existing = self.breakpoints.source.remove(&key).unwrap_or_default();
        let mut lines = BTreeMap::new();
        for (line, id) in existing {
            if desired.contains(&line) {
                lines.insert(line, id);
            } else {
                self.delete_breakpoint(id);
            }
        }

        let mut result = Vec::with_capacity(requests.len());
        for request in requests {
            let id = match lines.get(&request.line) {
                Some(id) => Ok(*id),
                None => self.create_source_breakpoint(&key, range.as_deref(), request.line),
            };
            match id {
                Ok(id) => {
                    lines.insert(request.line, id);
                    let warning = self.configure_breakpoint(
                        id,
                        request.condition.as_deref(),
                        request.hit_condition.as_deref(),
                        request.log_message.as_deref(),
                    );
                    result.push(self.describe_breakpoint(id, warning));
                }
                Err(e) => result.push(unverified(e.message)),
            }
        }
        log::debug!(target: "session", "{key:?}: breakpoints on lines {:?}", lines.keys().collect::<Vec<_>>());
        self.breakpoints.source.insert(key, lines);
        result
    }

    fn create_source_breakpoint(
        &mut self,
        key: &SourceKey,
        range: Option<&DisassembledRange>,
        line: u32,
    ) -> std::result::Result<BreakpointId, EngineError> {
        let (id, is_disassembly) = match (key, range) {
            (SourceKey::Reference(_), Some(range)) => {
                let address = range.address_by_line_num(line).ok_or_else(|| {
                    EngineError::new(format!("No instruction at line {line}"))
                })?;
                (self.engine.breakpoint_create_by_address(address)?, true)
            }
            (SourceKey::Path(path), _) => {
                (self.engine.breakpoint_create_by_location(path, line)?, false)
            }
            (SourceKey::Reference(reference), None) => {
                return Err(EngineError::new(format!(
                    "Unknown source reference {reference}"
                )))
            }
        };
        let mut info = BreakpointInfo::new(BreakpointKind::Source);
        info.is_disassembly = is_disassembly;
        self.breakpoints.info.insert(id, info);
        Ok(id)
    }

    pub(super) fn handle_set_function_breakpoints(
        &mut self,
        req: &DapRequest,
    ) -> Result<HandlerResult> {
        let args: SetFunctionBreakpointsArguments = parse_args(req)?;
        if self.no_debug {
            return Ok(HandlerResult::Body(no_debug_response(args.breakpoints.len())));
        }

        self.ignore_bp_events = true;
        let desired: HashSet<&str> = args.breakpoints.iter().map(|b| b.name.as_str()).collect();
        let existing = std::mem::take(&mut self.breakpoints.function);
        let mut names = HashMap::new();
        for (name, id) in existing {
            if desired.contains(name.as_str()) {
                names.insert(name, id);
            } else {
                self.delete_breakpoint(id);
            }
        }

        let mut result = Vec::with_capacity(args.breakpoints.len());
        for request in &args.breakpoints {
            let id = match names.get(&request.name) {
                Some(id) => Ok(*id),
                None => self.create_function_breakpoint(&request.name),
            };
            match id {
                Ok(id) => {
                    names.insert(request.name.clone(), id);
                    let warning = self.configure_breakpoint(
                        id,
                        request.condition.as_deref(),
                        request.hit_condition.as_deref(),
                        None,
                    );
                    result.push(self.describe_breakpoint(id, warning));
                }
                Err(e) => result.push(unverified(e.message)),
            }
        }
        self.breakpoints.function = names;
        self.ignore_bp_events = false;
        Ok(HandlerResult::Body(json!({ "breakpoints": result })))
    }

    fn create_function_breakpoint(
        &mut self,
        name: &str,
    ) -> std::result::Result<BreakpointId, EngineError> {
        let id = match name.strip_prefix('/') {
            Some(pattern) => self.engine.breakpoint_create_by_regex(pattern)?,
            None => self.engine.breakpoint_create_by_name(name)?,
        };
        self.breakpoints
            .info
            .insert(id, BreakpointInfo::new(BreakpointKind::Function));
        Ok(id)
    }

    pub(super) fn handle_set_exception_breakpoints(
        &mut self,
        req: &DapRequest,
    ) -> Result<HandlerResult> {
        let args: SetExceptionBreakpointsArguments = parse_args(req)?;
        if self.no_debug {
            return Ok(HandlerResult::Body(json!({})));
        }

        self.ignore_bp_events = true;
        for id in std::mem::take(&mut self.breakpoints.exception) {
            self.delete_breakpoint(id);
        }

        let filters: Vec<ExceptionFilter> = args
            .filters
            .iter()
            .filter_map(|f| crate::weak_error!(f.parse::<ExceptionFilter>(), "unknown exception filter:"))
            .collect();
        let mut result = vec![];
        for language in self.source_languages.clone() {
            for filter in &filters {
                let Some(site) = lang::exception_site(&language, *filter) else {
                    log::debug!(target: "session", "no exception breakpoints for language {language}");
                    continue;
                };
                match site.create(self.engine.as_mut()) {
                    Ok(id) => {
                        self.breakpoints
                            .info
                            .insert(id, BreakpointInfo::new(BreakpointKind::Exception));
                        self.breakpoints.exception.push(id);
                        result.push(self.describe_breakpoint(id, None));
                    }
                    Err(e) => {
                        log::warn!(target: "session", "{language} {filter} exception breakpoint: {e}");
                        result.push(unverified(e.message));
                    }
                }
            }
        }
        self.ignore_bp_events = false;
        Ok(HandlerResult::Body(json!({ "breakpoints": result })))
    }

    /// Apply condition, hit condition and log message, return a warning for the client.
    fn configure_breakpoint(
        &mut self,
        id: BreakpointId,
        condition: Option<&str>,
        hit_condition: Option<&str>,
        log_message: Option<&str>,
    ) -> Option<String> {
        let info = self.breakpoints.info.get_mut(&id)?;
        let condition = condition.filter(|c| !c.trim().is_empty());
        if info.condition.as_deref() != condition {
            self.engine.breakpoint_set_condition(id, condition);
            info.condition = condition.map(str::to_string);
        }
        info.log_message = log_message.filter(|m| !m.is_empty()).map(str::to_string);

        let hit_condition = hit_condition.filter(|c| !c.trim().is_empty());
        match hit_condition.map(str::parse::<HitCondition>) {
            None => {
                info.hit_condition = None;
                None
            }
            Some(Ok(parsed)) => {
                if info.hit_condition != Some(parsed) {
                    info.hit_count = 0;
                }
                info.hit_condition = Some(parsed);
                None
            }
            Some(Err(e)) => {
                info.hit_condition = None;
                Some(e)
            }
        }
    }

    pub(super) fn describe_breakpoint(
        &self,
        id: BreakpointId,
        message: Option<String>,
    ) -> Breakpoint {
        let is_disassembly = self
            .breakpoints
            .info
            .get(&id)
            .map(|i| i.is_disassembly)
            .unwrap_or(false);
        let locations = self.engine.breakpoint_locations(id);
        let mut breakpoint = Breakpoint {
            id: Some(id),
            verified: !locations.is_empty() || is_disassembly,
            message: Some(message.unwrap_or_else(|| format!("Locations: {}", locations.len()))),
            source: None,
            line: None,
        };
        if let Some(location) = locations.first() {
            let range = self
                .disassembly
                .find_by_address(location.address)
                .filter(|_| is_disassembly);
            match (range, &location.line_entry) {
                (Some(range), _) => {
                    breakpoint.source = Some(range.source());
                    breakpoint.line = Some(range.line_num_by_address(location.address));
                }
                (None, Some(entry)) => {
                    breakpoint.source = Some(Source::from_path(&entry.file));
                    breakpoint.line = Some(entry.line);
                }
                (None, None) => {}
            }
        }
        breakpoint
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) {
        if self.engine.breakpoint_delete(id) {
            self.breakpoints.deleted.insert(id);
        }
        self.breakpoints.info.remove(&id);
    }

    /// Engine side breakpoint changes that did not come from a client request.
    pub(super) fn on_breakpoint_event(&mut self, id: BreakpointId, change: BreakpointChange) {
        // the flag only covers events delivered while a handler runs, queued events are
        // filtered by the tracked and deleted ids below
        if self.ignore_bp_events {
            return;
        }
        match change {
            BreakpointChange::Added => {
                if self.breakpoints.is_tracked(id) || self.breakpoints.deleted.contains(&id) {
                    return;
                }
                self.breakpoints
                    .info
                    .insert(id, BreakpointInfo::new(BreakpointKind::External));
                let breakpoint = self.describe_breakpoint(id, None);
                self.send_event("breakpoint", json!({"reason": "new", "breakpoint": breakpoint}));
            }
            BreakpointChange::LocationsResolved => {
                if self.breakpoints.is_tracked(id) {
                    let breakpoint = self.describe_breakpoint(id, None);
                    self.send_event(
                        "breakpoint",
                        json!({"reason": "changed", "breakpoint": breakpoint}),
                    );
                }
            }
            BreakpointChange::Removed => {
                if self.breakpoints.deleted.remove(&id) {
                    return;
                }
                if self.breakpoints.is_tracked(id) {
                    self.breakpoints.forget(id);
                    self.send_event(
                        "breakpoint",
                        json!({"reason": "removed", "breakpoint": {"id": id, "verified": false}}),
                    );
                }
            }
        }
    }

    /// Count hits of the breakpoints that stopped `threads` and decide whether the stop is
    /// reported to the client. Logpoints print their message and never stop.
    pub(super) fn should_report_stop(&mut self, threads: &[ThreadInfo]) -> bool {
        let hits: Vec<(FrameRef, BreakpointId)> = threads
            .iter()
            .filter_map(|t| match &t.stop_reason {
                StopReason::Breakpoint(ids) => Some((t.id, ids.clone())),
                _ => None,
            })
            .flat_map(|(thread, ids)| {
                ids.into_iter()
                    .map(move |id| (FrameRef { thread, index: 0 }, id))
            })
            .collect();
        if hits.is_empty() {
            return true;
        }

        let mut report = false;
        for (frame, id) in hits {
            let Some(info) = self.breakpoints.info.get_mut(&id) else {
                report = true;
                continue;
            };
            info.hit_count += 1;
            if let Some(condition) = info.hit_condition {
                if !condition.is_satisfied(info.hit_count) {
                    log::debug!(target: "session", "breakpoint {id} hit {} times, {condition} not met", info.hit_count);
                    continue;
                }
            }
            match info.log_message.clone() {
                Some(message) => {
                    let line = self.interpolate_log_message(&message, frame);
                    self.console_message(line);
                }
                None => report = true,
            }
        }
        report
    }

    /// Replace every `{expression}` of a logpoint message with its value in `frame`.
    fn interpolate_log_message(&mut self, message: &str, frame: FrameRef) -> String {
        static PLACEHOLDER: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("must compile"));

        let format = Format::from(self.display_format);
        let engine = &mut self.engine;
        PLACEHOLDER
            .replace_all(message, |caps: &Captures| {
                match engine.evaluate(caps[1].trim(), Some(frame)) {
                    Ok(value) => render_value(value.as_ref(), format),
                    Err(e) => format!("<{e}>"),
                }
            })
            .into_owned()
    }
}

fn unverified(message: String) -> Breakpoint {
    Breakpoint {
        verified: false,
        message: Some(message),
        ..Breakpoint::default()
    }
}

fn no_debug_response(count: usize) -> serde_json::Value {
    let breakpoints: Vec<Breakpoint> = (0..count)
        .map(|_| unverified(NO_DEBUG_MESSAGE.to_string()))
        .collect();
    json!({ "breakpoints": breakpoints })
}
