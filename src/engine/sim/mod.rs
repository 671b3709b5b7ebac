//! In-memory debugger engine driven by a scripted execution trace.
//!
//! The debuggee is a [`Program`]: functions with line tables, threads, statics and a trace of
//! steps. `resume` walks the trace until a step hits an enabled breakpoint, carries a signal or
//! an exception, or the trace ends (process exit). Step requests move over the trace by stack
//! depth the way a source-level debugger would.

pub mod disasm;
pub mod program;
pub mod value;

use crate::engine::sim::disasm::Disassembler;
use crate::engine::sim::program::{Location, Program, TraceEntry};
use crate::engine::sim::value::{split_path, Literal, SimNode, SimValue};
use crate::engine::{
    Address, AttachConfig, BreakpointChange, BreakpointId, BreakpointLocation, CommandOutput,
    DebugEvent, Engine, EngineError, EngineResult, EventQueue, FrameInfo, FrameRef, Instruction,
    LaunchConfig, LineEntry, NumericValue, ProcessState, StepGranularity, StopReason, Symbol,
    ThreadId, ThreadInfo, ValueRef, VariableScope,
};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const SIGSTOP: i32 = 19;
const SIGKILL: i32 = 9;
const DEFAULT_PID: u32 = 4242;
const STACK_TOP: u64 = 0x7ffd_f000;

#[derive(Default)]
struct Queue {
    events: Mutex<VecDeque<DebugEvent>>,
    cond: Condvar,
}

/// Event queue handle shared between the engine and a listener thread.
#[derive(Clone, Default)]
pub struct SimEventQueue {
    inner: Arc<Queue>,
}

impl SimEventQueue {
    fn post(&self, event: DebugEvent) {
        if let Ok(mut events) = self.inner.events.lock() {
            events.push_back(event);
            self.inner.cond.notify_one();
        }
    }
}

impl EventQueue for SimEventQueue {
    fn wait_for_event(&self, timeout: Duration) -> Option<DebugEvent> {
        let events = self.inner.events.lock().ok()?;
        let (mut events, _) = self
            .inner
            .cond
            .wait_timeout_while(events, timeout, |events| events.is_empty())
            .ok()?;
        events.pop_front()
    }
}

enum BreakpointKind {
    Location { file: String, line: u32 },
    Address(Address),
    Name(String),
    Regex(Regex),
    Exception { language: String },
}

struct SimBreakpoint {
    kind: BreakpointKind,
    condition: Option<String>,
    locations: Vec<BreakpointLocation>,
}

/// Position of the stopped process in the trace.
struct StopPoint {
    step: usize,
    thread: ThreadId,
    reason: StopReason,
    frames: Vec<FrameInfo>,
    locals: Vec<Rc<SimNode>>,
}

struct SimProcess {
    pid: u32,
    state: ProcessState,
    stop: Option<StopPoint>,
    exit_code: Option<i32>,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    statics: Vec<Rc<SimNode>>,
}

pub struct SimEngine {
    program: Option<Program>,
    disasm: Option<Disassembler>,
    process: Option<SimProcess>,
    breakpoints: IndexMap<BreakpointId, SimBreakpoint>,
    next_breakpoint_id: BreakpointId,
    queue: SimEventQueue,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            program: None,
            disasm: crate::weak_error!(Disassembler::new()),
            process: None,
            breakpoints: IndexMap::new(),
            next_breakpoint_id: 1,
            queue: SimEventQueue::default(),
        }
    }

    /// Engine with a preloaded program, `create_target(None)` picks it up.
    pub fn with_program(program: Program) -> Self {
        let mut engine = Self::new();
        engine.program = Some(program);
        engine
    }

    fn program(&self) -> EngineResult<&Program> {
        self.program
            .as_ref()
            .ok_or_else(|| EngineError::new("no target"))
    }

    fn process(&self) -> EngineResult<&SimProcess> {
        self.process
            .as_ref()
            .ok_or_else(|| EngineError::new("no process"))
    }

    fn process_mut(&mut self) -> EngineResult<&mut SimProcess> {
        self.process
            .as_mut()
            .ok_or_else(|| EngineError::new("no process"))
    }

    fn stopped_process(&self) -> Option<&SimProcess> {
        self.process.as_ref().filter(|p| p.state.is_stopped())
    }

    fn set_state(&mut self, state: ProcessState) {
        if let Some(process) = self.process.as_mut() {
            process.state = state;
        }
        self.queue.post(DebugEvent::ProcessState {
            state,
            restarted: false,
        });
    }

    fn frames_of(program: &Program, stack: &[String]) -> Vec<FrameInfo> {
        stack
            .iter()
            .filter_map(|item| {
                let location = Location::parse(item).ok()?;
                let pc = program.resolve(&location).ok()?;
                Some(FrameInfo {
                    function: program.function_at(pc).map(|f| f.name.clone()),
                    pc,
                    line_entry: program.line_entry_at(pc),
                })
            })
            .collect()
    }

    fn entry_thread(program: &Program, entry: &TraceEntry) -> ThreadId {
        entry.thread.unwrap_or_else(|| program.main_thread())
    }

    fn make_stop(&self, step: usize, reason: StopReason) -> EngineResult<StopPoint> {
        let program = self.program()?;
        let entry = program
            .trace
            .get(step)
            .ok_or_else(|| EngineError::new("trace exhausted"))?;
        Ok(StopPoint {
            step,
            thread: Self::entry_thread(program, entry),
            reason,
            frames: Self::frames_of(program, &entry.stack),
            locals: entry
                .locals
                .iter()
                .map(|spec| SimNode::build(spec, None))
                .collect(),
        })
    }

    fn emit_output(&mut self, step: usize) {
        let Some(entry) = self.program.as_ref().and_then(|p| p.trace.get(step)) else {
            return;
        };
        let (stdout, stderr) = (entry.stdout.clone(), entry.stderr.clone());
        if let Some(process) = self.process.as_mut() {
            if let Some(text) = &stdout {
                process.stdout.extend(text.as_bytes());
            }
            if let Some(text) = &stderr {
                process.stderr.extend(text.as_bytes());
            }
        }
        if stdout.is_some() {
            self.queue.post(DebugEvent::Stdout);
        }
        if stderr.is_some() {
            self.queue.post(DebugEvent::Stderr);
        }
    }

    /// Scripted stop reason of a step (signal or exception).
    fn scripted_reason(entry: &TraceEntry) -> Option<StopReason> {
        if let Some(signal) = &entry.signal {
            return Some(StopReason::Signal {
                signo: signal_number(signal),
                name: signal.clone(),
            });
        }
        entry
            .exception
            .as_ref()
            .map(|e| StopReason::Exception(e.clone()))
    }

    /// Breakpoints hit by a step whose conditions hold.
    fn hit_breakpoints(&self, step: usize) -> Vec<BreakpointId> {
        let Some(pc) = self
            .program
            .as_ref()
            .and_then(|p| p.trace.get(step))
            .and_then(|e| e.stack.first())
            .and_then(|item| Location::parse(item).ok())
            .and_then(|loc| self.program.as_ref()?.resolve(&loc).ok())
        else {
            return vec![];
        };
        let stop = match self.make_stop(step, StopReason::None) {
            Ok(stop) => stop,
            Err(_) => return vec![],
        };
        self.breakpoints
            .iter()
            .filter(|(_, bp)| bp.locations.iter().any(|l| l.address == pc))
            .filter(|(_, bp)| match &bp.condition {
                None => true,
                Some(cond) => self
                    .eval_in(cond, &stop.locals)
                    .ok()
                    .and_then(|v| v.as_signed())
                    .map(|v| v != 0)
                    .unwrap_or(true),
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn stack_depth(&self, step: usize) -> usize {
        self.program
            .as_ref()
            .and_then(|p| p.trace.get(step))
            .map(|e| e.stack.len())
            .unwrap_or(0)
    }

    /// Run forward from the current position until `should_stop` or a breakpoint fires.
    fn run_trace(
        &mut self,
        moving: ProcessState,
        should_stop: impl Fn(&Self, usize) -> bool,
    ) -> EngineResult<()> {
        let first = match &self.process()?.stop {
            Some(stop) => stop.step + 1,
            None => 0,
        };
        let total = self.program()?.trace.len();
        self.set_state(moving);
        for step in first..total {
            self.emit_output(step);
            let entry = &self.program()?.trace[step];
            let reason = if let Some(reason) = Self::scripted_reason(entry) {
                Some(reason)
            } else {
                let hits = self.hit_breakpoints(step);
                if !hits.is_empty() {
                    Some(StopReason::Breakpoint(hits))
                } else if should_stop(self, step) {
                    Some(StopReason::PlanComplete)
                } else {
                    None
                }
            };
            if let Some(reason) = reason {
                let stop = self.make_stop(step, reason)?;
                self.process_mut()?.stop = Some(stop);
                self.set_state(ProcessState::Stopped);
                return Ok(());
            }
        }
        let code = self.program()?.exit_code;
        let process = self.process_mut()?;
        process.stop = None;
        process.exit_code = Some(code);
        self.set_state(ProcessState::Exited);
        Ok(())
    }

    fn check_can_move(&self, thread: Option<ThreadId>) -> EngineResult<()> {
        let process = self.process()?;
        if !process.state.is_stopped() && process.state != ProcessState::Launching {
            return Err(EngineError::new("Process is not stopped"));
        }
        if let (Some(thread), Some(stop)) = (thread, &process.stop) {
            let known = self
                .program()?
                .threads
                .iter()
                .any(|t| t.id == thread);
            if !known || (thread != stop.thread && !process.state.is_stopped()) {
                return Err(EngineError::new(format!("invalid thread {thread}")));
            }
        }
        Ok(())
    }

    fn start_process(&mut self, pid: u32) -> EngineResult<()> {
        let program = self.program()?;
        let statics = program
            .statics
            .iter()
            .map(|spec| SimNode::build(spec, None))
            .collect();
        let modules = program.modules.clone();
        self.process = Some(SimProcess {
            pid,
            state: ProcessState::Launching,
            stop: None,
            exit_code: None,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            statics,
        });
        for path in modules {
            self.queue.post(DebugEvent::ModuleLoaded { path });
        }
        Ok(())
    }

    fn stop_at_entry(&mut self) -> EngineResult<()> {
        if self.program()?.trace.is_empty() {
            return Err(EngineError::new("program has no steps to stop at"));
        }
        let stop = self.make_stop(
            0,
            StopReason::Signal {
                signo: SIGSTOP,
                name: "SIGSTOP".to_string(),
            },
        )?;
        self.emit_output(0);
        let process = self.process_mut()?;
        process.stop = Some(stop);
        process.state = ProcessState::Stopped;
        Ok(())
    }

    fn resolve_breakpoint(&self, kind: &BreakpointKind) -> Vec<BreakpointLocation> {
        let Some(program) = self.program.as_ref() else {
            return vec![];
        };
        let location = |address: Address| BreakpointLocation {
            address,
            line_entry: program.line_entry_at(address),
        };
        match kind {
            BreakpointKind::Location { file, line } => program
                .functions
                .iter()
                .filter(|f| f.file.as_deref() == Some(file.as_str()))
                .filter_map(|f| f.address_of_line(*line))
                .map(location)
                .collect(),
            BreakpointKind::Address(addr) => vec![location(*addr)],
            BreakpointKind::Name(name) => program
                .function(name)
                .map(|f| vec![location(f.start)])
                .unwrap_or_default(),
            BreakpointKind::Regex(re) => program
                .functions
                .iter()
                .filter(|f| re.is_match(&f.name))
                .map(|f| location(f.start))
                .collect(),
            BreakpointKind::Exception { language } => {
                let thrower = match language.as_str() {
                    "cpp" | "c++" => "__cxa_throw",
                    _ => "",
                };
                program
                    .function(thrower)
                    .map(|f| vec![location(f.start)])
                    .unwrap_or_default()
            }
        }
    }

    fn add_breakpoint(&mut self, kind: BreakpointKind) -> EngineResult<BreakpointId> {
        self.program()?;
        let locations = self.resolve_breakpoint(&kind);
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.insert(
            id,
            SimBreakpoint {
                kind,
                condition: None,
                locations,
            },
        );
        self.queue.post(DebugEvent::Breakpoint {
            id,
            change: BreakpointChange::Added,
        });
        Ok(id)
    }

    fn scope_values(&self, frame: FrameRef, scope: VariableScope) -> Vec<Rc<SimNode>> {
        let Some(process) = self.stopped_process() else {
            return vec![];
        };
        match scope {
            VariableScope::Statics => process.statics.clone(),
            VariableScope::Locals => match &process.stop {
                Some(stop) if stop.thread == frame.thread && frame.index == 0 => {
                    stop.locals.clone()
                }
                _ => vec![],
            },
        }
    }

    fn eval_in(&self, expression: &str, locals: &[Rc<SimNode>]) -> EngineResult<ValueRef> {
        static COMPARISON: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^\s*(.+?)\s*(==|!=|<=|>=|<|>)\s*(.+?)\s*$").expect("must compile")
        });

        if let Some(caps) = COMPARISON.captures(expression) {
            let lhs = self.eval_in(&caps[1], locals)?;
            let rhs = self.eval_in(&caps[3], locals)?;
            let (l, r) = match (lhs.as_float(), rhs.as_float()) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(EngineError::new("invalid operands to binary expression")),
            };
            let result = match &caps[2] {
                "==" => l == r,
                "!=" => l != r,
                "<=" => l <= r,
                ">=" => l >= r,
                "<" => l < r,
                _ => l > r,
            };
            return Ok(SimValue::new(SimNode::scalar(
                expression,
                "bool",
                Literal::Bool(result),
            )));
        }

        let expression = expression.trim();
        if let Some(value) = parse_number(expression) {
            return Ok(SimValue::new(SimNode::scalar(expression, "int", value)));
        }
        let parts = split_path(expression).ok_or_else(|| {
            EngineError::new(format!("error: invalid expression '{expression}'"))
        })?;
        let (root, rest) = parts
            .split_first()
            .ok_or_else(|| EngineError::new("error: empty expression"))?;
        let statics = self
            .process
            .as_ref()
            .map(|p| p.statics.as_slice())
            .unwrap_or(&[]);
        let mut node = locals
            .iter()
            .chain(statics.iter())
            .find(|n| &n.name == root)
            .cloned()
            .ok_or_else(|| {
                EngineError::new(format!("error: use of undeclared identifier '{root}'"))
            })?;
        for part in rest {
            let Some(next) = node.children().iter().find(|c| &c.name == part).cloned() else {
                return Err(EngineError::new(format!(
                    "error: no member named '{part}' in '{}'",
                    node.type_name
                )));
            };
            node = next;
        }
        Ok(SimValue::new(node))
    }

    fn register_set(&self, frame: FrameRef, info: &FrameInfo) -> Rc<SimNode> {
        let sp = STACK_TOP - 0x40 * (frame.index as u64 + 1);
        let regs = [
            ("rip", info.pc),
            ("rsp", sp),
            ("rbp", sp + 0x30),
            ("rax", 0),
        ]
        .into_iter()
        .map(|(name, value)| SimNode::scalar(name, "unsigned long", Literal::Int(value as i64)))
        .collect();
        SimNode::aggregate("General Purpose Registers", "", regs)
    }

    fn command(&mut self, command: &str, frame: Option<FrameRef>) -> EngineResult<String> {
        let mut words = command.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(String::new());
        };
        let rest: Vec<&str> = words.collect();
        match (head, rest.as_slice()) {
            ("version", _) => Ok(format!("stalker sim engine {}\n", env!("CARGO_PKG_VERSION"))),
            ("echo", text) => Ok(format!("{}\n", text.join(" "))),
            ("settings", ["set", ..]) => Ok(String::new()),
            ("b", [name]) | ("breakpoint", ["set", "--name" | "-n", name]) => {
                let id = self.add_breakpoint(BreakpointKind::Name(name.to_string()))?;
                let count = self.breakpoint_locations(id).len();
                Ok(format!("Breakpoint {id}: {name}, locations = {count}\n"))
            }
            ("process", ["status"]) => {
                let process = self.process()?;
                Ok(format!("Process {} {:?}\n", process.pid, process.state))
            }
            ("frame", ["variable"]) => {
                let frame = frame.ok_or_else(|| EngineError::new("no frame selected"))?;
                let mut out = String::new();
                for value in self.variables(frame, VariableScope::Locals) {
                    out.push_str(&format!(
                        "({}) {} = {}\n",
                        value.type_name().unwrap_or_default(),
                        value.name().unwrap_or_default(),
                        value.value().or_else(|| value.summary()).unwrap_or_default()
                    ));
                }
                Ok(out)
            }
            _ => Err(EngineError::new(format!(
                "error: '{head}' is not a valid command."
            ))),
        }
    }
}

fn signal_number(name: &str) -> i32 {
    match name {
        "SIGINT" => 2,
        "SIGILL" => 4,
        "SIGTRAP" => 5,
        "SIGABRT" => 6,
        "SIGFPE" => 8,
        "SIGKILL" => SIGKILL,
        "SIGSEGV" => 11,
        "SIGSTOP" => SIGSTOP,
        _ => 0,
    }
}

fn parse_number(text: &str) -> Option<Literal> {
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(Literal::Int);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Some(Literal::Int(v));
    }
    if text.contains('.') {
        return text.parse::<f64>().ok().map(Literal::Float);
    }
    None
}

impl Engine for SimEngine {
    fn create_target(&mut self, program: Option<&str>) -> EngineResult<()> {
        match program {
            Some(path) => {
                self.program = Some(Program::load(Path::new(path))?);
            }
            None if self.program.is_some() => {}
            None => return Err(EngineError::new("no program to create a target from")),
        }
        Ok(())
    }

    fn has_target(&self) -> bool {
        self.program.is_some()
    }

    fn launch(&mut self, config: &LaunchConfig) -> EngineResult<u32> {
        if self.process.as_ref().is_some_and(|p| p.state.is_alive()) {
            return Err(EngineError::new("process already running"));
        }
        if !self.has_target() {
            self.create_target(Some(&config.program))?;
        }
        if let Some(cwd) = &config.cwd {
            if !Path::new(cwd).is_dir() {
                return Err(EngineError::new(format!(
                    "working directory '{cwd}' does not exist"
                )));
            }
        }
        self.start_process(DEFAULT_PID)?;
        if config.stop_on_entry {
            self.stop_at_entry()?;
        } else {
            self.run_trace(ProcessState::Running, |_, _| false)?;
        }
        Ok(DEFAULT_PID)
    }

    fn attach(&mut self, config: &AttachConfig) -> EngineResult<u32> {
        if config.pid.is_none() && config.program.is_none() {
            return Err(EngineError::new("attach requires a pid or a program"));
        }
        if !self.has_target() {
            self.create_target(config.program.as_deref())?;
        }
        let pid = config.pid.unwrap_or(DEFAULT_PID);
        self.start_process(pid)?;
        self.stop_at_entry()?;
        Ok(pid)
    }

    fn process_state(&self) -> ProcessState {
        self.process
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(ProcessState::Invalid)
    }

    fn exit_status(&self) -> Option<i32> {
        self.process.as_ref().and_then(|p| p.exit_code)
    }

    fn resume(&mut self) -> EngineResult<()> {
        self.check_can_move(None)?;
        self.run_trace(ProcessState::Running, |_, _| false)
    }

    fn stop(&mut self) -> EngineResult<()> {
        let process = self.process()?;
        if process.state != ProcessState::Running {
            return Err(EngineError::new("Process is not running"));
        }
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn kill(&mut self) -> EngineResult<()> {
        let process = self.process_mut()?;
        if !process.state.is_alive() {
            return Err(EngineError::new("Process is not alive"));
        }
        process.exit_code = Some(SIGKILL);
        process.stop = None;
        self.set_state(ProcessState::Exited);
        Ok(())
    }

    fn detach(&mut self) -> EngineResult<()> {
        let process = self.process_mut()?;
        if !process.state.is_alive() {
            return Err(EngineError::new("Process is not alive"));
        }
        process.stop = None;
        self.set_state(ProcessState::Detached);
        Ok(())
    }

    fn clear(&mut self) {
        self.process = None;
        self.program = None;
        self.breakpoints.clear();
    }

    fn event_queue(&self) -> Box<dyn EventQueue> {
        Box::new(self.queue.clone())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> usize {
        match self.process.as_mut() {
            Some(process) => drain_into(&mut process.stdout, buf),
            None => 0,
        }
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> usize {
        match self.process.as_mut() {
            Some(process) => drain_into(&mut process.stderr, buf),
            None => 0,
        }
    }

    fn execute_command(&mut self, command: &str, frame: Option<FrameRef>) -> CommandOutput {
        match self.command(command, frame) {
            Ok(output) => CommandOutput {
                succeeded: true,
                output,
                error: String::new(),
            },
            Err(e) => CommandOutput {
                succeeded: false,
                output: String::new(),
                error: e.message,
            },
        }
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        let (Some(program), Some(process)) = (self.program.as_ref(), self.stopped_process())
        else {
            return vec![];
        };
        program
            .threads
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let reason = match &process.stop {
                    Some(stop) if stop.thread == t.id => stop.reason.clone(),
                    _ => StopReason::None,
                };
                let description = match &reason {
                    StopReason::Breakpoint(ids) => Some(format!(
                        "breakpoint {}",
                        ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
                    )),
                    StopReason::Signal { name, .. } => Some(format!("signal {name}")),
                    StopReason::Exception(text) => Some(text.clone()),
                    StopReason::PlanComplete => Some("step over".to_string()),
                    _ => None,
                };
                ThreadInfo {
                    id: t.id,
                    index: i as u32 + 1,
                    name: t.name.clone(),
                    stop_reason: reason,
                    stop_description: description,
                }
            })
            .collect()
    }

    fn selected_thread(&self) -> Option<ThreadId> {
        self.stopped_process()?.stop.as_ref().map(|s| s.thread)
    }

    fn frames(&self, thread: ThreadId) -> Vec<FrameInfo> {
        let (Some(program), Some(process)) = (self.program.as_ref(), self.stopped_process())
        else {
            return vec![];
        };
        match &process.stop {
            Some(stop) if stop.thread == thread => stop.frames.clone(),
            _ => program
                .threads
                .iter()
                .find(|t| t.id == thread)
                .map(|t| Self::frames_of(program, &t.stack))
                .unwrap_or_default(),
        }
    }

    fn step_over(&mut self, thread: ThreadId, granularity: StepGranularity) -> EngineResult<()> {
        self.check_can_move(Some(thread))?;
        log::debug!(target: "engine", "step over {thread} ({granularity:?})");
        let depth = self.process()?.stop.as_ref().map(|s| self.stack_depth(s.step));
        self.run_trace(ProcessState::Stepping, move |engine, step| match depth {
            Some(depth) => engine.stack_depth(step) <= depth,
            None => true,
        })
    }

    fn step_into(&mut self, thread: ThreadId, granularity: StepGranularity) -> EngineResult<()> {
        self.check_can_move(Some(thread))?;
        log::debug!(target: "engine", "step into {thread} ({granularity:?})");
        self.run_trace(ProcessState::Stepping, |_, _| true)
    }

    fn step_out(&mut self, thread: ThreadId) -> EngineResult<()> {
        self.check_can_move(Some(thread))?;
        let depth = self.process()?.stop.as_ref().map(|s| self.stack_depth(s.step));
        self.run_trace(ProcessState::Stepping, move |engine, step| match depth {
            Some(depth) => engine.stack_depth(step) < depth,
            None => true,
        })
    }

    fn variables(&self, frame: FrameRef, scope: VariableScope) -> Vec<ValueRef> {
        self.scope_values(frame, scope)
            .into_iter()
            .map(SimValue::new)
            .collect()
    }

    fn registers(&self, frame: FrameRef) -> Vec<ValueRef> {
        match self.frame(frame) {
            Some(info) => vec![SimValue::new(self.register_set(frame, &info))],
            None => vec![],
        }
    }

    fn find_variable(&self, frame: FrameRef, name: &str) -> Option<ValueRef> {
        self.scope_values(frame, VariableScope::Locals)
            .into_iter()
            .chain(self.scope_values(frame, VariableScope::Statics))
            .find(|n| n.name == name)
            .map(SimValue::new)
    }

    fn evaluate(&mut self, expression: &str, frame: Option<FrameRef>) -> EngineResult<ValueRef> {
        let locals = match frame {
            Some(frame) => self.scope_values(frame, VariableScope::Locals),
            None => vec![],
        };
        self.eval_in(expression, &locals)
    }

    fn symbol_at(&self, address: Address) -> Option<Symbol> {
        let func = self.program.as_ref()?.function_at(address)?;
        let end = func.end();
        Some(Symbol {
            name: func.name.clone(),
            start: func.start,
            end,
            description: format!(
                "id = {{0x{:08x}}}, range = [0x{:016x}-0x{:016x}), name=\"{}\"",
                func.start, func.start, end, func.name
            ),
        })
    }

    fn line_entry_at(&self, address: Address) -> Option<LineEntry> {
        self.program.as_ref()?.line_entry_at(address)
    }

    fn instructions(&self, start: Address, end: Address) -> Vec<Instruction> {
        let (Some(program), Some(disasm)) = (self.program.as_ref(), self.disasm.as_ref()) else {
            return vec![];
        };
        let mut funcs: Vec<_> = program
            .functions
            .iter()
            .filter(|f| f.start < end && f.end() > start)
            .collect();
        funcs.sort_by_key(|f| f.start);
        funcs
            .into_iter()
            .flat_map(|f| disasm.function(f))
            .filter(|i| i.address >= start && i.address < end)
            .collect()
    }

    fn read_instructions(&self, start: Address, count: usize) -> Vec<Instruction> {
        let mut result = vec![];
        let mut address = start;
        while result.len() < count {
            let decoded = match self.symbol_at(address) {
                Some(symbol) => self.instructions(address, symbol.end),
                None => vec![],
            };
            if decoded.is_empty() {
                result.push(Instruction {
                    address,
                    bytes: vec![0],
                    mnemonic: "(bad)".to_string(),
                    operands: String::new(),
                    comment: None,
                });
                address += 1;
                continue;
            }
            for insn in decoded {
                if result.len() == count {
                    break;
                }
                address = insn.address + insn.bytes.len() as u64;
                result.push(insn);
            }
        }
        result
    }

    fn breakpoint_create_by_location(
        &mut self,
        file: &str,
        line: u32,
    ) -> EngineResult<BreakpointId> {
        self.add_breakpoint(BreakpointKind::Location {
            file: file.to_string(),
            line,
        })
    }

    fn breakpoint_create_by_address(&mut self, address: Address) -> EngineResult<BreakpointId> {
        self.add_breakpoint(BreakpointKind::Address(address))
    }

    fn breakpoint_create_by_name(&mut self, name: &str) -> EngineResult<BreakpointId> {
        self.add_breakpoint(BreakpointKind::Name(name.to_string()))
    }

    fn breakpoint_create_by_regex(&mut self, pattern: &str) -> EngineResult<BreakpointId> {
        let re = Regex::new(pattern).map_err(|e| EngineError::new(e.to_string()))?;
        self.add_breakpoint(BreakpointKind::Regex(re))
    }

    fn breakpoint_create_for_exception(
        &mut self,
        language: &str,
        _catch: bool,
        _throw: bool,
    ) -> EngineResult<BreakpointId> {
        self.add_breakpoint(BreakpointKind::Exception {
            language: language.to_string(),
        })
    }

    fn breakpoint_delete(&mut self, id: BreakpointId) -> bool {
        let removed = self.breakpoints.shift_remove(&id).is_some();
        if removed {
            self.queue.post(DebugEvent::Breakpoint {
                id,
                change: BreakpointChange::Removed,
            });
        }
        removed
    }

    fn breakpoint_set_condition(&mut self, id: BreakpointId, condition: Option<&str>) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.condition = condition.filter(|c| !c.is_empty()).map(str::to_string);
        }
    }

    fn breakpoint_locations(&self, id: BreakpointId) -> Vec<BreakpointLocation> {
        self.breakpoints
            .get(&id)
            .map(|bp| bp.locations.clone())
            .unwrap_or_default()
    }
}

fn drain_into(pipe: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = pipe.len().min(buf.len());
    for (slot, byte) in buf.iter_mut().zip(pipe.drain(..n)) {
        *slot = byte;
    }
    n
}
