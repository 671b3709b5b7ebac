//! Debugger engine boundary.
//!
//! The session kernel drives a native debugger through the [`Engine`] trait. The engine owns
//! targets, processes, threads, frames, values and breakpoints; the kernel only holds plain
//! identifiers ([`ThreadId`], [`FrameRef`], [`BreakpointId`]) and shared [`ValueRef`]s.
//! Engine events arrive on a separate [`EventQueue`] that can be moved into a listener thread.

pub mod sim;
pub mod value;

use std::fmt::{Display, Formatter};
use std::time::Duration;

pub use value::{DebugValue, NumericValue, Scalar, ValueRef};

pub type ThreadId = u64;
pub type BreakpointId = u32;
pub type Address = u64;

/// Engine failure, always carries a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Stack frame identity: thread and frame index (0 is the innermost frame).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameRef {
    pub thread: ThreadId,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Display for LineEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub function: Option<String>,
    pub pc: Address,
    pub line_entry: Option<LineEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StopReason {
    None,
    Breakpoint(Vec<BreakpointId>),
    Watchpoint(u32),
    Exception(String),
    Trace,
    PlanComplete,
    Signal { signo: i32, name: String },
    Halted,
    Other(String),
}

#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub id: ThreadId,
    /// 1-based index in engine order.
    pub index: u32,
    pub name: Option<String>,
    pub stop_reason: StopReason,
    pub stop_description: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Invalid,
    Launching,
    Running,
    Stepping,
    Stopped,
    Crashed,
    Suspended,
    Exited,
    Detached,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        !matches!(
            self,
            ProcessState::Invalid | ProcessState::Exited | ProcessState::Detached
        )
    }

    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Crashed | ProcessState::Suspended
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BreakpointChange {
    Added,
    LocationsResolved,
    Removed,
}

/// Asynchronous engine notification.
#[derive(Clone, Debug, PartialEq)]
pub enum DebugEvent {
    ProcessState {
        state: ProcessState,
        restarted: bool,
    },
    Stdout,
    Stderr,
    Breakpoint {
        id: BreakpointId,
        change: BreakpointChange,
    },
    ModuleLoaded {
        path: String,
    },
}

/// Source of engine events, owned by the listener thread.
pub trait EventQueue: Send {
    /// Block up to `timeout` for the next event.
    fn wait_for_event(&self, timeout: Duration) -> Option<DebugEvent>;
}

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub succeeded: bool,
    pub output: String,
    pub error: String,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub start: Address,
    pub end: Address,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub address: Address,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub comment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableScope {
    Locals,
    Statics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGranularity {
    Statement,
    Instruction,
}

#[derive(Clone, Debug, Default)]
pub struct LaunchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
    /// stdin, stdout and stderr redirections, `None` means inherit.
    pub stdio: [Option<String>; 3],
    pub stop_on_entry: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AttachConfig {
    pub pid: Option<u32>,
    pub program: Option<String>,
    pub wait_for: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BreakpointLocation {
    pub address: Address,
    pub line_entry: Option<LineEntry>,
}

/// Native debugger as seen by the session kernel.
///
/// Methods that address the process fail with [`EngineError`] when there is none.
pub trait Engine {
    // --------------------------------- target and process ----------------------------------------
    fn create_target(&mut self, program: Option<&str>) -> EngineResult<()>;
    fn has_target(&self) -> bool;
    fn launch(&mut self, config: &LaunchConfig) -> EngineResult<u32>;
    fn attach(&mut self, config: &AttachConfig) -> EngineResult<u32>;
    fn process_state(&self) -> ProcessState;
    fn exit_status(&self) -> Option<i32>;
    fn resume(&mut self) -> EngineResult<()>;
    fn stop(&mut self) -> EngineResult<()>;
    fn kill(&mut self) -> EngineResult<()>;
    fn detach(&mut self) -> EngineResult<()>;
    /// Forget target and process.
    fn clear(&mut self);
    fn event_queue(&self) -> Box<dyn EventQueue>;
    fn read_stdout(&mut self, buf: &mut [u8]) -> usize;
    fn read_stderr(&mut self, buf: &mut [u8]) -> usize;
    fn execute_command(&mut self, command: &str, frame: Option<FrameRef>) -> CommandOutput;

    // --------------------------------- threads and frames ----------------------------------------
    fn threads(&self) -> Vec<ThreadInfo>;
    fn selected_thread(&self) -> Option<ThreadId>;
    fn frames(&self, thread: ThreadId) -> Vec<FrameInfo>;
    fn frame(&self, frame: FrameRef) -> Option<FrameInfo> {
        self.frames(frame.thread).into_iter().nth(frame.index as usize)
    }
    fn step_over(&mut self, thread: ThreadId, granularity: StepGranularity) -> EngineResult<()>;
    fn step_into(&mut self, thread: ThreadId, granularity: StepGranularity) -> EngineResult<()>;
    fn step_out(&mut self, thread: ThreadId) -> EngineResult<()>;

    // --------------------------------- values ----------------------------------------------------
    fn variables(&self, frame: FrameRef, scope: VariableScope) -> Vec<ValueRef>;
    fn registers(&self, frame: FrameRef) -> Vec<ValueRef>;
    fn find_variable(&self, frame: FrameRef, name: &str) -> Option<ValueRef>;
    fn evaluate(&mut self, expression: &str, frame: Option<FrameRef>) -> EngineResult<ValueRef>;

    // --------------------------------- code ------------------------------------------------------
    fn symbol_at(&self, address: Address) -> Option<Symbol>;
    fn line_entry_at(&self, address: Address) -> Option<LineEntry>;
    /// Instructions starting in `[start, end)`.
    fn instructions(&self, start: Address, end: Address) -> Vec<Instruction>;
    fn read_instructions(&self, start: Address, count: usize) -> Vec<Instruction>;

    // --------------------------------- breakpoints -----------------------------------------------
    fn breakpoint_create_by_location(&mut self, file: &str, line: u32)
        -> EngineResult<BreakpointId>;
    fn breakpoint_create_by_address(&mut self, address: Address) -> EngineResult<BreakpointId>;
    fn breakpoint_create_by_name(&mut self, name: &str) -> EngineResult<BreakpointId>;
    fn breakpoint_create_by_regex(&mut self, pattern: &str) -> EngineResult<BreakpointId>;
    fn breakpoint_create_for_exception(
        &mut self,
        language: &str,
        catch: bool,
        throw: bool,
    ) -> EngineResult<BreakpointId>;
    fn breakpoint_delete(&mut self, id: BreakpointId) -> bool;
    fn breakpoint_set_condition(&mut self, id: BreakpointId, condition: Option<&str>);
    fn breakpoint_locations(&self, id: BreakpointId) -> Vec<BreakpointLocation>;
}
