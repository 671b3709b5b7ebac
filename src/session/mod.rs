//! Debug session kernel.
//!
//! A [`DebugSession`] lives on the thread running its [`EventLoop`]. Channel readers and the
//! engine listener are [`Worker`]s that only dispatch closures into the loop, so every handler
//! has exclusive access to the session state.

pub mod breakpoints;
pub mod disassembly;
pub mod event_loop;
pub mod execution;
pub mod extension;
pub mod format;
pub mod formatters;
pub mod handles;
pub mod launch;
pub mod listener;
pub mod stop;
pub mod variables;
pub mod worker;

use crate::config::AdapterSettings;
use crate::dap::protocol::{
    error_body, DapClientResponse, DapEvent, DapRequest, DapResponse, DapReverseRequest,
    InboundMessage,
};
use crate::dap::transport::{DapReader, DapWriter, Inbound};
use crate::engine::{
    DebugEvent, Engine, ProcessState, ThreadId, ThreadInfo,
};
use crate::error::{Error, ErrorKind, Result};
use crate::lang::ExceptionFilter;
use crate::session::breakpoints::Breakpoints;
use crate::session::disassembly::AddressSpace;
use crate::session::event_loop::{Dispatcher, EventLoop, LoopStopper, QUEUE_CAPACITY};
use crate::session::format::{DisplayFormat, ShowDisassembly};
use crate::session::formatters::Formatters;
use crate::session::handles::{HandleAllocator, HandleTree};
use crate::session::launch::PendingLaunch;
use crate::session::stop::{classify_stop, StopInfo};
use crate::session::variables::Container;
use crate::session::worker::Worker;
use crate::terminal::Terminal;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read};
use std::process::Child;

/// Largest piece of debuggee output sent in one `output` event.
const OUTPUT_CHUNK: usize = 1024;

/// What a request handler produced.
pub enum HandlerResult {
    Body(Value),
    /// The handler answers later (through [`DebugSession::respond`]).
    Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Main,
    Extension,
}

/// The part of a request needed to answer it.
#[derive(Clone, Debug)]
pub struct RequestRef {
    pub seq: i64,
    pub command: String,
}

impl From<&DapRequest> for RequestRef {
    fn from(req: &DapRequest) -> Self {
        Self {
            seq: req.seq,
            command: req.command.clone(),
        }
    }
}

type Handler = fn(&mut DebugSession, &DapRequest) -> Result<HandlerResult>;
type ResponseCallback = Box<dyn FnOnce(&mut DebugSession, std::result::Result<Value, String>)>;
type Deferred = Box<dyn FnOnce(&mut DebugSession)>;

static HANDLERS: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("initialize", DebugSession::handle_initialize);
    table.insert("launch", DebugSession::handle_launch);
    table.insert("attach", DebugSession::handle_attach);
    table.insert("configurationDone", DebugSession::handle_configuration_done);
    table.insert("setBreakpoints", DebugSession::handle_set_breakpoints);
    table.insert(
        "setFunctionBreakpoints",
        DebugSession::handle_set_function_breakpoints,
    );
    table.insert(
        "setExceptionBreakpoints",
        DebugSession::handle_set_exception_breakpoints,
    );
    table.insert("threads", DebugSession::handle_threads);
    table.insert("stackTrace", DebugSession::handle_stack_trace);
    table.insert("scopes", DebugSession::handle_scopes);
    table.insert("variables", DebugSession::handle_variables);
    table.insert("source", DebugSession::handle_source);
    table.insert("evaluate", DebugSession::handle_evaluate);
    table.insert("setVariable", DebugSession::handle_set_variable);
    table.insert("pause", DebugSession::handle_pause);
    table.insert("continue", DebugSession::handle_continue);
    table.insert("next", DebugSession::handle_next);
    table.insert("stepIn", DebugSession::handle_step_in);
    table.insert("stepOut", DebugSession::handle_step_out);
    table.insert("disconnect", DebugSession::handle_disconnect);
    table
});

static EXTENSION_HANDLERS: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("displaySettings", DebugSession::handle_display_settings);
    table.insert("showDisassembly", DebugSession::handle_show_disassembly);
    table.insert("adapterSettings", DebugSession::handle_adapter_settings);
    table
});

/// Deserialize request arguments, absent arguments read as an empty object.
pub(super) fn parse_args<T: DeserializeOwned>(req: &DapRequest) -> Result<T> {
    let args = if req.arguments.is_null() {
        json!({})
    } else {
        req.arguments.clone()
    };
    Ok(serde_json::from_value(args)?)
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub struct DebugSession {
    engine: Box<dyn Engine>,
    main: DapWriter,
    extension: Option<DapWriter>,
    seq: i64,
    reverse_requests: HashMap<i64, ResponseCallback>,
    /// Run after the response of the current request is written.
    deferred: Vec<Deferred>,
    /// Set once the client is gone or disconnected, nothing is written after that.
    closed: bool,
    stopper: LoopStopper<DebugSession>,
    dispatcher: Dispatcher<DebugSession>,

    display_format: DisplayFormat,
    show_disassembly: ShowDisassembly,
    source_languages: Vec<String>,
    formatters: Formatters,

    handles: HandleTree<Container>,
    disassembly: AddressSpace,

    breakpoints: Breakpoints,
    /// Breakpoint events caused by the session itself are not echoed to the client.
    ignore_bp_events: bool,
    no_debug: bool,

    pending_launch: Option<PendingLaunch>,
    /// Launched processes are killed on disconnect, attached ones are detached.
    process_launched: bool,
    terminal: Option<Terminal>,
    /// External terminal emulator hosting the agent.
    terminal_process: Option<Child>,
    exit_commands: Vec<String>,

    known_threads: BTreeSet<ThreadId>,
    /// Body of the last `stopped` event.
    last_stop: Option<Value>,

    workers: Vec<Worker>,
}

impl DebugSession {
    pub fn new(
        engine: Box<dyn Engine>,
        main: DapWriter,
        settings: &AdapterSettings,
        event_loop: &EventLoop<DebugSession>,
    ) -> Self {
        let allocator = HandleAllocator::default();
        Self {
            engine,
            main,
            extension: None,
            seq: 0,
            reverse_requests: HashMap::new(),
            deferred: vec![],
            closed: false,
            stopper: event_loop.stopper(),
            dispatcher: event_loop.dispatcher(),
            display_format: settings.display_format,
            show_disassembly: settings.show_disassembly,
            source_languages: settings.source_languages.clone(),
            formatters: Formatters::new(&settings.synthetic_providers),
            handles: HandleTree::new(allocator.clone()),
            disassembly: AddressSpace::new(allocator),
            breakpoints: Breakpoints::default(),
            ignore_bp_events: false,
            no_debug: false,
            pending_launch: None,
            process_launched: false,
            terminal: None,
            terminal_process: None,
            exit_commands: vec![],
            known_threads: BTreeSet::new(),
            last_stop: None,
            workers: vec![],
        }
    }

    // --------------------------------- inbound ---------------------------------------------------

    pub fn handle_message(&mut self, channel: Channel, message: Value) {
        if self.closed {
            return;
        }
        match InboundMessage::from_value(message) {
            Ok(InboundMessage::Request(req)) => self.handle_request(channel, req),
            Ok(InboundMessage::Response(rsp)) => self.handle_client_response(rsp),
            Ok(InboundMessage::Event(event)) => {
                log::debug!(target: "dap", "ignore client event {event}");
            }
            Err(e) => log::error!(target: "dap", "Malformed message on {channel:?} channel: {e}"),
        }
    }

    fn handle_request(&mut self, channel: Channel, req: DapRequest) {
        let table: &HashMap<&'static str, Handler> = match channel {
            Channel::Main => &*HANDLERS,
            Channel::Extension => &*EXTENSION_HANDLERS,
        };
        let request = RequestRef::from(&req);
        let Some(handler) = table.get(req.command.as_str()).copied() else {
            log::warn!(target: "dap", "Unsupported DAP command: {}", req.command);
            self.send_response(
                channel,
                &request,
                false,
                Some(format!("Unsupported DAP command: {}", req.command)),
                None,
            );
            return;
        };

        log::debug!(target: "session", "request #{} {}", req.seq, req.command);
        match handler(self, &req) {
            Ok(HandlerResult::Body(body)) => self.respond(channel, &request, Ok(body)),
            Ok(HandlerResult::Async) => {}
            Err(e) => self.respond(channel, &request, Err(e)),
        }
        for task in std::mem::take(&mut self.deferred) {
            task(self);
        }
    }

    fn handle_client_response(&mut self, rsp: DapClientResponse) {
        let Some(callback) = self.reverse_requests.remove(&rsp.request_seq) else {
            log::warn!(target: "dap", "response to unknown request #{} ({})", rsp.request_seq, rsp.command);
            return;
        };
        let result = if rsp.success {
            Ok(rsp.body)
        } else {
            Err(rsp
                .message
                .unwrap_or_else(|| format!("{} failed", rsp.command)))
        };
        callback(self, result);
    }

    /// A channel reader stopped: the peer went away or the stream broke.
    fn on_channel_closed(&mut self, channel: Channel) {
        match channel {
            Channel::Main => {
                if self.closed {
                    return;
                }
                log::info!(target: "session", "client disconnected");
                self.closed = true;
                self.shutdown(None);
                self.stopper.stop();
            }
            Channel::Extension => {
                log::info!(target: "dap", "extension channel closed");
                self.extension = None;
            }
        }
    }

    fn handle_initialize(&mut self, _: &DapRequest) -> Result<HandlerResult> {
        let filters: Vec<Value> = ExceptionFilter::ALL
            .iter()
            .map(|filter| {
                json!({
                    "filter": filter.to_string(),
                    "label": filter.label(),
                    "default": filter.enabled_by_default(),
                })
            })
            .collect();
        Ok(HandlerResult::Body(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsFunctionBreakpoints": true,
            "supportsConditionalBreakpoints": true,
            "supportsHitConditionalBreakpoints": true,
            "supportsLogPoints": true,
            "supportsSetVariable": true,
            "exceptionBreakpointFilters": filters,
        })))
    }

    // --------------------------------- outbound --------------------------------------------------

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn write(&mut self, channel: Channel, message: &impl Serialize) {
        if self.closed {
            return;
        }
        let writer = match channel {
            Channel::Main => Some(&mut self.main),
            Channel::Extension => self.extension.as_mut(),
        };
        let Some(writer) = writer else {
            log::debug!(target: "dap", "{channel:?} channel is closed, message dropped");
            return;
        };
        if let Err(e) = writer.write_message(message) {
            log::error!(target: "dap", "write to {channel:?} channel: {e}");
        }
    }

    fn send_response(
        &mut self,
        channel: Channel,
        request: &RequestRef,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        let response = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        self.write(channel, &response);
    }

    /// Answer `request` with a body or an error.
    pub(super) fn respond(&mut self, channel: Channel, request: &RequestRef, result: Result<Value>) {
        match result {
            Ok(body) => {
                let body = (!body.is_null()).then_some(body);
                self.send_response(channel, request, true, None, body);
            }
            Err(e) => {
                let message = self.error_message(&request.command, &e);
                let body = error_body(&message);
                self.send_response(channel, request, false, Some(message), Some(body));
            }
        }
    }

    fn error_message(&mut self, command: &str, e: &Error) -> String {
        match e.kind() {
            ErrorKind::User { echo } => {
                let message = e.to_string();
                log::debug!(target: "session", "{command} failed: {message}");
                if echo {
                    self.console_message(message.clone());
                }
                message
            }
            ErrorKind::Protocol => {
                log::warn!(target: "dap", "{command}: {e}");
                e.to_string()
            }
            ErrorKind::Internal => {
                log::error!(target: "session", "{command}: {e:?}");
                let message = format!("Internal debugger error: {e}");
                self.console_message(message.clone());
                message
            }
        }
    }

    pub(super) fn send_event(&mut self, event: &'static str, body: Value) {
        let event = DapEvent {
            seq: self.next_seq(),
            r#type: "event",
            event,
            body: (!body.is_null()).then_some(body),
        };
        self.write(Channel::Main, &event);
    }

    /// Print a line in the client debug console.
    pub(super) fn console_message(&mut self, text: impl Into<String>) {
        let mut output = text.into();
        output.push('\n');
        self.send_event("output", json!({"category": "console", "output": output}));
    }

    /// Send a request to the client, `callback` runs on the loop when the answer arrives.
    pub(super) fn send_reverse_request(
        &mut self,
        command: &'static str,
        arguments: Value,
        callback: impl FnOnce(&mut DebugSession, std::result::Result<Value, String>) + 'static,
    ) {
        let seq = self.next_seq();
        self.reverse_requests.insert(seq, Box::new(callback));
        let request = DapReverseRequest {
            seq,
            r#type: "request",
            command,
            arguments,
        };
        self.write(Channel::Main, &request);
    }

    /// Run `task` once the response of the request being handled is written.
    pub(super) fn after_response(&mut self, task: impl FnOnce(&mut DebugSession) + 'static) {
        self.deferred.push(Box::new(task));
    }

    // --------------------------------- engine events ---------------------------------------------

    pub fn handle_debug_event(&mut self, event: DebugEvent) {
        if self.closed {
            return;
        }
        match event {
            DebugEvent::ProcessState { state, .. } => self.on_process_state(state),
            DebugEvent::Stdout => self.forward_output(OutputStream::Stdout),
            DebugEvent::Stderr => self.forward_output(OutputStream::Stderr),
            DebugEvent::Breakpoint { id, change } => self.on_breakpoint_event(id, change),
            DebugEvent::ModuleLoaded { path } => {
                self.console_message(format!("Module loaded: {path}"))
            }
        }
    }

    fn on_process_state(&mut self, state: ProcessState) {
        log::debug!(target: "session", "process state {state:?}");
        match state {
            ProcessState::Stopped | ProcessState::Crashed => self.on_process_stopped(),
            ProcessState::Running | ProcessState::Stepping => {
                self.last_stop = None;
                let thread_id = self
                    .engine
                    .selected_thread()
                    .or_else(|| self.known_threads.iter().next().copied())
                    .unwrap_or(0);
                self.send_event(
                    "continued",
                    json!({"threadId": thread_id, "allThreadsContinued": true}),
                );
            }
            ProcessState::Exited => {
                self.drain_output();
                let exit_code = self.engine.exit_status().unwrap_or(0);
                self.console_message(format!("Process exited with code {exit_code}."));
                self.send_event("exited", json!({ "exitCode": exit_code }));
                self.send_event("terminated", Value::Null);
            }
            ProcessState::Detached => self.send_event("terminated", Value::Null),
            ProcessState::Invalid | ProcessState::Launching | ProcessState::Suspended => {}
        }
    }

    fn on_process_stopped(&mut self) {
        self.drain_output();
        // the event may be stale: the process moved on since it was queued
        if !self.engine.process_state().is_stopped() {
            return;
        }
        let threads = self.engine.threads();
        if !self.should_report_stop(&threads) {
            if let Err(e) = self.engine.resume() {
                log::warn!(target: "session", "resume after an unreported stop: {e}");
            }
            return;
        }
        let stop = self.classify(&threads, "unknown");
        self.report_stop(&threads, stop);
    }

    fn classify(&self, threads: &[ThreadInfo], fallback: &'static str) -> StopInfo {
        classify_stop(
            threads,
            self.engine.selected_thread(),
            self.breakpoints.exception_ids(),
            fallback,
        )
    }

    /// Report a stop the engine will not announce (stop on entry, pause of a stopped process).
    pub(super) fn notify_forced_stop(&mut self, threads: &[ThreadInfo], reason: &'static str) {
        let mut stop = self.classify(threads, reason);
        stop.reason = reason;
        stop.description = None;
        stop.hit_breakpoint_ids.clear();
        self.report_stop(threads, stop);
    }

    fn report_stop(&mut self, threads: &[ThreadInfo], stop: StopInfo) {
        self.update_threads(threads);
        let body = stop.body();
        self.last_stop = Some(body.clone());
        self.send_event("stopped", body);
    }

    /// Announce threads that appeared or disappeared since the previous stop.
    fn update_threads(&mut self, threads: &[ThreadInfo]) {
        let current: BTreeSet<ThreadId> = threads.iter().map(|t| t.id).collect();
        let started: Vec<ThreadId> = current.difference(&self.known_threads).copied().collect();
        let exited: Vec<ThreadId> = self.known_threads.difference(&current).copied().collect();
        for id in started {
            self.send_event("thread", json!({"reason": "started", "threadId": id}));
        }
        for id in exited {
            self.send_event("thread", json!({"reason": "exited", "threadId": id}));
        }
        self.known_threads = current;
    }

    fn drain_output(&mut self) {
        self.forward_output(OutputStream::Stdout);
        self.forward_output(OutputStream::Stderr);
    }

    fn forward_output(&mut self, stream: OutputStream) {
        let mut buf = [0u8; OUTPUT_CHUNK];
        loop {
            let (read, category) = match stream {
                OutputStream::Stdout => (self.engine.read_stdout(&mut buf), "stdout"),
                OutputStream::Stderr => (self.engine.read_stderr(&mut buf), "stderr"),
            };
            if read == 0 {
                break;
            }
            let output = String::from_utf8_lossy(&buf[..read]).into_owned();
            self.send_event("output", json!({"category": category, "output": output}));
        }
    }
}

/// Reports `channel` closed when a reader loop ends, panics included.
struct ChannelGuard {
    channel: Channel,
    dispatcher: Option<Dispatcher<DebugSession>>,
}

impl ChannelGuard {
    /// The loop does not need to hear about this exit.
    fn disarm(&mut self) {
        self.dispatcher = None;
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let channel = self.channel;
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.dispatch(move |session: &mut DebugSession| session.on_channel_closed(channel));
        }
    }
}

/// Start a worker reading `channel` messages into the session loop.
pub fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    channel: Channel,
    mut reader: DapReader<R>,
    dispatcher: Dispatcher<DebugSession>,
) -> io::Result<Worker> {
    Worker::spawn(name, move |token| {
        let mut guard = ChannelGuard {
            channel,
            dispatcher: Some(dispatcher.clone()),
        };
        loop {
            match reader.read_message_until(|| token.is_stopping()) {
                Ok(Inbound::Message(message)) => {
                    let delivered = dispatcher.dispatch(move |session: &mut DebugSession| {
                        session.handle_message(channel, message)
                    });
                    if !delivered {
                        guard.disarm();
                        break;
                    }
                }
                Ok(Inbound::Disconnected) => {
                    if token.is_stopping() {
                        guard.disarm();
                    }
                    break;
                }
                Err(e) => {
                    log::error!(target: "dap", "read from {channel:?} channel: {e}");
                    break;
                }
            }
        }
    })
}

/// Serve one client until it disconnects.
pub fn run_session<R: Read + Send + 'static>(
    reader: DapReader<R>,
    writer: DapWriter,
    engine: Box<dyn Engine>,
    settings: &AdapterSettings,
) -> anyhow::Result<()> {
    let event_loop = EventLoop::new(QUEUE_CAPACITY);
    let queue = engine.event_queue();
    let mut session = DebugSession::new(engine, writer, settings, &event_loop);

    let reader = spawn_reader("dap-reader", Channel::Main, reader, event_loop.dispatcher())?;
    session.workers.push(reader);
    let listener = listener::spawn(
        queue,
        event_loop.dispatcher(),
        DebugSession::handle_debug_event,
    )?;
    session.workers.push(listener);

    if let Some(port) = settings.extension_port {
        crate::weak_error!(session.connect_extension(port), "extension channel:");
    }

    // the session holds a dispatcher of its own, so only `stop` ends the loop
    event_loop.run(&mut session);
    log::info!(target: "session", "session finished");
    drop(session);
    Ok(())
}
