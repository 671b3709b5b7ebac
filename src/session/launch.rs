//! Launch and attach sequencing.
//!
//! `launch`/`attach` only prepare the target and answer later: the process is started when the
//! client sends `configurationDone`, after it has set its breakpoints. Both deferred responses
//! are sent once the engine call returned.

use crate::dap::args::{AttachArguments, CommonArguments, LaunchArguments, TerminalKind};
use crate::dap::protocol::DapRequest;
use crate::engine::{AttachConfig, LaunchConfig};
use crate::error::{Error, Result};
use crate::session::worker::Worker;
use crate::session::{parse_args, Channel, DebugSession, HandlerResult, RequestRef};
use crate::terminal::{self, Terminal, TerminalListener, ACCEPT_TIMEOUT};
use anyhow::Context;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::{json, Value};

pub(super) enum LaunchPlan {
    Launch(LaunchArguments),
    Attach(AttachArguments),
}

/// `launch` or `attach` waiting for `configurationDone`.
pub(super) struct PendingLaunch {
    request: RequestRef,
    plan: LaunchPlan,
    configuration_done: Option<RequestRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectArguments {
    #[serde(default)]
    terminate_debuggee: Option<bool>,
}

impl DebugSession {
    pub(super) fn handle_launch(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: LaunchArguments = parse_args(req)?;
        self.apply_common_arguments(&args.common);
        self.no_debug = args.no_debug;
        self.run_commands(&args.common.init_commands)?;

        let program = args
            .program
            .as_deref()
            .ok_or_else(|| Error::user("\"program\" property is required for launch"))?;
        self.engine.create_target(Some(program))?;

        self.prepare_launch(req, LaunchPlan::Launch(args));
        Ok(HandlerResult::Async)
    }

    pub(super) fn handle_attach(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: AttachArguments = parse_args(req)?;
        self.apply_common_arguments(&args.common);
        self.run_commands(&args.common.init_commands)?;

        if args.pid.is_none() && args.program.is_none() {
            return Err(Error::user(
                "Either \"program\" or \"pid\" is required for attach",
            ));
        }
        if let Some(program) = &args.program {
            self.engine.create_target(Some(program))?;
        }

        self.prepare_launch(req, LaunchPlan::Attach(args));
        Ok(HandlerResult::Async)
    }

    fn apply_common_arguments(&mut self, common: &CommonArguments) {
        if let Some(format) = common.display_format {
            self.display_format = format;
        }
        if let Some(mode) = common.show_disassembly {
            self.show_disassembly = mode;
        }
        if let Some(languages) = &common.source_languages {
            self.source_languages = languages.clone();
        }
        self.exit_commands = common.exit_commands.clone();
    }

    fn prepare_launch(&mut self, req: &DapRequest, plan: LaunchPlan) {
        if let Some(previous) = self.pending_launch.take() {
            log::warn!(target: "session", "{} superseded by {}", previous.request.command, req.command);
            self.respond(
                Channel::Main,
                &previous.request,
                Err(Error::user("Superseded by another launch request")),
            );
        }
        self.send_event("initialized", Value::Null);
        self.pending_launch = Some(PendingLaunch {
            request: RequestRef::from(req),
            plan,
            configuration_done: None,
        });
    }

    /// Run interpreter commands, echoing their output. Stop at the first failure.
    pub(super) fn run_commands(&mut self, commands: &[String]) -> Result<()> {
        for command in commands {
            let output = self.engine.execute_command(command, None);
            if !output.output.is_empty() {
                self.console_message(output.output.trim_end());
            }
            if !output.succeeded {
                let error = output.error.trim_end();
                self.console_message(error);
                return Err(Error::User(format!("Command \"{command}\" failed: {error}")));
            }
        }
        Ok(())
    }

    pub(super) fn handle_configuration_done(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let Some(pending) = self.pending_launch.as_mut() else {
            return Ok(HandlerResult::Body(json!({})));
        };
        pending.configuration_done = Some(RequestRef::from(req));

        let terminal_kind = match &pending.plan {
            LaunchPlan::Launch(args) => args.terminal,
            LaunchPlan::Attach(_) => TerminalKind::Console,
        };
        let started = match terminal_kind {
            TerminalKind::Console => {
                self.complete_launch(None);
                return Ok(HandlerResult::Async);
            }
            TerminalKind::Integrated => self.request_integrated_terminal(),
            TerminalKind::External => self.spawn_external_terminal(),
        };
        if let Err(e) = started {
            self.complete_launch(Some(Error::Internal(e)));
        }
        Ok(HandlerResult::Async)
    }

    fn request_integrated_terminal(&mut self) -> anyhow::Result<()> {
        let listener = TerminalListener::bind()?;
        let args = json!({
            "kind": "integrated",
            "title": "Debuggee",
            "args": listener.agent_command()?,
        });
        self.send_reverse_request("runInTerminal", args, move |session, result| match result {
            Ok(_) => {
                if let Err(e) = session.accept_terminal(listener) {
                    session.complete_launch(Some(Error::Internal(e)));
                }
            }
            Err(message) => session.complete_launch(Some(Error::User(format!(
                "Could not start a terminal: {message}"
            )))),
        });
        Ok(())
    }

    fn spawn_external_terminal(&mut self) -> anyhow::Result<()> {
        let listener = TerminalListener::bind()?;
        let child = terminal::spawn_external(&listener.agent_command()?)?;
        log::debug!(target: "session", "external terminal pid {}", child.id());
        self.terminal_process = Some(child);
        self.accept_terminal(listener)
    }

    /// Wait for the terminal agent off the loop, then finish the launch.
    fn accept_terminal(&mut self, listener: TerminalListener) -> anyhow::Result<()> {
        let dispatcher = self.dispatcher.clone();
        let worker = Worker::spawn("terminal-accept", move |_| {
            let result = listener.accept(ACCEPT_TIMEOUT);
            dispatcher.dispatch(move |session: &mut DebugSession| session.terminal_ready(result));
        })
        .context("start terminal accept worker")?;
        self.workers.push(worker);
        Ok(())
    }

    fn terminal_ready(&mut self, result: anyhow::Result<Terminal>) {
        match result {
            Ok(terminal) => {
                self.terminal = Some(terminal);
                self.complete_launch(None);
            }
            Err(e) => self.complete_launch(Some(Error::User(format!("{e:#}")))),
        }
    }

    /// Start the process (unless `error` is set) and answer the deferred requests.
    fn complete_launch(&mut self, error: Option<Error>) {
        let Some(pending) = self.pending_launch.take() else {
            return;
        };
        let result = match error {
            Some(e) => Err(e),
            None => match &pending.plan {
                LaunchPlan::Launch(args) => self.launch_process(args),
                LaunchPlan::Attach(args) => self.attach_process(args),
            },
        };
        self.respond(Channel::Main, &pending.request, result.map(|_| json!({})));
        if let Some(configuration_done) = &pending.configuration_done {
            self.respond(Channel::Main, configuration_done, Ok(json!({})));
        }
    }

    fn launch_process(&mut self, args: &LaunchArguments) -> Result<()> {
        self.run_commands(&args.common.pre_run_commands)?;

        let mut env: IndexMap<String, String> = std::env::vars().collect();
        env.extend(args.env.clone());
        let mut stdio = args
            .stdio
            .as_ref()
            .map(|spec| spec.resolve())
            .unwrap_or_default();
        if let Some(terminal) = &self.terminal {
            for slot in stdio.iter_mut().filter(|slot| slot.is_none()) {
                *slot = Some(terminal.tty().to_string());
            }
        }
        let program = args.program.clone().unwrap_or_default();
        let config = LaunchConfig {
            program: program.clone(),
            args: args.args.clone(),
            env: env.into_iter().collect(),
            cwd: args.cwd.clone(),
            stdio,
            stop_on_entry: args.common.stop_on_entry,
        };

        let cmdline = std::iter::once(&program).chain(&args.args).join(" ");
        self.console_message(format!("Launching: {cmdline}"));
        let pid = self.engine.launch(&config)?;
        self.process_launched = true;
        log::info!(target: "session", "launched {program} as pid {pid}");

        if let Err(e) = self.run_commands(&args.common.post_run_commands) {
            log::warn!(target: "session", "postRunCommands: {e}");
        }
        if args.common.stop_on_entry && self.engine.process_state().is_stopped() {
            let threads = self.engine.threads();
            self.notify_forced_stop(&threads, "entry");
        }
        Ok(())
    }

    fn attach_process(&mut self, args: &AttachArguments) -> Result<()> {
        self.run_commands(&args.common.pre_run_commands)?;

        let pid = match &args.pid {
            Some(pid) => Some(
                pid.value()
                    .ok_or_else(|| Error::user(format!("Invalid process id: {pid:?}")))?,
            ),
            None => None,
        };
        let target = match (pid, &args.program) {
            (Some(pid), _) => pid.to_string(),
            (None, Some(program)) => program.clone(),
            (None, None) => String::new(),
        };
        self.console_message(format!("Attaching to {target}"));
        let config = AttachConfig {
            pid,
            program: args.program.clone(),
            wait_for: args.wait_for,
        };
        let pid = self.engine.attach(&config)?;
        self.process_launched = false;
        log::info!(target: "session", "attached to pid {pid}");

        if let Err(e) = self.run_commands(&args.common.post_run_commands) {
            log::warn!(target: "session", "postRunCommands: {e}");
        }
        if self.engine.process_state().is_stopped() {
            if args.common.stop_on_entry {
                let threads = self.engine.threads();
                self.notify_forced_stop(&threads, "entry");
            } else {
                self.engine.resume()?;
            }
        }
        Ok(())
    }

    pub(super) fn handle_disconnect(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: DisconnectArguments = parse_args(req)?;
        self.shutdown(args.terminate_debuggee);
        self.respond(Channel::Main, &RequestRef::from(req), Ok(json!({})));
        self.closed = true;
        self.stopper.stop();
        Ok(HandlerResult::Async)
    }

    /// Release the debuggee: kill what was launched, detach from what was attached.
    pub(super) fn shutdown(&mut self, terminate: Option<bool>) {
        if let Some(pending) = self.pending_launch.take() {
            let command = pending.request.command.clone();
            let error = || Error::user(format!("Session ended before {command} completed"));
            self.respond(Channel::Main, &pending.request, Err(error()));
            if let Some(configuration_done) = &pending.configuration_done {
                self.respond(Channel::Main, configuration_done, Err(error()));
            }
        }

        let exit_commands = std::mem::take(&mut self.exit_commands);
        if let Err(e) = self.run_commands(&exit_commands) {
            log::warn!(target: "session", "exitCommands: {e}");
        }

        if self.engine.process_state().is_alive() {
            let terminate = terminate.unwrap_or(self.process_launched);
            let (result, outcome) = if terminate {
                (self.engine.kill(), "Terminated the debuggee.")
            } else {
                (self.engine.detach(), "Detached from the debuggee.")
            };
            if crate::weak_error!(result, "release debuggee:").is_some() {
                self.console_message(outcome);
            }
        }
        self.engine.clear();
        self.terminal = None;
        self.reap_terminal_process();
    }

    fn reap_terminal_process(&mut self) {
        if let Some(child) = self.terminal_process.take() {
            terminal::reap(child);
        }
    }
}
