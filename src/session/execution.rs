//! Threads, stack traces and execution control.

use crate::dap::protocol::{DapRequest, Source, StackFrame};
use crate::engine::{FrameInfo, FrameRef, StepGranularity, ThreadId};
use crate::error::{Error, Result};
use crate::session::disassembly::MIME_TYPE;
use crate::session::format::ShowDisassembly;
use crate::session::handles::Handle;
use crate::session::variables::Container;
use crate::session::{parse_args, DebugSession, HandlerResult};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArguments {
    thread_id: ThreadId,
    #[serde(default)]
    start_frame: Option<usize>,
    #[serde(default)]
    levels: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceArguments {
    #[serde(default)]
    source_reference: Option<Handle>,
    #[serde(default)]
    source: Option<Source>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepArguments {
    thread_id: ThreadId,
    #[serde(default)]
    granularity: Option<String>,
}

#[derive(Clone, Copy)]
enum Step {
    Over,
    Into,
    Out,
}

impl DebugSession {
    pub(super) fn handle_threads(&mut self, _: &DapRequest) -> Result<HandlerResult> {
        let threads: Vec<_> = self
            .engine
            .threads()
            .into_iter()
            .map(|t| {
                let name = t.name.as_deref().unwrap_or("");
                json!({"id": t.id, "name": format!("{}: tid={} \"{name}\"", t.index, t.id)})
            })
            .collect();
        Ok(HandlerResult::Body(json!({ "threads": threads })))
    }

    /// Whether `frame` is shown as machine code.
    pub(super) fn use_disassembly(&self, frame: &FrameInfo) -> bool {
        match self.show_disassembly {
            ShowDisassembly::Always => true,
            ShowDisassembly::Never => false,
            ShowDisassembly::Auto => frame.line_entry.is_none(),
        }
    }

    pub(super) fn handle_stack_trace(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: StackTraceArguments = parse_args(req)?;
        let frames = self.engine.frames(args.thread_id);
        let start = args.start_frame.unwrap_or(0);
        let levels = args.levels.filter(|l| *l > 0).unwrap_or(usize::MAX);

        let mut stack_frames = vec![];
        for (index, frame) in frames.iter().enumerate().skip(start).take(levels) {
            let frame_ref = FrameRef {
                thread: args.thread_id,
                index: index as u32,
            };
            let id = self.handles.create(
                Container::StackFrame(frame_ref),
                &format!("[{},{}]", args.thread_id, index),
                None,
            );
            let name = frame
                .function
                .clone()
                .unwrap_or_else(|| format!("0x{:x}", frame.pc));
            let mut stack_frame = StackFrame {
                id,
                name,
                source: None,
                line: 0,
                column: 0,
                presentation_hint: None,
            };

            let disassembled = if self.use_disassembly(frame) {
                self.disassembly.from_address(self.engine.as_ref(), frame.pc)
            } else {
                None
            };
            match (disassembled, &frame.line_entry) {
                (Some(range), _) => {
                    stack_frame.source = Some(range.source());
                    stack_frame.line = range.line_num_by_address(frame.pc);
                    stack_frame.presentation_hint = Some("subtle");
                }
                (None, Some(entry)) => {
                    stack_frame.source = Some(Source::from_path(&entry.file));
                    stack_frame.line = entry.line;
                    stack_frame.column = entry.column;
                }
                (None, None) => stack_frame.presentation_hint = Some("subtle"),
            }
            stack_frames.push(stack_frame);
        }
        Ok(HandlerResult::Body(json!({
            "stackFrames": stack_frames,
            "totalFrames": frames.len(),
        })))
    }

    pub(super) fn handle_source(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: SourceArguments = parse_args(req)?;
        let reference = args
            .source
            .and_then(|s| s.source_reference)
            .or(args.source_reference)
            .filter(|r| *r > 0)
            .ok_or_else(|| Error::user("Source is not available"))?;
        let range = self
            .disassembly
            .find_by_handle(reference)
            .ok_or_else(|| Error::user(format!("Unknown source reference {reference}")))?;
        Ok(HandlerResult::Body(json!({
            "content": range.source_text(),
            "mimeType": MIME_TYPE,
        })))
    }

    pub(super) fn handle_pause(&mut self, _: &DapRequest) -> Result<HandlerResult> {
        match self.engine.stop() {
            Ok(()) => Ok(HandlerResult::Body(json!({}))),
            Err(e) if self.engine.process_state().is_stopped() => {
                // already stopped, the engine will not report a stop again
                log::debug!(target: "session", "pause of a stopped process: {e}");
                let threads = self.engine.threads();
                self.after_response(move |session| session.notify_forced_stop(&threads, "pause"));
                Ok(HandlerResult::Body(json!({})))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn handle_continue(&mut self, _: &DapRequest) -> Result<HandlerResult> {
        self.handles.reset();
        self.engine.resume()?;
        Ok(HandlerResult::Body(json!({ "allThreadsContinued": true })))
    }

    pub(super) fn handle_next(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        self.step(req, Step::Over)
    }

    pub(super) fn handle_step_in(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        self.step(req, Step::Into)
    }

    pub(super) fn handle_step_out(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        self.step(req, Step::Out)
    }

    fn step(&mut self, req: &DapRequest, step: Step) -> Result<HandlerResult> {
        let args: StepArguments = parse_args(req)?;
        self.handles.reset();

        let by_instruction = args.granularity.as_deref() == Some("instruction")
            || self
                .engine
                .frame(FrameRef {
                    thread: args.thread_id,
                    index: 0,
                })
                .is_some_and(|frame| self.use_disassembly(&frame));
        let granularity = if by_instruction {
            StepGranularity::Instruction
        } else {
            StepGranularity::Statement
        };

        match step {
            Step::Over => self.engine.step_over(args.thread_id, granularity)?,
            Step::Into => self.engine.step_into(args.thread_id, granularity)?,
            Step::Out => self.engine.step_out(args.thread_id)?,
        }
        Ok(HandlerResult::Body(json!({})))
    }
}
