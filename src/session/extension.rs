//! Side channel of the editor extension.
//!
//! Same framing as the main channel, carries display settings commands. Changing a setting makes
//! the session replay the last stop so the client reloads frames and variables.

use crate::dap::protocol::DapRequest;
use crate::dap::transport;
use crate::error::Result;
use crate::session::format::{DisplayFormat, ShowDisassembly};
use crate::session::{parse_args, spawn_reader, Channel, DebugSession, HandlerResult};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{Ipv4Addr, TcpStream};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplaySettingsArguments {
    #[serde(default)]
    display_format: Option<DisplayFormat>,
    #[serde(default)]
    show_disassembly: Option<ShowDisassembly>,
}

#[derive(Deserialize)]
struct ShowDisassemblyArguments {
    #[serde(default)]
    value: Option<ShowDisassembly>,
}

impl DebugSession {
    /// Connect to the extension listening on `port` and start reading its commands.
    pub(super) fn connect_extension(&mut self, port: u16) -> anyhow::Result<()> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("connect to extension port {port}"))?;
        let tracer = self.main.tracer().map(|t| t.for_channel("ext"));
        let (reader, writer) = transport::split(stream, tracer)?;
        let worker = spawn_reader(
            "extension-reader",
            Channel::Extension,
            reader,
            self.dispatcher.clone(),
        )?;
        self.extension = Some(writer);
        self.workers.push(worker);
        log::info!(target: "dap", "extension channel connected on port {port}");
        Ok(())
    }

    pub(super) fn handle_display_settings(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: DisplaySettingsArguments = parse_args(req)?;
        if let Some(format) = args.display_format {
            self.display_format = format;
        }
        if let Some(mode) = args.show_disassembly {
            self.show_disassembly = mode;
        }
        self.refresh_client_view();
        Ok(HandlerResult::Body(self.adapter_settings()))
    }

    pub(super) fn handle_show_disassembly(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: ShowDisassemblyArguments = parse_args(req)?;
        self.show_disassembly = match args.value {
            Some(mode) => mode,
            None if self.show_disassembly == ShowDisassembly::Always => ShowDisassembly::Auto,
            None => ShowDisassembly::Always,
        };
        self.refresh_client_view();
        Ok(HandlerResult::Body(self.adapter_settings()))
    }

    pub(super) fn handle_adapter_settings(&mut self, _: &DapRequest) -> Result<HandlerResult> {
        Ok(HandlerResult::Body(self.adapter_settings()))
    }

    fn adapter_settings(&self) -> Value {
        json!({
            "displayFormat": self.display_format,
            "showDisassembly": self.show_disassembly,
            "sourceLanguages": self.source_languages,
        })
    }

    /// Make the client drop and re-request frames and variables.
    fn refresh_client_view(&mut self) {
        self.handles.reset();
        if !self.engine.process_state().is_stopped() {
            return;
        }
        let Some(stop) = self.last_stop.clone() else {
            return;
        };
        let thread_id = stop.get("threadId").cloned().unwrap_or(json!(0));
        self.send_event(
            "continued",
            json!({"threadId": thread_id, "allThreadsContinued": true}),
        );
        self.send_event("stopped", stop);
    }
}
