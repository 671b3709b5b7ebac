mod common;

use common::{
    assert_failure, assert_success, fixture, DapClient, COUNTER_SOURCE, READ_TIMEOUT,
};
use serde_json::{json, Value};
use serial_test::serial;
use stalker_dap::config::AdapterSettings;
use stalker_dap::dap::transport;
use stalker_dap::engine::sim::SimEngine;
use stalker_dap::session::run_session;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Session running on its own thread, the client talks to it over a socket pair.
struct Harness {
    client: DapClient,
    session: Option<JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        Self::with_settings(AdapterSettings::default())
    }

    fn with_settings(settings: AdapterSettings) -> Self {
        let (client_side, adapter_side) = UnixStream::pair().unwrap();
        client_side.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let session = thread::spawn(move || {
            let (reader, writer) = transport::split(adapter_side, None).unwrap();
            run_session(reader, writer, Box::new(SimEngine::new()), &settings).unwrap();
        });
        let reader = client_side.try_clone().unwrap();
        Self {
            client: DapClient::new(reader, client_side),
            session: Some(session),
        }
    }

    fn initialize(&mut self) -> Value {
        let response = self
            .client
            .request("initialize", json!({"adapterID": "stalker"}))
            .unwrap();
        assert_success(&response, "initialize");
        response
    }

    /// Full launch handshake, `configure` runs between `initialized` and `configurationDone`.
    fn launch(&mut self, args: Value, configure: impl FnOnce(&mut DapClient)) {
        self.initialize();
        let launch_seq = self.client.send_request("launch", args).unwrap();
        self.client.wait_for_event("initialized").unwrap();
        configure(&mut self.client);
        let done_seq = self.client.send_request("configurationDone", json!({})).unwrap();
        assert_success(&self.client.read_response(launch_seq).unwrap(), "launch");
        assert_success(&self.client.read_response(done_seq).unwrap(), "configurationDone");
    }

    fn launch_counter(&mut self, configure: impl FnOnce(&mut DapClient)) {
        self.launch(json!({"program": fixture("counter.toml")}), configure);
    }

    fn launch_counter_stopped(&mut self) -> Value {
        self.launch(
            json!({"program": fixture("counter.toml"), "stopOnEntry": true}),
            |_| {},
        );
        let stopped = self.client.wait_for_event("stopped").unwrap();
        assert_eq!(stopped["body"]["reason"], "entry");
        stopped
    }

    fn disconnect(mut self) {
        let response = self.client.request("disconnect", json!({})).unwrap();
        assert_success(&response, "disconnect");
        self.join();
    }

    fn join(&mut self) {
        if let Some(session) = self.session.take() {
            session.join().unwrap();
        }
    }
}

fn set_breakpoints(client: &mut DapClient, breakpoints: Value) -> Value {
    let response = client
        .request(
            "setBreakpoints",
            json!({"source": {"path": COUNTER_SOURCE}, "breakpoints": breakpoints}),
        )
        .unwrap();
    assert_success(&response, "setBreakpoints");
    response
}

fn stack_trace(client: &mut DapClient, thread_id: &Value) -> Vec<Value> {
    let response = client
        .request("stackTrace", json!({"threadId": thread_id}))
        .unwrap();
    assert_success(&response, "stackTrace");
    response["body"]["stackFrames"].as_array().unwrap().clone()
}

fn top_frame(client: &mut DapClient, thread_id: &Value) -> Value {
    stack_trace(client, thread_id).remove(0)
}

/// `name -> (value, variablesReference)` of a variables response.
fn variables(client: &mut DapClient, reference: &Value) -> Vec<(String, String, i64)> {
    let response = client
        .request("variables", json!({"variablesReference": reference}))
        .unwrap();
    assert_success(&response, "variables");
    response["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| {
            (
                v["name"].as_str().unwrap().to_string(),
                v["value"].as_str().unwrap().to_string(),
                v["variablesReference"].as_i64().unwrap(),
            )
        })
        .collect()
}

fn scopes(client: &mut DapClient, frame_id: &Value) -> Vec<Value> {
    let response = client.request("scopes", json!({"frameId": frame_id})).unwrap();
    assert_success(&response, "scopes");
    response["body"]["scopes"].as_array().unwrap().clone()
}

/// Names of a `variables` page.
fn variable_names(client: &mut DapClient, reference: &Value, start: usize, count: usize) -> Vec<String> {
    let response = client
        .request(
            "variables",
            json!({"variablesReference": reference, "start": start, "count": count}),
        )
        .unwrap();
    assert_success(&response, "variables");
    response["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["name"].as_str().unwrap().to_string())
        .collect()
}

/// `variablesReference` of the local `name` in the top frame of thread 1.
fn local_reference(client: &mut DapClient, name: &str) -> i64 {
    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let locals = scopes(client, &frame_id)[0]["variablesReference"].clone();
    variables(client, &locals)
        .into_iter()
        .find(|(local, _, _)| local == name)
        .map(|(_, _, reference)| reference)
        .unwrap()
}

fn assert_connection_closed(client: &mut DapClient) {
    let err = client.read_message().unwrap_err();
    assert!(err.to_string().contains("closed"), "{err}");
}

fn wait_for_console(client: &mut DapClient, text: &str) {
    loop {
        if client.wait_for_output("console").unwrap() == text {
            return;
        }
    }
}

fn evaluate(client: &mut DapClient, expression: &str, frame_id: &Value, context: &str) -> Value {
    client
        .request(
            "evaluate",
            json!({"expression": expression, "frameId": frame_id, "context": context}),
        )
        .unwrap()
}

#[test]
fn test_initialize_capabilities() {
    let mut harness = Harness::start();
    let response = harness.initialize();
    let body = &response["body"];
    for capability in [
        "supportsConfigurationDoneRequest",
        "supportsEvaluateForHovers",
        "supportsFunctionBreakpoints",
        "supportsConditionalBreakpoints",
        "supportsSetVariable",
    ] {
        assert_eq!(body[capability], true, "{capability}");
    }
    let filters = body["exceptionBreakpointFilters"].as_array().unwrap();
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0]["filter"], "all");
    assert_eq!(filters[1]["filter"], "uncaught");
    harness.disconnect();
}

#[test]
fn test_unsupported_command() {
    let mut harness = Harness::start();
    let response = harness.client.request("fooBar", json!({})).unwrap();
    let message = assert_failure(&response, "fooBar");
    assert_eq!(message, "Unsupported DAP command: fooBar");
    assert!(response.get("body").is_none());
    harness.disconnect();
}

#[test]
fn test_launch_requires_program() {
    let mut harness = Harness::start();
    harness.initialize();
    let response = harness.client.request("launch", json!({})).unwrap();
    let message = assert_failure(&response, "launch");
    assert!(message.contains("program"), "{message}");
    assert_eq!(response["body"]["error"]["showUser"], true);
    harness.disconnect();
}

#[test]
fn test_breakpoint_stop_and_inspect() {
    let mut harness = Harness::start();
    let mut bp_id = Value::Null;
    harness.launch_counter(|client| {
        let response = set_breakpoints(client, json!([{"line": 11}]));
        let bp = &response["body"]["breakpoints"][0];
        assert_eq!(bp["verified"], true);
        assert_eq!(bp["line"], 11);
        assert_eq!(bp["message"], "Locations: 1");
        bp_id = bp["id"].clone();
    });
    let client = &mut harness.client;

    assert_eq!(client.wait_for_output("stdout").unwrap(), "tick 0\n");
    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([bp_id]));

    let frames = stack_trace(client, &json!(1));
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["name"], "main");
    assert_eq!(frames[0]["line"], 11);
    assert_eq!(frames[0]["source"]["path"], COUNTER_SOURCE);
    let frame_id = frames[0]["id"].clone();

    let scopes = scopes(client, &frame_id);
    let names: Vec<_> = scopes.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["Local", "Static", "Registers"]);

    let locals = variables(client, &scopes[0]["variablesReference"]);
    assert_eq!(locals[0], ("i".to_string(), "0".to_string(), 0));
    let (name, value, point_ref) = &locals[1];
    assert_eq!((name.as_str(), value.as_str()), ("point", "Point"));
    assert!(*point_ref >= 1000);
    let members = variables(client, &json!(point_ref));
    assert_eq!(
        members,
        [
            ("x".to_string(), "1".to_string(), 0),
            ("y".to_string(), "2".to_string(), 0)
        ]
    );

    let statics = variables(client, &scopes[1]["variablesReference"]);
    assert_eq!(statics, [("g_total".to_string(), "100".to_string(), 0)]);

    let response = evaluate(client, "point.x", &frame_id, "watch");
    assert_success(&response, "evaluate");
    assert_eq!(response["body"]["result"], "1");
    assert_eq!(response["body"]["type"], "int");

    let response = evaluate(client, "missing", &frame_id, "hover");
    let message = assert_failure(&response, "evaluate");
    assert!(message.contains("undeclared identifier"), "{message}");

    assert_success(&client.request("continue", json!({"threadId": 1})).unwrap(), "continue");
    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let response = evaluate(client, "i", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "1");

    assert_success(&client.request("continue", json!({"threadId": 1})).unwrap(), "continue");
    assert_eq!(client.wait_for_output("stderr").unwrap(), "done\n");
    let exited = client.wait_for_event("exited").unwrap();
    assert_eq!(exited["body"]["exitCode"], 3);
    client.wait_for_event("terminated").unwrap();
    harness.disconnect();
}

#[test]
fn test_stepping_from_entry() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;
    let thread = json!(1);

    let step = |client: &mut DapClient, command: &str| -> Vec<Value> {
        let response = client.request(command, json!({"threadId": 1})).unwrap();
        assert_success(&response, command);
        let stopped = client.wait_for_event("stopped").unwrap();
        assert_eq!(stopped["body"]["reason"], "step");
        stack_trace(client, &thread)
    };

    let frames = step(client, "next");
    assert_eq!(frames[0]["line"], 11);

    let frames = step(client, "stepIn");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["name"], "add");
    assert_eq!(frames[0]["line"], 3);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 11);

    let frames = step(client, "stepOut");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["line"], 12);

    let frames = step(client, "next");
    assert_eq!(frames[0]["line"], 11);

    // the helper call below main:13 is stepped over
    let frames = step(client, "next");
    assert_eq!(frames[0]["line"], 14);

    assert_success(&client.request("continue", json!({"threadId": 1})).unwrap(), "continue");
    let exited = client.wait_for_event("exited").unwrap();
    assert_eq!(exited["body"]["exitCode"], 3);
    harness.disconnect();
}

#[test]
fn test_hit_condition() {
    let mut harness = Harness::start();
    harness.launch_counter(|client| {
        set_breakpoints(client, json!([{"line": 11, "hitCondition": "2"}]));
    });
    let client = &mut harness.client;

    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let response = evaluate(client, "i", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "1");
    harness.disconnect();
}

#[test]
fn test_logpoint_does_not_stop() {
    let mut harness = Harness::start();
    harness.launch_counter(|client| {
        set_breakpoints(client, json!([{"line": 11, "logMessage": "i = {i}"}]));
    });

    let events = harness.client.events_until("exited").unwrap();
    assert!(events.iter().all(|e| e["event"] != "stopped"));
    let console: Vec<_> = events
        .iter()
        .filter(|e| e["event"] == "output" && e["body"]["category"] == "console")
        .map(|e| e["body"]["output"].as_str().unwrap())
        .collect();
    assert!(console.contains(&"i = 0\n"), "{console:?}");
    assert!(console.contains(&"i = 1\n"), "{console:?}");
    harness.disconnect();
}

#[test]
fn test_conditional_breakpoint() {
    let mut harness = Harness::start();
    harness.launch_counter(|client| {
        set_breakpoints(client, json!([{"line": 11, "condition": "i == 1"}]));
    });
    let client = &mut harness.client;

    client.wait_for_event("stopped").unwrap();
    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let response = evaluate(client, "i", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "1");
    harness.disconnect();
}

#[test]
fn test_function_breakpoint_in_disassembly() {
    let mut harness = Harness::start();
    harness.launch_counter(|client| {
        let response = client
            .request(
                "setFunctionBreakpoints",
                json!({"breakpoints": [{"name": "helper"}]}),
            )
            .unwrap();
        assert_success(&response, "setFunctionBreakpoints");
        assert_eq!(response["body"]["breakpoints"][0]["verified"], true);
    });
    let client = &mut harness.client;

    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "breakpoint");

    let frames = stack_trace(client, &json!(1));
    assert_eq!(frames[0]["name"], "helper");
    assert_eq!(frames[0]["presentationHint"], "subtle");
    assert_eq!(frames[0]["line"], 3);
    let reference = frames[0]["source"]["sourceReference"].clone();
    assert!(reference.as_i64().unwrap() >= 1000);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 13);

    let response = client
        .request("source", json!({"source": {"sourceReference": reference}}))
        .unwrap();
    assert_success(&response, "source");
    assert_eq!(response["body"]["mimeType"], "text/x-lldb.disassembly");
    let content = response["body"]["content"].as_str().unwrap();
    assert!(content.contains("push"), "{content}");
    assert!(content.starts_with("; id = "), "{content}");
    harness.disconnect();
}

#[test]
fn test_pause_stopped_process() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;

    assert_success(&client.request("pause", json!({"threadId": 1})).unwrap(), "pause");
    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "pause");
    assert_eq!(stopped["body"]["threadId"], 1);
    harness.disconnect();
}

#[test]
fn test_repl_commands_and_expressions() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;
    let frame_id = top_frame(client, &json!(1))["id"].clone();

    let response = evaluate(client, "echo hello world", &frame_id, "repl");
    assert_success(&response, "evaluate");
    assert_eq!(response["body"]["result"], "");
    wait_for_console(client, "hello world\n");

    let response = evaluate(client, "?i", &frame_id, "repl");
    assert_eq!(response["body"]["result"], "0");

    let response = evaluate(client, "bogus", &frame_id, "repl");
    assert_success(&response, "evaluate");
    wait_for_console(client, "error: 'bogus' is not a valid command.\n");

    let response = evaluate(client, "?nope", &frame_id, "repl");
    assert_success(&response, "evaluate");
    wait_for_console(client, "error: use of undeclared identifier 'nope'\n");
    harness.disconnect();
}

#[test]
fn test_set_variable() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;

    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let locals = scopes(client, &frame_id)[0]["variablesReference"].clone();
    let response = client
        .request(
            "setVariable",
            json!({"variablesReference": locals, "name": "i", "value": "0x2a"}),
        )
        .unwrap();
    assert_success(&response, "setVariable");
    assert_eq!(response["body"]["value"], "42");

    let response = evaluate(client, "i", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "42");

    let response = evaluate(client, "i,x", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "0x0000002a");

    let response = client
        .request(
            "setVariable",
            json!({"variablesReference": locals, "name": "i", "value": "many"}),
        )
        .unwrap();
    let message = assert_failure(&response, "setVariable");
    assert!(message.contains("Could not parse"), "{message}");
    harness.disconnect();
}

#[test]
fn test_signal_stop_and_threads() {
    let mut harness = Harness::start();
    harness.launch(json!({"program": fixture("crash.toml")}), |_| {});
    let client = &mut harness.client;

    let events = client.events_until("stopped").unwrap();
    let started: Vec<_> = events
        .iter()
        .filter(|e| e["event"] == "thread")
        .map(|e| {
            assert_eq!(e["body"]["reason"], "started");
            e["body"]["threadId"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(started, [100, 101]);
    let stopped = events.last().unwrap();
    assert_eq!(stopped["body"]["reason"], "signal");
    assert_eq!(stopped["body"]["threadId"], 101);
    assert_eq!(stopped["body"]["description"], "signal SIGSEGV");

    let response = client.request("threads", json!({})).unwrap();
    assert_success(&response, "threads");
    let names: Vec<_> = response["body"]["threads"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["1: tid=100 \"main\"", "2: tid=101 \"worker\""]);

    let frame = top_frame(client, &json!(100));
    assert_eq!(frame["line"], 6);
    harness.disconnect();
}

#[test]
fn test_stale_variables_reference() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;

    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let locals = scopes(client, &frame_id)[0]["variablesReference"].clone();
    assert_success(&client.request("next", json!({"threadId": 1})).unwrap(), "next");
    client.wait_for_event("stopped").unwrap();

    assert!(variables(client, &locals).is_empty());
    harness.disconnect();
}

#[test]
fn test_client_eof_ends_session() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let Harness { client, session } = harness;
    drop(client);
    if let Some(session) = session {
        session.join().unwrap();
    }
}

#[test]
fn test_malformed_header_is_skipped() {
    let mut harness = Harness::start();
    harness
        .client
        .write_raw(b"X-Garbage: 1\r\n\r\n")
        .unwrap();
    let response = harness.client.request("threads", json!({})).unwrap();
    assert_success(&response, "threads");
    assert_eq!(response["body"]["threads"], json!([]));
    harness.disconnect();
}

#[test]
#[serial]
fn test_extension_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let settings = AdapterSettings {
        extension_port: Some(listener.local_addr().unwrap().port()),
        ..AdapterSettings::default()
    };
    let mut harness = Harness::with_settings(settings);
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    let mut extension = DapClient::new(stream.try_clone().unwrap(), stream);

    let response = extension.request("adapterSettings", json!({})).unwrap();
    assert_success(&response, "adapterSettings");
    assert_eq!(response["body"]["displayFormat"], "auto");
    assert_eq!(response["body"]["showDisassembly"], "auto");

    harness.launch_counter_stopped();

    let response = extension.request("showDisassembly", json!({})).unwrap();
    assert_success(&response, "showDisassembly");
    assert_eq!(response["body"]["showDisassembly"], "always");

    let client = &mut harness.client;
    client.wait_for_event("continued").unwrap();
    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "entry");
    let frame = top_frame(client, &json!(1));
    assert_eq!(frame["presentationHint"], "subtle");
    assert!(frame["source"]["sourceReference"].as_i64().is_some());

    let response = extension
        .request("displaySettings", json!({"displayFormat": "hex", "showDisassembly": "never"}))
        .unwrap();
    assert_success(&response, "displaySettings");
    assert_eq!(response["body"]["displayFormat"], "hex");
    let frame_id = top_frame(client, &json!(1))["id"].clone();
    let response = evaluate(client, "i", &frame_id, "watch");
    assert_eq!(response["body"]["result"], "0x00000000");
    harness.disconnect();
}

#[test]
fn test_set_breakpoints_again_keeps_surviving_ids() {
    let mut harness = Harness::start();
    let mut ids = vec![];
    harness.launch_counter(|client| {
        let first = set_breakpoints(client, json!([{"line": 11}, {"line": 12}]));
        let second = set_breakpoints(client, json!([{"line": 12}, {"line": 14}]));
        let first = first["body"]["breakpoints"].as_array().unwrap().clone();
        let second = second["body"]["breakpoints"].as_array().unwrap().clone();
        assert_eq!(second[0]["id"], first[1]["id"]);
        assert_eq!(second[1]["line"], 14);
        assert_ne!(second[1]["id"], first[0]["id"]);
        assert_ne!(second[1]["id"], first[1]["id"]);
        ids = second.iter().map(|bp| bp["id"].clone()).collect();
    });
    let client = &mut harness.client;

    // line 11 is gone, so the first stop is line 12
    let events = client.events_until("stopped").unwrap();
    assert!(events.iter().all(|e| e["event"] != "breakpoint"), "{events:?}");
    let stopped = events.last().unwrap();
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([ids[0]]));
    assert_eq!(top_frame(client, &json!(1))["line"], 12);

    assert_success(&client.request("continue", json!({"threadId": 1})).unwrap(), "continue");
    let events = client.events_until("stopped").unwrap();
    assert!(events.iter().all(|e| e["event"] != "breakpoint"), "{events:?}");
    assert_eq!(events.last().unwrap()["body"]["hitBreakpointIds"], json!([ids[1]]));
    assert_eq!(top_frame(client, &json!(1))["line"], 14);
    harness.disconnect();
}

#[test]
fn test_exception_breakpoint_stop() {
    let mut harness = Harness::start();
    harness.launch(json!({"program": fixture("throw.toml")}), |client| {
        let response = client
            .request("setExceptionBreakpoints", json!({"filters": ["all"]}))
            .unwrap();
        assert_success(&response, "setExceptionBreakpoints");
        let breakpoints = response["body"]["breakpoints"].as_array().unwrap();
        assert_eq!(breakpoints.len(), 1);
        assert_eq!(breakpoints[0]["verified"], true);
    });
    let client = &mut harness.client;

    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "exception");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["allThreadsStopped"], true);
    let frames = stack_trace(client, &json!(1));
    assert_eq!(frames[0]["name"], "__cxa_throw");
    assert_eq!(frames[1]["line"], 6);
    harness.disconnect();
}

#[test]
fn test_variable_handle_survives_continue() {
    let mut harness = Harness::start();
    harness.launch_counter(|client| {
        set_breakpoints(client, json!([{"line": 11}]));
    });
    let client = &mut harness.client;

    client.wait_for_event("stopped").unwrap();
    let first = local_reference(client, "point");
    assert_eq!(variables(client, &json!(first))[1].1, "2");

    assert_success(&client.request("continue", json!({"threadId": 1})).unwrap(), "continue");
    client.wait_for_event("stopped").unwrap();
    let second = local_reference(client, "point");
    assert_eq!(second, first);
    assert_eq!(
        variables(client, &json!(second)),
        [
            ("x".to_string(), "1".to_string(), 0),
            ("y".to_string(), "3".to_string(), 0)
        ]
    );
    harness.disconnect();
}

#[test]
fn test_raw_child_on_last_page_only() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;

    let items = json!(local_reference(client, "items"));
    assert_eq!(variable_names(client, &items, 0, 2), ["[0]", "[1]"]);
    assert_eq!(variable_names(client, &items, 2, 2), ["[2]", "[raw]"]);
    assert_eq!(variable_names(client, &items, 0, 0), ["[0]", "[1]", "[2]", "[raw]"]);

    let raw = variables(client, &items)
        .into_iter()
        .find(|(name, _, _)| name == "[raw]")
        .map(|(_, _, reference)| reference)
        .unwrap();
    let members: Vec<_> = variables(client, &json!(raw))
        .into_iter()
        .map(|(name, value, _)| (name, value))
        .collect();
    assert_eq!(
        members,
        [
            ("__size_".to_string(), "3".to_string()),
            ("__cap_".to_string(), "4".to_string())
        ]
    );
    harness.disconnect();
}

#[test]
fn test_attach_then_disconnect_detaches() {
    let mut harness = Harness::start();
    harness.initialize();
    let client = &mut harness.client;

    let attach_seq = client
        .send_request(
            "attach",
            json!({"program": fixture("counter.toml"), "pid": 4242, "stopOnEntry": true}),
        )
        .unwrap();
    client.wait_for_event("initialized").unwrap();
    let done_seq = client.send_request("configurationDone", json!({})).unwrap();
    assert_success(&client.read_response(attach_seq).unwrap(), "attach");
    assert_success(&client.read_response(done_seq).unwrap(), "configurationDone");
    wait_for_console(client, "Attaching to 4242\n");
    let stopped = client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], "entry");

    let disconnect_seq = client.send_request("disconnect", json!({})).unwrap();
    wait_for_console(client, "Detached from the debuggee.\n");
    let response = client.read_message().unwrap();
    assert_eq!(response["request_seq"], disconnect_seq);
    assert_success(&response, "disconnect");
    harness.join();
    assert_connection_closed(&mut harness.client);
}

#[test]
fn test_disconnect_kills_launched_process() {
    let mut harness = Harness::start();
    harness.launch_counter_stopped();
    let client = &mut harness.client;

    let disconnect_seq = client.send_request("disconnect", json!({})).unwrap();
    wait_for_console(client, "Terminated the debuggee.\n");
    let response = client.read_message().unwrap();
    assert_eq!(response["request_seq"], disconnect_seq);
    assert_success(&response, "disconnect");
    harness.join();
    // the killed process reports no exit
    assert_connection_closed(&mut harness.client);
}

#[test]
fn test_disconnect_before_configuration_done() {
    let mut harness = Harness::start();
    harness.initialize();
    let client = &mut harness.client;

    let launch_seq = client
        .send_request("launch", json!({"program": fixture("counter.toml")}))
        .unwrap();
    client.wait_for_event("initialized").unwrap();
    let disconnect_seq = client.send_request("disconnect", json!({})).unwrap();

    let message = assert_failure(&client.read_response(launch_seq).unwrap(), "launch");
    assert_eq!(message, "Session ended before launch completed");
    assert_success(&client.read_response(disconnect_seq).unwrap(), "disconnect");
    harness.join();
}

#[test]
fn test_oversized_header_ends_session() {
    let mut harness = Harness::start();
    harness
        .client
        .write_raw(b"Content-Length: 18446744073709551615\r\n\r\n{}")
        .unwrap();

    let session = harness.session.take().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !session.is_finished() {
        assert!(Instant::now() < deadline, "session still running");
        thread::sleep(Duration::from_millis(20));
    }
    session.join().unwrap();
    assert_connection_closed(&mut harness.client);
}

/// Answer the `runInTerminal` request, returns the agent side of the terminal connection.
fn run_in_terminal(client: &mut DapClient) -> TcpStream {
    let request = client.read_reverse_request().unwrap();
    assert_eq!(request["command"], "runInTerminal");
    assert_eq!(request["arguments"]["kind"], "integrated");
    let args = request["arguments"]["args"].as_array().unwrap();
    assert_eq!(args[1], "terminal-agent");
    assert_eq!(args[2], "--port");
    let port: u16 = args[3].as_str().unwrap().parse().unwrap();

    let mut agent = TcpStream::connect(("127.0.0.1", port)).unwrap();
    agent.write_all(b"/dev/pts/9\n").unwrap();
    client.send_response(&request, true, json!({"processId": 4242})).unwrap();
    agent
}

#[test]
#[serial]
fn test_integrated_terminal_launch() {
    let mut harness = Harness::start();
    harness.initialize();
    let client = &mut harness.client;

    let launch_seq = client
        .send_request(
            "launch",
            json!({"program": fixture("counter.toml"), "terminal": "integrated"}),
        )
        .unwrap();
    client.wait_for_event("initialized").unwrap();
    let done_seq = client.send_request("configurationDone", json!({})).unwrap();
    let mut agent = run_in_terminal(client);

    assert_success(&client.read_response(launch_seq).unwrap(), "launch");
    assert_success(&client.read_response(done_seq).unwrap(), "configurationDone");
    let exited = client.wait_for_event("exited").unwrap();
    assert_eq!(exited["body"]["exitCode"], 3);
    harness.disconnect();

    // the adapter hangs up on the agent when the session ends
    agent.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(agent.read(&mut buf).unwrap(), 0);
}

#[test]
#[serial]
fn test_integrated_terminal_refused() {
    let mut harness = Harness::start();
    harness.initialize();
    let client = &mut harness.client;

    let launch_seq = client
        .send_request(
            "launch",
            json!({"program": fixture("counter.toml"), "terminal": "integrated"}),
        )
        .unwrap();
    client.wait_for_event("initialized").unwrap();
    let done_seq = client.send_request("configurationDone", json!({})).unwrap();
    let request = client.read_reverse_request().unwrap();
    assert_eq!(request["command"], "runInTerminal");
    client.send_response(&request, false, json!({})).unwrap();

    let message = assert_failure(&client.read_response(launch_seq).unwrap(), "launch");
    assert!(message.starts_with("Could not start a terminal"), "{message}");
    assert_success(&client.read_response(done_seq).unwrap(), "configurationDone");
    harness.disconnect();
}
