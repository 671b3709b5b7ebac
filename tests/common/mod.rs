#![allow(dead_code)]

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn fixture(name: &str) -> String {
    repo_root()
        .join("tests")
        .join("fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

/// Source file of the `counter.toml` program.
pub const COUNTER_SOURCE: &str = "/src/counter.c";

/// Framed JSON client, events that arrive while waiting for a response are kept for later.
pub struct DapClient {
    writer: Box<dyn Write + Send>,
    reader: BufReader<Box<dyn Read + Send>>,
    next_seq: i64,
    pending_events: VecDeque<Value>,
}

impl DapClient {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            reader: BufReader::new(Box::new(reader)),
            next_seq: 1,
            pending_events: VecDeque::new(),
        }
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_message(&request)?;
        Ok(seq)
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.send_request(command, arguments)?;
        self.read_response(seq)
    }

    pub fn send_response(&mut self, request: &Value, success: bool, body: Value) -> anyhow::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": success,
            "body": body,
        });
        self.write_message(&response)
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        loop {
            let msg = self.read_message()?;
            match msg.get("type").and_then(Value::as_str) {
                Some("event") => self.pending_events.push_back(msg),
                Some("response") => {
                    if msg.get("request_seq").and_then(Value::as_i64) == Some(request_seq) {
                        return Ok(msg);
                    }
                }
                _ => {}
            }
        }
    }

    /// Next reverse request sent by the adapter.
    pub fn read_reverse_request(&mut self) -> anyhow::Result<Value> {
        loop {
            let msg = self.read_message()?;
            match msg.get("type").and_then(Value::as_str) {
                Some("request") => return Ok(msg),
                Some("event") => self.pending_events.push_back(msg),
                _ => {}
            }
        }
    }

    pub fn read_event(&mut self) -> anyhow::Result<Value> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            let msg = self.read_message()?;
            if msg.get("type").and_then(Value::as_str) == Some("event") {
                return Ok(msg);
            }
        }
    }

    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        loop {
            let event = self.read_event()?;
            if event.get("event").and_then(Value::as_str) == Some(name) {
                return Ok(event);
            }
        }
    }

    /// Collect events up to and including the first `name` event.
    pub fn events_until(&mut self, name: &str) -> anyhow::Result<Vec<Value>> {
        let mut events = vec![];
        loop {
            let event = self.read_event()?;
            let last = event.get("event").and_then(Value::as_str) == Some(name);
            events.push(event);
            if last {
                return Ok(events);
            }
        }
    }

    /// Text of the next `output` event with `category`.
    pub fn wait_for_output(&mut self, category: &str) -> anyhow::Result<String> {
        loop {
            let event = self.wait_for_event("output")?;
            if event["body"]["category"] == category {
                return Ok(event["body"]["output"].as_str().unwrap_or_default().to_string());
            }
        }
    }

    /// Next message off the wire, events kept by earlier reads are not returned.
    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("Timed out waiting for DAP header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        self.read_exact_with_deadline(&mut buf, deadline)?;
        let msg = serde_json::from_slice(&buf).context("decode DAP message")?;
        Ok(msg)
    }

    fn read_exact_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> anyhow::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Err(anyhow!("DAP connection closed")),
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("Timed out waiting for DAP body"));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn assert_success(response: &Value, command: &str) {
    assert_eq!(response["type"], "response");
    assert_eq!(response["command"], command);
    assert_eq!(response["success"], true, "response: {response}");
    assert!(response["seq"].as_i64().is_some());
}

pub fn assert_failure(response: &Value, command: &str) -> String {
    assert_eq!(response["type"], "response");
    assert_eq!(response["command"], command);
    assert_eq!(response["success"], false, "response: {response}");
    response["message"].as_str().unwrap_or_default().to_string()
}

pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(anyhow!("process did not exit in time"));
        }
        thread::sleep(Duration::from_millis(50));
    }
}
