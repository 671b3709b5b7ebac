//! Terminals for the debuggee.
//!
//! The adapter listens on a loopback port and has a terminal run `stalker-dap terminal-agent
//! --port N`. The agent connects back, reports the tty of its stdin and stays alive until the
//! adapter drops the connection. The debuggee then gets that tty as stdio.

use anyhow::{anyhow, bail, Context};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How long to wait for the agent to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Command prefix used to open an external terminal.
pub const TERMINAL_ENV: &str = "STALKER_DAP_TERMINAL";
pub const DEFAULT_TERMINAL: &str = "x-terminal-emulator -e";

/// Connected terminal agent, dropping it ends the agent.
#[derive(Debug)]
pub struct Terminal {
    tty: String,
    _connection: TcpStream,
}

impl Terminal {
    pub fn tty(&self) -> &str {
        &self.tty
    }
}

pub struct TerminalListener {
    listener: TcpListener,
}

impl TerminalListener {
    pub fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind terminal port")?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Command line that starts an agent for this listener.
    pub fn agent_command(&self) -> anyhow::Result<Vec<String>> {
        let exe = std::env::current_exe().context("locate adapter executable")?;
        Ok(vec![
            exe.to_string_lossy().into_owned(),
            "terminal-agent".to_string(),
            "--port".to_string(),
            self.port()?.to_string(),
        ])
    }

    /// Wait for an agent and read its tty name.
    pub fn accept(self, timeout: Duration) -> anyhow::Result<Terminal> {
        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        bail!("terminal agent did not connect in {} s", timeout.as_secs());
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout))?;

        let mut line = String::new();
        BufReader::new(stream.try_clone()?)
            .read_line(&mut line)
            .context("read tty name from terminal agent")?;
        let tty = line.trim().to_string();
        if tty.is_empty() {
            bail!("terminal agent reported no tty");
        }
        stream.set_read_timeout(None)?;
        log::info!(target: "dap", "terminal agent connected, tty {tty}");
        Ok(Terminal {
            tty,
            _connection: stream,
        })
    }
}

/// Open an external terminal running `agent_command`.
pub fn spawn_external(agent_command: &[String]) -> anyhow::Result<Child> {
    let launcher = std::env::var(TERMINAL_ENV).unwrap_or_else(|_| DEFAULT_TERMINAL.to_string());
    let mut words = launcher.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| anyhow!("{TERMINAL_ENV} is empty"))?;
    Command::new(program)
        .args(words)
        .args(agent_command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn terminal `{launcher}`"))
}

/// Collect an exited terminal process, or wait for it on a detached thread.
pub fn reap(mut child: Child) {
    if let Some(Some(status)) = crate::muted_error!(child.try_wait(), "terminal status:") {
        log::debug!(target: "dap", "terminal {} exited: {status}", child.id());
        return;
    }
    let reaper = thread::Builder::new()
        .name("terminal-reaper".to_string())
        .spawn(move || {
            crate::muted_error!(child.wait(), "terminal wait:");
        });
    crate::weak_error!(reaper, "start terminal reaper:");
}

/// Body of the `terminal-agent` subcommand.
pub fn run_agent(port: u16) -> anyhow::Result<()> {
    let tty = std::fs::read_link("/proc/self/fd/0").context("resolve tty of stdin")?;
    let mut stream =
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).context("connect to the adapter")?;
    writeln!(stream, "{}", tty.display())?;
    stream.flush()?;

    // park until the adapter goes away
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_accept_reads_tty() {
        let listener = TerminalListener::bind().unwrap();
        let port = listener.port().unwrap();
        let agent = thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            stream.write_all(b"/dev/pts/7\n").unwrap();
            let mut buf = [0u8; 1];
            // returns once the terminal is dropped
            stream.read(&mut buf).unwrap()
        });
        let terminal = listener.accept(ACCEPT_TIMEOUT).unwrap();
        assert_eq!(terminal.tty(), "/dev/pts/7");
        drop(terminal);
        assert_eq!(agent.join().unwrap(), 0);
    }

    #[test]
    #[serial]
    fn test_accept_timeout() {
        let listener = TerminalListener::bind().unwrap();
        let started = Instant::now();
        let err = listener.accept(Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("did not connect"));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    fn is_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !std::path::Path::new(&format!("/proc/{pid}")).exists() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_reap_exited_and_running_terminal() {
        let exited = Command::new("true").spawn().unwrap();
        let pid = exited.id();
        thread::sleep(Duration::from_millis(100));
        reap(exited);
        assert!(is_gone(pid));

        let running = Command::new("sleep").arg("0.2").spawn().unwrap();
        let pid = running.id();
        reap(running);
        assert!(is_gone(pid));
    }

    #[test]
    fn test_agent_command() {
        let listener = TerminalListener::bind().unwrap();
        let cmd = listener.agent_command().unwrap();
        assert_eq!(cmd[1..3], ["terminal-agent", "--port"]);
        assert_eq!(cmd[3], listener.port().unwrap().to_string());
    }
}
