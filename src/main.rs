//! stalker-dap - Debug Adapter Protocol adapter.
//!
//! Serves DAP clients over TCP, a connected socket, a pair of file descriptors or stdio.
//! Every client gets its own session and engine.

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use stalker_dap::config::{decode_b64_string, AdapterSettings};
use stalker_dap::dap::tracer::FileTracer;
use stalker_dap::dap::transport::{self, DapReader, DapWriter};
use stalker_dap::engine::sim::SimEngine;
use stalker_dap::mem_limit::{set_memory_limit, MEMORY_LIMIT};
use stalker_dap::session::run_session;
use stalker_dap::{terminal, weak_error};
use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TCP port to listen on, 0 picks a free one.
    #[arg(long, default_value_t = 4711)]
    port: u16,

    /// Keep accepting clients after the first session ends.
    #[arg(long)]
    multi_session: bool,

    /// Connect to a client listening on this port instead of listening.
    #[arg(long, group = "mode")]
    connect: Option<u16>,

    /// Read DAP messages from this file descriptor (needs --output-fd).
    #[arg(long, group = "mode", requires = "output_fd")]
    input_fd: Option<RawFd>,

    /// Write DAP messages to this file descriptor (needs --input-fd).
    #[arg(long, requires = "input_fd")]
    output_fd: Option<RawFd>,

    /// Serve a single session over stdin/stdout.
    #[arg(long, group = "mode")]
    stdio: bool,

    /// Adapter diagnostics go here instead of stderr.
    #[arg(long, env = "STALKER_DAP_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[arg(long, env = "STALKER_DAP_LOG_LEVEL", default_value = "warn")]
    log_level: LevelFilter,

    /// Settings file, defaults to ~/.config/stalker-dap/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base64 encoded JSON object with settings overrides.
    #[arg(long, env = "STALKER_DAP_PARAMS")]
    params: Option<String>,

    /// Record raw DAP traffic into this file.
    #[arg(long)]
    trace_dap: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report the tty of this terminal to the adapter, then wait for it to go away.
    TerminalAgent {
        #[arg(long)]
        port: u16,
    },
}

/// Log path from `STALKER_DAP_LOG_B64`, base64 keeps odd paths intact through shells.
fn encoded_log_file() -> Option<PathBuf> {
    let encoded = std::env::var("STALKER_DAP_LOG_B64").ok()?;
    weak_error!(decode_b64_string(&encoded), "STALKER_DAP_LOG_B64:").map(PathBuf::from)
}

fn serve<R: Read + Send + 'static>(
    reader: DapReader<R>,
    writer: DapWriter,
    settings: &AdapterSettings,
) {
    let engine = Box::new(SimEngine::new());
    if let Err(e) = run_session(reader, writer, engine, settings) {
        log::warn!(target: "dap", "session ended with error: {e:#}");
    }
}

fn serve_tcp(
    stream: TcpStream,
    settings: &AdapterSettings,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    log::info!(target: "dap", "DAP client connected: {peer}");
    if let Some(t) = &tracer {
        t.line(&format!("client connected: {peer}"));
    }
    let (reader, writer) = transport::split(stream, tracer)?;
    serve(reader, writer, settings);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::TerminalAgent { port }) = args.command {
        return terminal::run_agent(port);
    }

    let log_file = encoded_log_file().or(args.log_file.clone());
    stalker_dap::log::init(log_file.as_deref(), args.log_level)?;
    weak_error!(set_memory_limit(MEMORY_LIMIT), "memory limit:");

    let settings = AdapterSettings::load(args.config.as_deref(), args.params.as_deref())?;
    let tracer = match &args.trace_dap {
        Some(path) => Some(FileTracer::new(path)?),
        None => None,
    };

    if args.stdio {
        let reader = DapReader::new(std::io::stdin(), tracer.clone());
        let writer = DapWriter::new(std::io::stdout(), tracer);
        serve(reader, writer, &settings);
        return Ok(());
    }

    if let (Some(input), Some(output)) = (args.input_fd, args.output_fd) {
        // SAFETY: the descriptors are handed over by the parent process and owned from now on
        let (input, output) = unsafe { (File::from_raw_fd(input), File::from_raw_fd(output)) };
        serve(
            DapReader::new(input, tracer.clone()),
            DapWriter::new(output, tracer),
            &settings,
        );
        return Ok(());
    }

    if let Some(port) = args.connect {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("connect to client port {port}"))?;
        return serve_tcp(stream, &settings, tracer);
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, args.port))
        .with_context(|| format!("bind port {}", args.port))?;
    let port = listener.local_addr()?.port();
    println!("Listening on port {port}");
    log::info!(target: "dap", "stalker-dap listening on 127.0.0.1:{port}");

    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!(target: "dap", "accept failed: {e:#}");
                continue;
            }
        };
        weak_error!(serve_tcp(stream, &settings, tracer.clone()), "client:");
        if !args.multi_session {
            break;
        }
    }
    Ok(())
}
