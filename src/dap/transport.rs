//! DAP wire codec.
//!
//! Every message is a header block terminated by `\r\n\r\n` that carries at least
//! `Content-Length: <n>`, followed by exactly `n` bytes of UTF-8 JSON. Unknown headers are
//! ignored. A header block without a usable length is logged and dropped; reading continues with
//! the next block.

use crate::dap::tracer::FileTracer;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

pub const CONTENT_LENGTH: &str = "Content-Length";

/// Largest accepted message body. A bigger `Content-Length` is a protocol error that closes the
/// channel.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// How often a blocked reader wakes up to look at the shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Result of a read.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(Value),
    /// Peer closed the stream (or the reader was asked to stop).
    Disconnected,
}

/// Frame a message: header with the exact UTF-8 byte length, then the payload.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> serde_json::Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

/// Reading half of a channel.
pub struct DapReader<R: Read> {
    reader: BufReader<R>,
    tracer: Option<FileTracer>,
}

impl<R: Read> DapReader<R> {
    pub fn new(inner: R, tracer: Option<FileTracer>) -> Self {
        Self {
            reader: BufReader::new(inner),
            tracer,
        }
    }

    /// Read the next message, blocking.
    pub fn read_message(&mut self) -> io::Result<Inbound> {
        self.read_message_until(|| false)
    }

    /// Read the next message. On read timeouts of the underlying stream `is_stopping` is
    /// consulted and the read gives up with [`Inbound::Disconnected`] once it returns true.
    pub fn read_message_until(&mut self, is_stopping: impl Fn() -> bool) -> io::Result<Inbound> {
        loop {
            let Some(length) = self.read_header(&is_stopping)? else {
                return Ok(Inbound::Disconnected);
            };
            let Some(length) = length else {
                log::error!(target: "dap", "No {CONTENT_LENGTH} header, dropping header block");
                continue;
            };
            if length > MAX_MESSAGE_SIZE {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{CONTENT_LENGTH} {length} exceeds {MAX_MESSAGE_SIZE} bytes"),
                ));
            }
            let mut body = vec![0u8; length];
            if !self.read_body(&mut body, &is_stopping)? {
                return Ok(Inbound::Disconnected);
            }
            if let Some(tracer) = &self.tracer {
                tracer.inbound(&body);
            }
            match serde_json::from_slice(&body) {
                Ok(value) => return Ok(Inbound::Message(value)),
                Err(e) => {
                    log::error!(target: "dap", "Malformed message body: {e}");
                }
            }
        }
    }

    /// `None` on EOF, `Some(None)` for a header block without a usable length.
    fn read_header(&mut self, is_stopping: &impl Fn() -> bool) -> io::Result<Option<Option<usize>>> {
        let mut content_length = None;
        let mut saw_header = false;
        loop {
            let mut line = Vec::new();
            loop {
                match self.reader.read_until(b'\n', &mut line) {
                    Ok(_) => break,
                    Err(e) if is_retryable(&e) => {
                        if is_stopping() {
                            return Ok(None);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            if line.is_empty() {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                if saw_header {
                    return Ok(Some(content_length));
                }
                continue;
            }
            saw_header = true;
            if let Some((name, value)) = text.split_once(':') {
                if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                    content_length = crate::weak_error!(
                        value.trim().parse::<usize>(),
                        "bad Content-Length:"
                    );
                }
            }
        }
    }

    /// `false` on EOF in the middle of a body.
    fn read_body(&mut self, buf: &mut [u8], is_stopping: &impl Fn() -> bool) -> io::Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Ok(false),
                Ok(n) => offset += n,
                Err(e) if is_retryable(&e) => {
                    if is_stopping() {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Writing half of a channel.
pub struct DapWriter {
    writer: Box<dyn Write + Send>,
    tracer: Option<FileTracer>,
}

impl DapWriter {
    pub fn new(writer: impl Write + Send + 'static, tracer: Option<FileTracer>) -> Self {
        Self {
            writer: Box::new(writer),
            tracer,
        }
    }

    pub fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> io::Result<()> {
        let frame = encode(message)?;
        if let Some(tracer) = &self.tracer {
            if let Some(start) = frame.windows(4).position(|w| w == b"\r\n\r\n") {
                tracer.outbound(&frame[start + 4..]);
            }
        }
        self.writer.write_all(&frame)?;
        self.writer.flush()
    }

    pub fn tracer(&self) -> Option<&FileTracer> {
        self.tracer.as_ref()
    }
}

/// Bidirectional stream that can be split into a reader and a writer.
pub trait Duplex: Read + Write + Send + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
    fn set_poll_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Duplex for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.set_nodelay(true)?;
        self.try_clone()
    }

    fn set_poll_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

impl Duplex for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_poll_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

/// Split a socket into channel halves. The reader wakes up every [`POLL_INTERVAL`].
pub fn split<S: Duplex>(
    stream: S,
    tracer: Option<FileTracer>,
) -> io::Result<(DapReader<S>, DapWriter)> {
    let write_half = stream.try_clone_stream()?;
    stream.set_poll_timeout(Some(POLL_INTERVAL))?;
    Ok((
        DapReader::new(stream, tracer.clone()),
        DapWriter::new(write_half, tracer),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Reader handing out data in small chunks with timeouts in between.
    struct Chunked {
        chunks: VecDeque<Option<Vec<u8>>>,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Ok(0),
                Some(None) => Err(io::Error::new(ErrorKind::WouldBlock, "timeout")),
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn test_encode_exact_header() {
        let frame = encode(&json!({"text": "héllo"})).unwrap();
        let payload = r#"{"text":"héllo"}"#;
        let expected = format!("Content-Length: {}\r\n\r\n{payload}", payload.len());
        assert_eq!(payload.len(), 17);
        assert_eq!(frame, expected.into_bytes());
    }

    #[test]
    fn test_decode_sequence_and_eof() {
        let mut data = encode(&json!({"seq": 1, "arguments": {"a": [1, 2]}})).unwrap();
        data.extend(b"X-Custom: 1\r\n");
        data.extend(encode(&json!("ünïcode")).unwrap());
        let mut reader = DapReader::new(Cursor::new(data), None);
        assert_eq!(
            reader.read_message().unwrap(),
            Inbound::Message(json!({"seq": 1, "arguments": {"a": [1, 2]}}))
        );
        assert_eq!(
            reader.read_message().unwrap(),
            Inbound::Message(json!("ünïcode"))
        );
        assert_eq!(reader.read_message().unwrap(), Inbound::Disconnected);
    }

    #[test]
    fn test_missing_content_length_is_skipped() {
        let mut data = b"Content-Type: application/json\r\n\r\n".to_vec();
        data.extend(encode(&json!({"ok": true})).unwrap());
        let mut reader = DapReader::new(Cursor::new(data), None);
        assert_eq!(
            reader.read_message().unwrap(),
            Inbound::Message(json!({"ok": true}))
        );
    }

    #[test]
    fn test_malformed_json_is_skipped() {
        let mut data = b"Content-Length: 3\r\n\r\n{x}".to_vec();
        data.extend(encode(&json!(5)).unwrap());
        let mut reader = DapReader::new(Cursor::new(data), None);
        assert_eq!(reader.read_message().unwrap(), Inbound::Message(json!(5)));
    }

    #[test]
    fn test_fragmented_input_with_timeouts() {
        let frame = encode(&json!({"command": "threads"})).unwrap();
        let (a, b) = frame.split_at(7);
        let (b, c) = b.split_at(20);
        let chunked = Chunked {
            chunks: VecDeque::from(vec![
                Some(a.to_vec()),
                None,
                Some(b.to_vec()),
                None,
                Some(c.to_vec()),
            ]),
        };
        let mut reader = DapReader::new(chunked, None);
        assert_eq!(
            reader.read_message_until(|| false).unwrap(),
            Inbound::Message(json!({"command": "threads"}))
        );
    }

    #[test]
    fn test_stop_flag_interrupts_read() {
        let chunked = Chunked {
            chunks: VecDeque::from(vec![Some(b"Content-Le".to_vec()), None, None]),
        };
        let mut reader = DapReader::new(chunked, None);
        assert_eq!(
            reader.read_message_until(|| true).unwrap(),
            Inbound::Disconnected
        );
    }

    #[test]
    fn test_oversized_content_length_is_rejected() {
        let data = b"Content-Length: 18446744073709551615\r\n\r\n{}".to_vec();
        let mut reader = DapReader::new(Cursor::new(data), None);
        let err = reader.read_message().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let data = format!("Content-Length: {}\r\n\r\n{{}}", MAX_MESSAGE_SIZE + 1);
        let mut reader = DapReader::new(Cursor::new(data.into_bytes()), None);
        assert!(reader.read_message().is_err());
    }

    #[test]
    fn test_eof_inside_body() {
        let mut reader = DapReader::new(Cursor::new(b"Content-Length: 10\r\n\r\n{\"a\"".to_vec()), None);
        assert_eq!(reader.read_message().unwrap(), Inbound::Disconnected);
    }

    #[test]
    fn test_writer_frames_messages() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let mut writer = DapWriter::new(left, None);
        writer.write_message(&json!({"event": "initialized"})).unwrap();
        drop(writer);
        let mut received = vec![];
        right.read_to_end(&mut received).unwrap();
        let mut reader = DapReader::new(Cursor::new(received), None);
        assert_eq!(
            reader.read_message().unwrap(),
            Inbound::Message(json!({"event": "initialized"}))
        );
    }

    #[test]
    fn test_split_traces_both_directions() {
        let path = std::env::temp_dir().join(format!("stalker-dap-split-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let tracer = FileTracer::new(&path).unwrap().for_channel("ext");
        let (left, mut right) = UnixStream::pair().unwrap();
        let (mut reader, mut writer) = split(left, Some(tracer)).unwrap();
        assert!(writer.tracer().is_some());

        writer.write_message(&json!({"seq": 1})).unwrap();
        right.write_all(&encode(&json!({"seq": 2})).unwrap()).unwrap();
        assert_eq!(reader.read_message().unwrap(), Inbound::Message(json!({"seq": 2})));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "[ext] -> {\"seq\":1}\n[ext] <- {\"seq\":2}\n");
        let _ = std::fs::remove_file(&path);
    }
}
