use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Raw protocol traffic recorder, one line per message.
///
/// Inbound messages are prefixed with `<-`, outbound with `->`. Shared by the reader and the
/// writer half of every channel of a session.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
    channel: &'static str,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            channel: "dap",
        })
    }

    /// Same file, different channel tag.
    pub fn for_channel(&self, channel: &'static str) -> Self {
        Self {
            file: self.file.clone(),
            channel,
        }
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "[{}] {text}", self.channel);
        }
    }

    pub fn inbound(&self, payload: &[u8]) {
        self.line(&format!("<- {}", String::from_utf8_lossy(payload)));
    }

    pub fn outbound(&self, payload: &[u8]) {
        self.line(&format!("-> {}", String::from_utf8_lossy(payload)));
    }
}
