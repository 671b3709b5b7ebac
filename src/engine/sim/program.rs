//! TOML description of a simulated debuggee.
//!
//! ```toml
//! exit_code = 0
//!
//! [[function]]
//! name = "main"
//! file = "/src/main.c"
//! start = 0x401000
//! lines = [[10, 0x401000], [11, 0x401004]]
//!
//! [[step]]
//! stack = ["main:10"]
//! stdout = "hello\n"
//! [[step.locals]]
//! name = "x"
//! type = "int"
//! value = 5
//! ```

use crate::engine::{Address, EngineError, EngineResult, LineEntry, ThreadId};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_THREAD: ThreadId = 1;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Program {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, rename = "function")]
    pub functions: Vec<FunctionSpec>,
    #[serde(default, rename = "thread")]
    pub threads: Vec<ThreadSpec>,
    #[serde(default, rename = "static")]
    pub statics: Vec<ValueSpec>,
    #[serde(default, rename = "step")]
    pub trace: Vec<TraceEntry>,
    /// Shared libraries reported as loaded on launch.
    #[serde(default)]
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub file: Option<String>,
    pub start: Address,
    #[serde(default)]
    pub size: Option<u64>,
    /// `(line, address)` pairs in address order.
    #[serde(default)]
    pub lines: Vec<(u32, Address)>,
    /// Machine code as hex string, decoded as x86-64.
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSpec {
    pub id: ThreadId,
    #[serde(default)]
    pub name: Option<String>,
    /// Call stack shown while another thread owns the stop, innermost first.
    #[serde(default)]
    pub stack: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceEntry {
    #[serde(default)]
    pub thread: Option<ThreadId>,
    /// Innermost first, each item is `function`, `function:line` or `0xADDR`.
    pub stack: Vec<String>,
    #[serde(default)]
    pub locals: Vec<ValueSpec>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub value: Option<toml::Value>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub children: Vec<ValueSpec>,
    /// Children are a formatter view, `raw` holds the real layout.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default)]
    pub raw: Vec<ValueSpec>,
}

/// Parsed stack item.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Function { name: String, line: Option<u32> },
    Address(Address),
}

impl Location {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x") {
            let addr = Address::from_str_radix(hex, 16)
                .map_err(|e| EngineError::new(format!("bad address `{text}`: {e}")))?;
            return Ok(Location::Address(addr));
        }
        match text.split_once(':') {
            Some((name, line)) => {
                let line = line
                    .parse()
                    .map_err(|e| EngineError::new(format!("bad line in `{text}`: {e}")))?;
                Ok(Location::Function {
                    name: name.to_string(),
                    line: Some(line),
                })
            }
            None => Ok(Location::Function {
                name: text.to_string(),
                line: None,
            }),
        }
    }
}

impl FunctionSpec {
    pub fn end(&self) -> Address {
        if let Some(size) = self.size {
            return self.start + size;
        }
        if let Some(code) = self.code.as_deref().and_then(|c| decode_hex(c).ok()) {
            if !code.is_empty() {
                return self.start + code.len() as u64;
            }
        }
        match self.lines.last() {
            Some((_, addr)) => addr + 4,
            None => self.start + 16,
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn address_of_line(&self, line: u32) -> Option<Address> {
        self.lines.iter().find(|(l, _)| *l == line).map(|(_, a)| *a)
    }

    pub fn line_entry_at(&self, address: Address) -> Option<LineEntry> {
        let file = self.file.as_ref()?;
        let (line, _) = self
            .lines
            .iter()
            .take_while(|(_, a)| *a <= address)
            .last()?;
        Some(LineEntry {
            file: file.clone(),
            line: *line,
            column: 0,
        })
    }
}

impl Program {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| EngineError::new(format!("{}: {e}", path.display())))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> EngineResult<Self> {
        let mut program: Program = toml::de::from_str(data)
            .map_err(|e| EngineError::new(format!("invalid program description: {e}")))?;
        if program.threads.is_empty() {
            program.threads.push(ThreadSpec {
                id: DEFAULT_THREAD,
                name: Some("main".to_string()),
                stack: vec![],
            });
        }
        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> EngineResult<()> {
        for entry in &self.trace {
            if entry.stack.is_empty() {
                return Err(EngineError::new("trace step with empty stack"));
            }
            for item in &entry.stack {
                self.resolve(&Location::parse(item)?)?;
            }
            if let Some(tid) = entry.thread {
                if !self.threads.iter().any(|t| t.id == tid) {
                    return Err(EngineError::new(format!("unknown thread {tid} in trace")));
                }
            }
        }
        Ok(())
    }

    pub fn main_thread(&self) -> ThreadId {
        self.threads.first().map(|t| t.id).unwrap_or(DEFAULT_THREAD)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_at(&self, address: Address) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.contains(address))
    }

    /// Program counter of a stack item.
    pub fn resolve(&self, location: &Location) -> EngineResult<Address> {
        match location {
            Location::Address(addr) => Ok(*addr),
            Location::Function { name, line } => {
                let func = self
                    .function(name)
                    .ok_or_else(|| EngineError::new(format!("unknown function `{name}`")))?;
                match line {
                    None => Ok(func.start),
                    Some(line) => func.address_of_line(*line).ok_or_else(|| {
                        EngineError::new(format!("function `{name}` has no line {line}"))
                    }),
                }
            }
        }
    }

    pub fn line_entry_at(&self, address: Address) -> Option<LineEntry> {
        self.function_at(address)?.line_entry_at(address)
    }
}

pub fn decode_hex(text: &str) -> EngineResult<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(EngineError::new("odd number of hex digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| EngineError::new("invalid hex digit"))
        })
        .collect()
}
