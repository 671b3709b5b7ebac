//! Pseudo source files for machine code.
//!
//! A [`DisassembledRange`] covers one symbol (or a fixed window of instructions when no symbol
//! is known). Its text has two comment lines followed by one line per instruction, so line
//! `n >= 3` shows instruction `n - 3`.

use crate::dap::protocol::Source;
use crate::engine::{Address, Engine, Instruction, LineEntry};
use crate::session::handles::{Handle, HandleAllocator};
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::Write;
use std::rc::Rc;

pub const MIME_TYPE: &str = "text/x-lldb.disassembly";

/// Instruction bytes shown per line, longer encodings end with `>`.
const MAX_INSTR_BYTES: usize = 8;

/// Instructions decoded around a pc that has no symbol.
const NO_SYMBOL_WINDOW: usize = 32;

const HEADER_LINES: usize = 2;

#[derive(Debug)]
pub struct DisassembledRange {
    pub handle: Handle,
    pub start: Address,
    pub end: Address,
    pub source_name: String,
    description: String,
    line_entry: Option<LineEntry>,
    instructions: Vec<Instruction>,
    /// Address per text line, `None` for comment lines.
    addresses: Vec<Option<Address>>,
}

impl DisassembledRange {
    fn new(
        handle: Handle,
        source_name: String,
        description: String,
        line_entry: Option<LineEntry>,
        instructions: Vec<Instruction>,
    ) -> Option<Self> {
        let first = instructions.first()?;
        let last = instructions.last()?;
        let start = first.address;
        let end = last.address + last.bytes.len().max(1) as Address;
        let addresses = std::iter::repeat(None)
            .take(HEADER_LINES)
            .chain(instructions.iter().map(|i| Some(i.address)))
            .collect();
        Some(Self {
            handle,
            start,
            end,
            source_name,
            description,
            line_entry,
            instructions,
            addresses,
        })
    }

    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }

    /// 1-based text line of `address` (first line whose address is not below it).
    pub fn line_num_by_address(&self, address: Address) -> u32 {
        (self.addresses.partition_point(|a| *a < Some(address)) + 1) as u32
    }

    pub fn address_by_line_num(&self, line: u32) -> Option<Address> {
        let index = (line as usize).checked_sub(1)?;
        self.addresses.get(index).copied().flatten()
    }

    pub fn source(&self) -> Source {
        Source {
            name: Some(self.source_name.clone()),
            path: None,
            source_reference: Some(self.handle),
        }
    }

    pub fn source_text(&self) -> String {
        let location = match &self.line_entry {
            Some(entry) => entry.to_string(),
            None => "unknown".to_string(),
        };
        let mut lines = vec![
            format!("; {}", self.description),
            format!("; Source location: {location}"),
        ];
        for insn in &self.instructions {
            let mut dump = insn
                .bytes
                .iter()
                .take(MAX_INSTR_BYTES)
                .map(|b| format!("{b:02X} "))
                .join("");
            if insn.bytes.len() > MAX_INSTR_BYTES {
                dump.push('>');
            }
            let mut line = String::new();
            let _ = write!(
                line,
                "{:08X}: {:<width$} {:<6} {}",
                insn.address,
                dump,
                insn.mnemonic,
                insn.operands,
                width = MAX_INSTR_BYTES * 3 + 2
            );
            if let Some(comment) = insn.comment.as_deref().filter(|c| !c.is_empty()) {
                let _ = write!(line, "  ; {comment}");
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Disassembled ranges of a session, kept for the session lifetime.
pub struct AddressSpace {
    allocator: HandleAllocator,
    /// Sorted by start address, ranges never overlap.
    ranges: Vec<Rc<DisassembledRange>>,
    by_handle: HashMap<Handle, Rc<DisassembledRange>>,
}

impl AddressSpace {
    pub fn new(allocator: HandleAllocator) -> Self {
        Self {
            allocator,
            ranges: vec![],
            by_handle: HashMap::new(),
        }
    }

    pub fn find_by_address(&self, address: Address) -> Option<Rc<DisassembledRange>> {
        let idx = self.ranges.partition_point(|r| r.start <= address);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        range.contains(address).then(|| range.clone())
    }

    pub fn find_by_handle(&self, handle: Handle) -> Option<Rc<DisassembledRange>> {
        self.by_handle.get(&handle).cloned()
    }

    /// Range covering `address`, disassembling the enclosing symbol on first use.
    pub fn from_address(
        &mut self,
        engine: &dyn Engine,
        address: Address,
    ) -> Option<Rc<DisassembledRange>> {
        if let Some(range) = self.find_by_address(address) {
            return Some(range);
        }

        let (source_name, description, instructions) = match engine.symbol_at(address) {
            Some(symbol) => (
                format!("{} @{:x}", symbol.name, symbol.start),
                symbol.description.clone(),
                engine.instructions(symbol.start, symbol.end),
            ),
            None => (
                format!("@{address:x}"),
                "No symbol info".to_string(),
                engine.read_instructions(address, NO_SYMBOL_WINDOW),
            ),
        };
        let start = instructions.first()?.address;
        let line_entry = engine.line_entry_at(start);

        let handle = self.allocator.next();
        let range = Rc::new(DisassembledRange::new(
            handle,
            source_name,
            description,
            line_entry,
            instructions,
        )?);
        if self
            .ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
        {
            log::warn!(target: "session", "disassembly of {} overlaps a known range", range.source_name);
        }
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(idx, range.clone());
        self.by_handle.insert(handle, range.clone());
        log::debug!(target: "session", "disassembled {} as source {handle}", range.source_name);
        Some(range)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::sim::program::Program;
    use crate::engine::sim::SimEngine;

    fn insn(address: Address, bytes: &[u8], mnemonic: &str, operands: &str) -> Instruction {
        Instruction {
            address,
            bytes: bytes.to_vec(),
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            comment: None,
        }
    }

    fn range() -> DisassembledRange {
        let mut call = insn(0x1004, &[0xe8, 0, 0, 0, 0], "call", "0x2000");
        call.comment = Some("helper".to_string());
        DisassembledRange::new(
            1000,
            "main @1000".to_string(),
            "id = {0x00001000}, name=\"main\"".to_string(),
            Some(LineEntry {
                file: "/src/main.c".to_string(),
                line: 10,
                column: 0,
            }),
            vec![
                insn(0x1000, &[0x55], "push", "rbp"),
                call,
                insn(0x1009, &[0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8], "movabs", "rax, 0x807060504030201"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_line_address_mapping() {
        let range = range();
        assert_eq!((range.start, range.end), (0x1000, 0x1013));
        assert_eq!(range.line_num_by_address(0x1000), 3);
        assert_eq!(range.line_num_by_address(0x1004), 4);
        assert_eq!(range.line_num_by_address(0x1009), 5);
        assert_eq!(range.address_by_line_num(4), Some(0x1004));
        assert_eq!(range.address_by_line_num(1), None);
        assert_eq!(range.address_by_line_num(0), None);
        assert_eq!(range.address_by_line_num(6), None);
    }

    #[test]
    fn test_source_text() {
        let text = range().source_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "; id = {0x00001000}, name=\"main\"");
        assert_eq!(lines[1], "; Source location: /src/main.c:10");
        assert_eq!(
            lines[2],
            "00001000: 55                         push   rbp"
        );
        assert_eq!(
            lines[3],
            "00001004: E8 00 00 00 00             call   0x2000  ; helper"
        );
        assert!(lines[4].starts_with("00001009: 48 B8 01 02 03 04 05 06 >  movabs rax"));
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn test_address_space_cache() {
        let program = Program::parse(
            r#"
[[function]]
name = "main"
file = "/src/main.c"
start = 0x1000
lines = [[10, 0x1000], [11, 0x1004], [12, 0x1008]]
"#,
        )
        .unwrap();
        let engine = SimEngine::with_program(program);
        let allocator = HandleAllocator::default();
        let mut space = AddressSpace::new(allocator.clone());

        let first = space.from_address(&engine, 0x1004).unwrap();
        assert_eq!(first.source_name, "main @1000");
        let again = space.from_address(&engine, 0x1008).unwrap();
        assert_eq!(first.handle, again.handle);
        assert_eq!(space.find_by_handle(first.handle).unwrap().start, 0x1000);

        let unknown = space.from_address(&engine, 0x9000).unwrap();
        assert_eq!(unknown.source_name, "@9000");
        assert!(unknown.source_text().starts_with("; No symbol info\n; Source location: unknown"));
        assert!(unknown.handle > first.handle);
        assert!(allocator.next() > unknown.handle);
        assert!(space.find_by_address(0x0fff).is_none());
    }
}
