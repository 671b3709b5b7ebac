use crate::engine::sim::program::{decode_hex, FunctionSpec};
use crate::engine::{Address, EngineError, EngineResult, Instruction};
use capstone::prelude::*;
use lru::LruCache;
use std::cell::RefCell;
use std::num::NonZeroUsize;

const CACHE_SIZE: usize = 128;

/// Decode function bodies of a simulated program.
///
/// Functions with machine code go through capstone (x86-64, Intel syntax). Functions described only
/// by a line table get one `nop` pseudo instruction per line entry.
pub struct Disassembler {
    cs: Capstone,
    cache: RefCell<LruCache<Address, Vec<Instruction>>>,
}

impl Disassembler {
    pub fn new() -> EngineResult<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build()
            .map_err(|e| EngineError::new(format!("disassembler init: {e}")))?;
        Ok(Self {
            cs,
            cache: RefCell::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    /// All instructions of a function.
    pub fn function(&self, func: &FunctionSpec) -> Vec<Instruction> {
        let mut cache = self.cache.borrow_mut();
        cache
            .get_or_insert(func.start, || self.decode_function(func))
            .clone()
    }

    fn decode_function(&self, func: &FunctionSpec) -> Vec<Instruction> {
        let code = func
            .code
            .as_deref()
            .and_then(|c| crate::weak_error!(decode_hex(c), "bad function code:"));
        match code {
            Some(code) if !code.is_empty() => self.decode(&code, func.start, func),
            _ => Self::pseudo(func),
        }
    }

    fn decode(&self, code: &[u8], base: Address, func: &FunctionSpec) -> Vec<Instruction> {
        let insns = match self.cs.disasm_all(code, base) {
            Ok(insns) => insns,
            Err(e) => {
                log::warn!(target: "engine", "disassemble {}: {e}", func.name);
                return Self::pseudo(func);
            }
        };
        insns
            .iter()
            .map(|insn| Instruction {
                address: insn.address(),
                bytes: insn.bytes().to_vec(),
                mnemonic: insn.mnemonic().unwrap_or_default().to_string(),
                operands: insn.op_str().unwrap_or_default().to_string(),
                comment: None,
            })
            .collect()
    }

    fn pseudo(func: &FunctionSpec) -> Vec<Instruction> {
        let end = func.end();
        let mut starts: Vec<Address> = func.lines.iter().map(|(_, a)| *a).collect();
        if starts.first() != Some(&func.start) {
            starts.insert(0, func.start);
        }
        starts.dedup();
        starts
            .iter()
            .enumerate()
            .map(|(i, &address)| {
                let next = starts.get(i + 1).copied().unwrap_or(end);
                let len = next.saturating_sub(address).max(1) as usize;
                Instruction {
                    address,
                    bytes: vec![0x90; len],
                    mnemonic: "nop".to_string(),
                    operands: String::new(),
                    comment: func
                        .line_entry_at(address)
                        .map(|le| format!("{}:{}", le.file, le.line)),
                }
            })
            .collect()
    }
}
