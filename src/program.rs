// Copyright (c) 2017-2021 Fabian Schuiki

//! Decoded instructions and entry points.
//!
//! A `Program` is the input to every analysis in this crate. It holds the
//! instructions of a code image as delivered by a decoder, reduced to what
//! control flow recovery needs: the address, size, control-transfer category,
//! and resolved target of each instruction. Entry points name the addresses at
//! which execution may begin.

use crate::table::DenseTable;
use serde::Serialize;
use std::{collections::HashMap, fmt, ops::Index};

/// A resolved numeric address in the code image.
pub type Address = u32;

impl_table_key! {
    /// An instruction in a `Program`.
    struct Inst(u32) as "i";
}

/// The control-transfer category of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    /// A conditional branch (BCC, BCS, BEQ, BNE, BMI, BPL, BVC, BVS).
    Branch,
    /// An unconditional jump (JMP).
    Jump,
    /// A subroutine call (JSR).
    Call,
    /// A return, interrupt return, or break (RTS, RTI, BRK).
    Return,
    /// Any instruction that does not transfer control.
    Other,
}

impl Opcode {
    /// Check whether this opcode ends a basic block.
    pub fn is_terminator(self) -> bool {
        self != Opcode::Other
    }

    /// Check whether execution may continue with the next instruction.
    pub fn falls_through(self) -> bool {
        match self {
            Opcode::Branch | Opcode::Call | Opcode::Other => true,
            Opcode::Jump | Opcode::Return => false,
        }
    }

    /// Check whether this opcode carries a target address operand.
    pub fn has_target(self) -> bool {
        match self {
            Opcode::Branch | Opcode::Jump | Opcode::Call => true,
            Opcode::Return | Opcode::Other => false,
        }
    }

    /// Parse an opcode category from its textual name.
    pub fn from_name(name: &str) -> Option<Opcode> {
        Some(match name {
            "branch" => Opcode::Branch,
            "jump" => Opcode::Jump,
            "call" => Opcode::Call,
            "return" => Opcode::Return,
            "other" => Opcode::Other,
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Opcode::Branch => "branch",
                Opcode::Jump => "jump",
                Opcode::Call => "call",
                Opcode::Return => "return",
                Opcode::Other => "other",
            }
        )
    }
}

/// A single decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstData {
    /// The address of the first byte of the instruction.
    pub address: Address,
    /// The control-transfer category.
    pub opcode: Opcode,
    /// The resolved target of a branch, jump, or call. `None` if the target is
    /// unknown, e.g. for indirect jumps.
    pub target: Option<Address>,
    /// The size of the instruction in bytes.
    pub size: u32,
    /// The label attached to the instruction, if any.
    pub label: Option<String>,
    /// The instruction's assembly text, carried along for dumps.
    pub text: Option<String>,
}

impl InstData {
    /// Create a new instruction without target, label, or text.
    pub fn new(address: Address, opcode: Opcode, size: u32) -> Self {
        Self {
            address,
            opcode,
            target: None,
            size,
            label: None,
            text: None,
        }
    }

    /// Set the resolved target address.
    pub fn with_target(mut self, target: Address) -> Self {
        self.target = Some(target);
        self
    }

    /// Attach a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach the assembly text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// The address immediately after this instruction.
    pub fn next_address(&self) -> Address {
        self.address.wrapping_add(self.size)
    }
}

/// The hardware vector an interrupt entry point was taken from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Interrupt {
    Nmi,
    Reset,
    Irq,
}

/// How an entry point was discovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EntryKind {
    /// An exported symbol.
    Exported,
    /// An interrupt vector.
    Interrupt(Interrupt),
    /// The target of a subroutine call.
    CallTarget,
    /// An entry of a jump table.
    JumpTable,
}

impl EntryKind {
    /// Check whether an entry point of this kind begins a function.
    ///
    /// Jump table entries seed reachability and block boundaries but are
    /// considered part of the function that dispatches through the table.
    pub fn starts_function(self) -> bool {
        match self {
            EntryKind::Exported | EntryKind::Interrupt(_) | EntryKind::CallTarget => true,
            EntryKind::JumpTable => false,
        }
    }

    /// Parse an entry kind from its textual name.
    pub fn from_name(name: &str) -> Option<EntryKind> {
        Some(match name {
            "exported" => EntryKind::Exported,
            "interrupt-nmi" => EntryKind::Interrupt(Interrupt::Nmi),
            "interrupt-reset" => EntryKind::Interrupt(Interrupt::Reset),
            "interrupt-irq" => EntryKind::Interrupt(Interrupt::Irq),
            "call" => EntryKind::CallTarget,
            "jumptable" => EntryKind::JumpTable,
            _ => return None,
        })
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryKind::Exported => write!(f, "exported"),
            EntryKind::Interrupt(Interrupt::Nmi) => write!(f, "interrupt-nmi"),
            EntryKind::Interrupt(Interrupt::Reset) => write!(f, "interrupt-reset"),
            EntryKind::Interrupt(Interrupt::Irq) => write!(f, "interrupt-irq"),
            EntryKind::CallTarget => write!(f, "call"),
            EntryKind::JumpTable => write!(f, "jumptable"),
        }
    }
}

/// An address at which execution may begin.
///
/// At least one of `name` and `address` should be present. A name without an
/// address is resolved through the instruction labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    pub name: Option<String>,
    pub address: Option<Address>,
    pub kind: EntryKind,
}

impl EntryPoint {
    /// Create an entry point at a known address.
    pub fn at(address: Address, kind: EntryKind) -> Self {
        Self {
            name: None,
            address: Some(address),
            kind,
        }
    }

    /// Create an entry point referring to a label.
    pub fn named(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: Some(name.into()),
            address: None,
            kind,
        }
    }
}

/// A code image as a sequence of decoded instructions plus entry points.
#[derive(Debug, Clone, Default)]
pub struct Program {
    insts: DenseTable<Inst, InstData>,
    entries: Vec<EntryPoint>,
    by_address: HashMap<Address, Inst>,
    by_label: HashMap<String, Inst>,
}

impl Program {
    /// Create a program from decoded instructions and entry points.
    ///
    /// Instructions are ordered by address. Zero-sized instructions and
    /// duplicate addresses (keeping the first occurrence) are dropped.
    pub fn new(mut insts: Vec<InstData>, entries: Vec<EntryPoint>) -> Self {
        insts.sort_by_key(|i| i.address);
        let mut prog = Program {
            entries,
            ..Default::default()
        };
        for data in insts {
            if data.size == 0 || prog.by_address.contains_key(&data.address) {
                debug!("Dropping instruction at ${:04X}", data.address);
                continue;
            }
            let address = data.address;
            let label = data.label.clone();
            let inst = prog.insts.add(data);
            prog.by_address.insert(address, inst);
            if let Some(label) = label {
                prog.by_label.entry(label).or_insert(inst);
            }
        }
        prog
    }

    /// Return the number of instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Check whether the program contains no instructions.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Return an iterator over all instructions in address order.
    pub fn insts(&self) -> impl Iterator<Item = Inst> + Clone {
        self.insts.keys()
    }

    /// Return the entry points.
    pub fn entries(&self) -> &[EntryPoint] {
        &self.entries
    }

    /// Get the instruction starting at an address.
    pub fn inst_at(&self, address: Address) -> Option<Inst> {
        self.by_address.get(&address).cloned()
    }

    /// Get the instruction carrying a label.
    pub fn label(&self, name: &str) -> Option<Inst> {
        self.by_label.get(name).cloned()
    }

    /// Get the instruction starting right after another one.
    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.inst_at(self[inst].next_address())
    }

    /// Get the instruction targeted by a branch, jump, or call.
    pub fn target_inst(&self, inst: Inst) -> Option<Inst> {
        let data = &self[inst];
        if !data.opcode.has_target() {
            return None;
        }
        data.target.and_then(|addr| self.inst_at(addr))
    }

    /// Map an entry point to its first instruction.
    pub fn resolve_entry(&self, entry: &EntryPoint) -> Option<Inst> {
        match entry.address {
            Some(addr) => self.inst_at(addr),
            None => entry.name.as_ref().and_then(|name| self.label(name)),
        }
    }

    /// Find a display name for an entry point.
    pub fn entry_name(&self, entry: &EntryPoint) -> Option<String> {
        entry.name.clone().or_else(|| {
            self.resolve_entry(entry)
                .and_then(|inst| self[inst].label.clone())
        })
    }
}

impl Index<Inst> for Program {
    type Output = InstData;

    fn index(&self, idx: Inst) -> &InstData {
        &self.insts[idx]
    }
}
