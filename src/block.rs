// Copyright (c) 2017-2021 Fabian Schuiki

//! Basic block construction.
//!
//! Partitions the reachable instructions of a program into straight-line
//! basic blocks. A block starts at a leader and extends forward until it hits a
//! control-transfer instruction or the next leader. Leaders are
//!
//! - the first reachable instruction,
//! - every entry point,
//! - every labeled instruction,
//! - every branch, jump, and call target,
//! - every instruction following a branch or call.
//!
//! Blocks are numbered in ascending address order.

use crate::{
    analysis::Reachability,
    program::{Address, Inst, Opcode, Program},
    table::{DenseTable, TableKey},
    util::write_implode,
};
use hibitset::BitSet;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    ops::Index,
};

impl_table_key! {
    /// A basic block.
    struct Block(u32) as "bb";
}

/// A straight-line sequence of instructions with a single entry.
#[derive(Debug, Clone, Serialize)]
pub struct BasicBlockData {
    /// The first instruction.
    pub leader: Inst,
    /// The last instruction.
    pub last: Inst,
    /// All instructions in execution order.
    pub insts: Vec<Inst>,
    /// Address of the first instruction.
    pub start: Address,
    /// Address of the last instruction.
    pub end: Address,
    /// Category of the last instruction.
    pub term: Opcode,
    /// The block executed next if control falls off the end.
    pub fallthrough: Option<Block>,
    /// The blocks explicitly targeted by the last instruction. For calls this
    /// is the callee, which is not a control-flow successor.
    pub targets: BTreeSet<Block>,
    /// The target operand of the last instruction, as decoded.
    pub target_address: Option<Address>,
    /// Whether the last instruction transfers control to an unknown target.
    pub unresolved: bool,
}

/// The basic blocks of a program.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BasicBlocks {
    blocks: DenseTable<Block, BasicBlockData>,
    #[serde(skip)]
    inst_block: HashMap<Inst, Block>,
    #[serde(skip)]
    by_address: HashMap<Address, Block>,
}

impl BasicBlocks {
    /// Partition the reachable instructions of a program into blocks.
    pub fn new(prog: &Program, reach: &Reachability) -> Self {
        let reachable: Vec<Inst> = prog.insts().filter(|&i| reach.is_reachable(i)).collect();
        let mut result = Self::default();
        if reachable.is_empty() {
            debug!("No reachable instructions, no blocks");
            return result;
        }

        // Determine the leaders.
        let mut leaders = BitSet::with_capacity(prog.len() as u32);
        let mut mark = |inst: Option<Inst>| {
            if let Some(inst) = inst {
                if reach.is_reachable(inst) {
                    leaders.add(inst.index() as u32);
                }
            }
        };
        mark(reachable.first().cloned());
        for entry in prog.entries() {
            mark(prog.resolve_entry(entry));
        }
        for &inst in &reachable {
            let data = &prog[inst];
            if data.label.is_some() {
                mark(Some(inst));
            }
            if data.opcode == Opcode::Branch || data.opcode == Opcode::Call {
                mark(prog.next_inst(inst));
            }
            mark(prog.target_inst(inst));
        }
        let is_leader = |inst: Inst| leaders.contains(inst.index() as u32);

        // Walk forward from each leader.
        for &leader in reachable.iter().filter(|&&i| is_leader(i)) {
            let mut insts = vec![leader];
            let mut last = leader;
            while !prog[last].opcode.is_terminator() {
                match prog.next_inst(last) {
                    Some(next) if reach.is_reachable(next) && !is_leader(next) => {
                        insts.push(next);
                        last = next;
                    }
                    _ => break,
                }
            }
            let bb = result.blocks.add(BasicBlockData {
                leader,
                last,
                start: prog[leader].address,
                end: prog[last].address,
                term: prog[last].opcode,
                insts,
                fallthrough: None,
                targets: BTreeSet::new(),
                target_address: None,
                unresolved: false,
            });
            for &inst in &result.blocks[bb].insts {
                result.inst_block.insert(inst, bb);
            }
            result.by_address.insert(prog[leader].address, bb);
        }

        // Link the blocks.
        let ids: Vec<Block> = result.blocks.keys().collect();
        for bb in ids {
            let last = result.blocks[bb].last;
            let term = prog[last].opcode;
            let fallthrough = if term.falls_through() {
                prog.next_inst(last)
                    .and_then(|next| result.inst_block.get(&next).cloned())
            } else {
                None
            };
            let target = prog
                .target_inst(last)
                .and_then(|t| result.inst_block.get(&t).cloned());
            let unresolved = term.has_target() && target.is_none();
            if unresolved {
                trace!(
                    "{} ends in {} to unknown target at ${:04X}",
                    bb,
                    term,
                    prog[last].address
                );
            }
            let data = &mut result.blocks[bb];
            data.fallthrough = fallthrough;
            data.targets.extend(target);
            data.target_address = prog[last].target.filter(|_| term.has_target());
            data.unresolved = unresolved;
        }

        debug!(
            "Partitioned {} reachable instructions into {} blocks",
            reachable.len(),
            result.blocks.len()
        );
        result
    }

    /// Return the number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Return an iterator over all blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + Clone {
        self.blocks.keys()
    }

    /// Get the block containing an instruction.
    pub fn block_of(&self, inst: Inst) -> Option<Block> {
        self.inst_block.get(&inst).cloned()
    }

    /// Get the block starting at an address.
    pub fn block_at(&self, address: Address) -> Option<Block> {
        self.by_address.get(&address).cloned()
    }
}

impl Index<Block> for BasicBlocks {
    type Output = BasicBlockData;

    fn index(&self, idx: Block) -> &BasicBlockData {
        &self.blocks[idx]
    }
}

impl fmt::Display for BasicBlocks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (bb, data) in self.blocks.iter() {
            write!(
                f,
                "{} ${:04X}..${:04X} ({} insts, {})",
                bb,
                data.start,
                data.end,
                data.insts.len(),
                data.term
            )?;
            if let Some(ft) = data.fallthrough {
                write!(f, " fall {}", ft)?;
            }
            if !data.targets.is_empty() {
                write!(f, " target ")?;
                write_implode(f, ", ", data.targets.iter())?;
            }
            if data.unresolved {
                write!(f, " target ?")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{EntryKind, EntryPoint, InstData};

    fn build(insts: Vec<InstData>) -> (Program, BasicBlocks) {
        let entry = insts[0].address;
        let prog = Program::new(insts, vec![EntryPoint::at(entry, EntryKind::Exported)]);
        let reach = Reachability::new(&prog);
        let blocks = BasicBlocks::new(&prog, &reach);
        (prog, blocks)
    }

    #[test]
    fn straight_line() {
        let (_, blocks) = build(vec![
            InstData::new(0x8000, Opcode::Other, 2),
            InstData::new(0x8002, Opcode::Other, 3),
            InstData::new(0x8005, Opcode::Return, 1),
        ]);
        assert_eq!(blocks.len(), 1);
        let bb = blocks.blocks().next().unwrap();
        assert_eq!(blocks[bb].insts.len(), 3);
        assert_eq!(blocks[bb].fallthrough, None);
        assert!(blocks[bb].targets.is_empty());
    }

    #[test]
    fn split_at_branch_and_target() {
        let (_, blocks) = build(vec![
            InstData::new(0x8000, Opcode::Other, 2),
            InstData::new(0x8002, Opcode::Branch, 2).with_target(0x8006),
            InstData::new(0x8004, Opcode::Other, 2),
            InstData::new(0x8006, Opcode::Other, 3),
            InstData::new(0x8009, Opcode::Return, 1),
        ]);
        let bbs: Vec<_> = blocks.blocks().collect();
        assert_eq!(bbs.len(), 3);
        assert_eq!(blocks[bbs[0]].fallthrough, Some(bbs[1]));
        assert!(blocks[bbs[0]].targets.contains(&bbs[2]));
        assert_eq!(blocks[bbs[1]].fallthrough, Some(bbs[2]));
        assert_eq!(blocks[bbs[2]].insts.len(), 2);
        assert_eq!(blocks.block_at(0x8006), Some(bbs[2]));
    }

    #[test]
    fn unknown_target_is_not_an_error() {
        let (_, blocks) = build(vec![
            InstData::new(0x8000, Opcode::Other, 2),
            InstData::new(0x8002, Opcode::Jump, 3),
        ]);
        let bb = blocks.blocks().next().unwrap();
        assert!(blocks[bb].unresolved);
        assert!(blocks[bb].targets.is_empty());
        assert_eq!(blocks[bb].target_address, None);
    }

    #[test]
    fn branch_into_operand_is_unresolved() {
        let (_, blocks) = build(vec![
            InstData::new(0x8000, Opcode::Branch, 2).with_target(0x8003),
            InstData::new(0x8002, Opcode::Other, 3),
            InstData::new(0x8005, Opcode::Return, 1),
        ]);
        let bb = blocks.block_at(0x8000).unwrap();
        assert!(blocks[bb].unresolved);
        assert_eq!(blocks[bb].target_address, Some(0x8003));
        assert_eq!(blocks[bb].fallthrough, blocks.block_at(0x8002));
    }
}
