// Copyright (c) 2017-2021 Fabian Schuiki

//! Control flow graphs.
//!
//! The program-wide CFG links basic blocks with edges whose kind follows from
//! the category of the block's last instruction. For every entry point that
//! starts a function, a `FunctionCfg` is induced by a breadth-first traversal
//! from the entry block. The traversal stops at returns and at jumps to the
//! entry of another function, which are recorded as tail calls.

use crate::{
    block::{BasicBlocks, Block},
    program::{Address, EntryKind, EntryPoint, Opcode, Program},
    table::{DenseTable, TableKey},
};
use hibitset::BitSet;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
};

/// The kind of a CFG edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EdgeKind {
    /// Taken branch of a conditional branch.
    True,
    /// Not-taken branch of a conditional branch.
    False,
    /// Unconditional jump.
    Unconditional,
    /// Fall through into the next block.
    FallThrough,
    /// Leave the function.
    Return,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EdgeKind::True => "TRUE",
                EdgeKind::False => "FALSE",
                EdgeKind::Unconditional => "UNCONDITIONAL",
                EdgeKind::FallThrough => "FALL_THROUGH",
                EdgeKind::Return => "RETURN",
            }
        )
    }
}

/// An edge in the control flow graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CfgEdge {
    pub from: Block,
    /// The destination block. `None` means the function is left.
    pub to: Option<Block>,
    pub kind: EdgeKind,
}

impl fmt::Display for CfgEdge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "{} -{}-> {}", self.from, self.kind, to),
            None => write!(f, "{} -{}-> exit", self.from, self.kind),
        }
    }
}

/// Compute the outgoing edges of a block from its terminator category.
///
/// Unknown targets produce no edge. Calls never produce an edge to the callee.
pub fn block_edges(blocks: &BasicBlocks, bb: Block) -> Vec<CfgEdge> {
    let data = &blocks[bb];
    let edge = |to, kind| CfgEdge { from: bb, to, kind };
    let mut edges = vec![];
    match data.term {
        Opcode::Branch => {
            edges.extend(data.targets.iter().map(|&t| edge(Some(t), EdgeKind::True)));
            edges.extend(data.fallthrough.map(|t| edge(Some(t), EdgeKind::False)));
        }
        Opcode::Jump => {
            edges.extend(
                data.targets
                    .iter()
                    .map(|&t| edge(Some(t), EdgeKind::Unconditional)),
            );
        }
        Opcode::Return => edges.push(edge(None, EdgeKind::Return)),
        Opcode::Call | Opcode::Other => {
            edges.extend(
                data.fallthrough
                    .map(|t| edge(Some(t), EdgeKind::FallThrough)),
            );
        }
    }
    edges
}

/// A jump or taken branch whose destination is not the start of a block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct UnresolvedTransfer {
    pub from: Block,
    /// `True` for a branch, `Unconditional` for a jump.
    pub kind: EdgeKind,
    /// Address of the jump or branch instruction.
    pub address: Address,
    /// The decoded target operand. `None` for indirect jumps.
    pub target: Option<Address>,
}

impl fmt::Display for UnresolvedTransfer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.target {
            Some(t) => write!(f, "${:04X} to ${:04X}", self.address, t),
            None => write!(f, "${:04X} to ?", self.address),
        }
    }
}

/// How control leaves a function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ExitKind {
    Return,
    /// A jump to the entry of another function.
    TailCall,
}

/// An edge that leaves a function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionExit {
    pub from: Block,
    pub kind: ExitKind,
    /// The entry of the callee of a tail call.
    pub callee: Option<Block>,
}

/// The control flow graph of a program, split into functions.
#[derive(Debug, Clone, Serialize)]
pub struct Cfg {
    edges: DenseTable<Block, Vec<CfgEdge>>,
    /// The functions, ordered by entry address.
    pub functions: Vec<FunctionCfg>,
    /// Function entry points that do not map to any block.
    pub unmapped: Vec<EntryPoint>,
    /// Blocks that belong to more than one function.
    pub shared: BTreeSet<Block>,
}

impl Cfg {
    /// Build the edge table and induce one subgraph per function entry.
    pub fn new(prog: &Program, blocks: &BasicBlocks) -> Self {
        let mut edges = DenseTable::new();
        for bb in blocks.blocks() {
            edges.add(block_edges(blocks, bb));
        }

        let mut seen = HashSet::new();
        let mut unmapped = vec![];
        let mut seeds = vec![];
        for entry in prog.entries().iter().filter(|e| e.kind.starts_function()) {
            let bb = prog.resolve_entry(entry).and_then(|i| blocks.block_of(i));
            match bb {
                Some(bb) => {
                    if seen.insert(bb) {
                        seeds.push((bb, prog.entry_name(entry), entry.kind));
                    }
                }
                None => {
                    debug!("Entry point {:?} maps to no block", entry);
                    unmapped.push(entry.clone());
                }
            }
        }
        seeds.sort_by_key(|&(bb, _, _)| blocks[bb].start);

        let functions: Vec<FunctionCfg> = seeds
            .into_iter()
            .map(|(entry, name, kind)| {
                FunctionCfg::induce(blocks, &edges, &seen, entry, name, kind)
            })
            .collect();

        let mut owners: HashMap<Block, usize> = HashMap::new();
        for func in &functions {
            for &bb in &func.blocks {
                *owners.entry(bb).or_insert(0) += 1;
            }
        }
        let shared: BTreeSet<Block> = owners
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .map(|(bb, _)| bb)
            .collect();
        debug!(
            "Built CFG with {} functions, {} unmapped entries, {} shared blocks",
            functions.len(),
            unmapped.len(),
            shared.len()
        );

        Self {
            edges,
            functions,
            unmapped,
            shared,
        }
    }

    /// Get the outgoing edges of a block.
    pub fn outgoing(&self, bb: Block) -> &[CfgEdge] {
        &self.edges[bb]
    }

    /// Return an iterator over all edges in the program.
    pub fn edges<'a>(&'a self) -> impl Iterator<Item = &'a CfgEdge> + 'a {
        self.edges.values().flat_map(|e| e.iter())
    }
}

/// The control flow subgraph reachable from one function entry.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCfg {
    /// The entry block.
    pub entry: Block,
    /// The address of the entry block.
    pub address: Address,
    pub name: Option<String>,
    pub kind: EntryKind,
    /// The blocks of the function in address order.
    pub blocks: Vec<Block>,
    outgoing: HashMap<Block, Vec<CfgEdge>>,
    /// Edges back into the entry from other blocks. Each of these is present
    /// in the function as a `Return` edge instead.
    pub reentries: Vec<CfgEdge>,
    /// Jumps to the entry of another function. Each of these is present in
    /// the function as an `Unconditional` edge leaving the function.
    pub tail_calls: Vec<CfgEdge>,
    /// Jumps and taken branches of the function's blocks with no known
    /// destination block.
    pub unresolved: Vec<UnresolvedTransfer>,
    /// Blocks within the address span of the function that are not reachable
    /// from its entry.
    pub unreachable_inside: Vec<Block>,
}

impl FunctionCfg {
    fn induce(
        blocks: &BasicBlocks,
        edges: &DenseTable<Block, Vec<CfgEdge>>,
        entries: &HashSet<Block>,
        entry: Block,
        name: Option<String>,
        kind: EntryKind,
    ) -> Self {
        let mut visited = BitSet::new();
        let mut queue = VecDeque::new();
        let mut outgoing = HashMap::new();
        let mut reentries = vec![];
        let mut tail_calls = vec![];
        visited.add(entry.index() as u32);
        queue.push_back(entry);

        while let Some(bb) = queue.pop_front() {
            let mut out = Vec::with_capacity(edges[bb].len());
            for &edge in &edges[bb] {
                if edge.to == Some(entry) && bb != entry {
                    trace!("Rewriting {} as function return", edge);
                    reentries.push(edge);
                    out.push(CfgEdge {
                        from: bb,
                        to: None,
                        kind: EdgeKind::Return,
                    });
                    continue;
                }
                let tail_call = edge.kind == EdgeKind::Unconditional
                    && edge.to != Some(entry)
                    && edge.to.map(|to| entries.contains(&to)).unwrap_or(false);
                if tail_call {
                    trace!("Cutting {} as tail call", edge);
                    tail_calls.push(edge);
                    out.push(CfgEdge { to: None, ..edge });
                    continue;
                }
                if let Some(to) = edge.to {
                    if !visited.add(to.index() as u32) {
                        queue.push_back(to);
                    }
                }
                out.push(edge);
            }
            outgoing.insert(bb, out);
        }

        let mut members: Vec<Block> = outgoing.keys().cloned().collect();
        members.sort();
        let unresolved = members
            .iter()
            .map(|&bb| (bb, &blocks[bb]))
            .filter(|(_, data)| data.unresolved && data.term != Opcode::Call)
            .map(|(bb, data)| UnresolvedTransfer {
                from: bb,
                kind: match data.term {
                    Opcode::Branch => EdgeKind::True,
                    _ => EdgeKind::Unconditional,
                },
                address: data.end,
                target: data.target_address,
            })
            .collect();
        let lo = members.iter().map(|&bb| blocks[bb].start).min();
        let hi = members.iter().map(|&bb| blocks[bb].end).max();
        let unreachable_inside = match (lo, hi) {
            (Some(lo), Some(hi)) => blocks
                .blocks()
                .filter(|bb| !outgoing.contains_key(bb))
                .filter(|&bb| blocks[bb].start >= lo && blocks[bb].start <= hi)
                .collect(),
            _ => vec![],
        };

        let address = blocks[entry].start;
        trace!(
            "Function {} at ${:04X} spans {} blocks",
            name.as_ref().map(|s| s.as_str()).unwrap_or("<anon>"),
            address,
            members.len()
        );
        Self {
            entry,
            address,
            name,
            kind,
            blocks: members,
            outgoing,
            reentries,
            tail_calls,
            unresolved,
            unreachable_inside,
        }
    }

    /// Check whether a block belongs to the function.
    pub fn contains(&self, bb: Block) -> bool {
        self.outgoing.contains_key(&bb)
    }

    /// Return the number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check whether the function has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get the outgoing edges of a block within the function.
    pub fn outgoing(&self, bb: Block) -> &[CfgEdge] {
        self.outgoing.get(&bb).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Get the concrete successors of a block within the function.
    pub fn succ(&self, bb: Block) -> impl Iterator<Item = Block> + Clone + '_ {
        self.outgoing(bb).iter().filter_map(|e| e.to)
    }

    /// Return an iterator over all edges in the function, grouped by source
    /// block in address order.
    pub fn edges<'a>(&'a self) -> impl Iterator<Item = &'a CfgEdge> + 'a {
        self.blocks
            .iter()
            .flat_map(move |&bb| self.outgoing(bb).iter())
    }

    /// Get the control transfers of a block as they were before reentry
    /// edges were rewritten.
    pub fn transfers(&self, bb: Block) -> Vec<CfgEdge> {
        let reentries: Vec<CfgEdge> = self
            .reentries
            .iter()
            .filter(|e| e.from == bb)
            .cloned()
            .collect();
        if reentries.is_empty() {
            return self.outgoing(bb).to_vec();
        }
        self.outgoing(bb)
            .iter()
            .filter(|e| e.kind != EdgeKind::Return)
            .cloned()
            .chain(reentries)
            .collect()
    }

    /// Get the callee of a tail call leaving from a block.
    pub fn tail_call(&self, bb: Block) -> Option<Block> {
        self.tail_calls
            .iter()
            .find(|e| e.from == bb)
            .and_then(|e| e.to)
    }

    /// Get the unresolved jump or taken branch ending a block.
    pub fn unresolved(&self, bb: Block) -> Option<&UnresolvedTransfer> {
        self.unresolved.iter().find(|u| u.from == bb)
    }

    /// Return the edges that leave the function, in block order.
    pub fn exits(&self) -> Vec<FunctionExit> {
        self.edges()
            .filter(|e| e.to.is_none())
            .map(|e| match self.tail_call(e.from) {
                Some(callee) if e.kind == EdgeKind::Unconditional => FunctionExit {
                    from: e.from,
                    kind: ExitKind::TailCall,
                    callee: Some(callee),
                },
                _ => FunctionExit {
                    from: e.from,
                    kind: ExitKind::Return,
                    callee: None,
                },
            })
            .collect()
    }

    /// A printable name of the function.
    pub fn display_name(&self) -> String {
        match self.name {
            Some(ref name) => name.clone(),
            None => format!("sub_{:04X}", self.address),
        }
    }
}

impl fmt::Display for FunctionCfg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} ({}) entry {} at ${:04X}",
            self.display_name(),
            self.kind,
            self.entry,
            self.address
        )?;
        for edge in self.edges() {
            match self.tail_call(edge.from) {
                Some(callee) if edge.to.is_none() && edge.kind == EdgeKind::Unconditional => {
                    writeln!(f, "  {} -TAIL_CALL-> {}", edge.from, callee)?
                }
                _ => writeln!(f, "  {}", edge)?,
            }
        }
        for u in &self.unresolved {
            writeln!(f, "  {} unresolved {}", u.from, u)?;
        }
        if !self.unreachable_inside.is_empty() {
            write!(f, "  unreachable inside")?;
            for bb in &self.unreachable_inside {
                write!(f, " {}", bb)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::Reachability,
        program::{EntryPoint, InstData},
    };

    fn build(insts: Vec<InstData>, entries: Vec<EntryPoint>) -> (BasicBlocks, Cfg) {
        let prog = Program::new(insts, entries);
        let reach = Reachability::new(&prog);
        let blocks = BasicBlocks::new(&prog, &reach);
        let cfg = Cfg::new(&prog, &blocks);
        (blocks, cfg)
    }

    #[test]
    fn calls_fall_through() {
        let (blocks, cfg) = build(
            vec![
                InstData::new(0x10, Opcode::Call, 3).with_target(0x20),
                InstData::new(0x13, Opcode::Return, 1),
                InstData::new(0x20, Opcode::Return, 1),
            ],
            vec![EntryPoint::at(0x10, EntryKind::Exported)],
        );
        let bb0 = blocks.block_at(0x10).unwrap();
        let bb1 = blocks.block_at(0x13).unwrap();
        assert_eq!(
            cfg.outgoing(bb0),
            &[CfgEdge {
                from: bb0,
                to: Some(bb1),
                kind: EdgeKind::FallThrough
            }]
        );
        assert_eq!(cfg.functions.len(), 1);
        assert_eq!(cfg.functions[0].blocks, vec![bb0, bb1]);
    }

    #[test]
    fn unmapped_entries_are_reported() {
        let (_, cfg) = build(
            vec![InstData::new(0x10, Opcode::Return, 1)],
            vec![
                EntryPoint::at(0x10, EntryKind::Exported),
                EntryPoint::named("nowhere", EntryKind::CallTarget),
            ],
        );
        assert_eq!(cfg.functions.len(), 1);
        assert_eq!(cfg.unmapped.len(), 1);
    }

    #[test]
    fn jump_back_to_entry_becomes_return() {
        let (blocks, cfg) = build(
            vec![
                InstData::new(0x10, Opcode::Other, 1).with_label("top"),
                InstData::new(0x11, Opcode::Branch, 2).with_target(0x15),
                InstData::new(0x13, Opcode::Jump, 2).with_target(0x10),
                InstData::new(0x15, Opcode::Return, 1),
            ],
            vec![EntryPoint::named("top", EntryKind::Exported)],
        );
        let func = &cfg.functions[0];
        let jmp = blocks.block_at(0x13).unwrap();
        assert_eq!(func.len(), 3);
        assert_eq!(
            func.outgoing(jmp),
            &[CfgEdge {
                from: jmp,
                to: None,
                kind: EdgeKind::Return
            }]
        );
        assert_eq!(func.reentries.len(), 1);
        assert_eq!(func.transfers(jmp)[0].to, Some(func.entry));
        assert_eq!(func.name.as_ref().map(|s| s.as_str()), Some("top"));
    }

    #[test]
    fn jump_to_other_entry_is_cut() {
        let (blocks, cfg) = build(
            vec![
                InstData::new(0x10, Opcode::Branch, 2).with_target(0x18),
                InstData::new(0x12, Opcode::Jump, 3).with_target(0x20),
                InstData::new(0x15, Opcode::Other, 1),
                InstData::new(0x16, Opcode::Return, 1),
                InstData::new(0x18, Opcode::Return, 1),
                InstData::new(0x20, Opcode::Return, 1),
            ],
            vec![
                EntryPoint::at(0x10, EntryKind::Exported),
                EntryPoint::at(0x15, EntryKind::JumpTable),
                EntryPoint::at(0x20, EntryKind::CallTarget),
            ],
        );
        let jmp = blocks.block_at(0x12).unwrap();
        let ret = blocks.block_at(0x18).unwrap();
        let case = blocks.block_at(0x15).unwrap();
        let helper = blocks.block_at(0x20).unwrap();
        assert_eq!(cfg.functions.len(), 2);

        let func = &cfg.functions[0];
        assert!(!func.contains(helper));
        assert_eq!(func.len(), 3);
        assert_eq!(
            func.outgoing(jmp),
            &[CfgEdge {
                from: jmp,
                to: None,
                kind: EdgeKind::Unconditional
            }]
        );
        assert_eq!(func.tail_call(jmp), Some(helper));
        assert_eq!(
            func.exits(),
            vec![
                FunctionExit {
                    from: jmp,
                    kind: ExitKind::TailCall,
                    callee: Some(helper)
                },
                FunctionExit {
                    from: ret,
                    kind: ExitKind::Return,
                    callee: None
                },
            ]
        );
        assert_eq!(func.unreachable_inside, vec![case]);
        assert!(func.unresolved.is_empty());
        assert!(cfg.shared.is_empty());
        assert_eq!(cfg.outgoing(jmp)[0].to, Some(helper));
    }

    #[test]
    fn fall_through_into_other_entry_is_shared() {
        let (blocks, cfg) = build(
            vec![
                InstData::new(0x10, Opcode::Other, 1),
                InstData::new(0x11, Opcode::Return, 1),
            ],
            vec![
                EntryPoint::at(0x10, EntryKind::Exported),
                EntryPoint::at(0x11, EntryKind::CallTarget),
            ],
        );
        let tail = blocks.block_at(0x11).unwrap();
        assert_eq!(cfg.functions[0].len(), 2);
        assert_eq!(cfg.functions[1].blocks, vec![tail]);
        assert!(cfg.functions[0].tail_calls.is_empty());
        assert_eq!(cfg.shared, vec![tail].into_iter().collect());
    }
}
