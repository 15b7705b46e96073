// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{
    analysis::{DominatorTree, PredecessorTable},
    block::{BasicBlocks, Block},
    cfg::{CfgEdge, EdgeKind, FunctionCfg},
    program::Address,
    table::{DenseTable, TableKey},
    util::write_set,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    ops::Index,
};

impl_table_key! {
    /// A natural loop within a function.
    struct LoopId(u32) as "loop";
}

/// The shape of a loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LoopKind {
    /// The condition is tested at the top, before the body.
    PreTest,
    /// The condition is tested at the bottom, after the body.
    PostTest,
    /// The loop has no conditional exit.
    Infinite,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoopKind::PreTest => write!(f, "while"),
            LoopKind::PostTest => write!(f, "do-while"),
            LoopKind::Infinite => write!(f, "infinite"),
        }
    }
}

/// A natural loop.
#[derive(Debug, Clone, Serialize)]
pub struct NaturalLoop {
    pub id: LoopId,
    /// The single entry of the loop. Dominates every block in the body.
    pub header: Block,
    /// All blocks of the loop, including the header.
    pub body: BTreeSet<Block>,
    /// Sources of the back edges to the header.
    pub latches: BTreeSet<Block>,
    /// Blocks in the body with an edge leaving the loop.
    pub exits: BTreeSet<Block>,
    /// Blocks outside the body targeted by an edge from inside.
    pub exit_targets: BTreeSet<Block>,
    /// Addresses of the exit targets.
    pub exit_addresses: BTreeSet<Address>,
    /// The exit target a `break` leaves the loop to.
    pub exit_target: Option<Block>,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
    pub kind: LoopKind,
    /// Nesting depth. Top-level loops have depth 0.
    pub depth: usize,
}

impl NaturalLoop {
    /// Check whether a block is part of the loop.
    pub fn contains(&self, bb: Block) -> bool {
        self.body.contains(&bb)
    }
}

/// All natural loops of a function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopForest {
    loops: DenseTable<LoopId, NaturalLoop>,
    #[serde(skip)]
    by_header: HashMap<Block, LoopId>,
}

impl LoopForest {
    /// Detect the natural loops of a function.
    ///
    /// Every back edge `latch -> header` induces a loop body consisting of the
    /// header and all blocks that reach the latch without passing through the
    /// header. Back edges with the same header form a single loop.
    pub fn new(
        func: &FunctionCfg,
        blocks: &BasicBlocks,
        pred: &PredecessorTable,
        domtree: &DominatorTree,
    ) -> Self {
        let mut bodies: BTreeMap<Block, (BTreeSet<Block>, BTreeSet<Block>)> = BTreeMap::new();
        for edge in domtree.back_edges() {
            let header = match edge.to {
                Some(h) => h,
                None => continue,
            };
            let entry = bodies.entry(header).or_default();
            entry.1.insert(edge.from);
            let body = &mut entry.0;
            body.insert(header);
            let mut worklist = vec![edge.from];
            while let Some(bb) = worklist.pop() {
                if body.insert(bb) {
                    worklist.extend(pred.pred(bb));
                }
            }
        }

        // Outer loops have their header earlier in reverse postorder.
        let mut headers: Vec<Block> = bodies.keys().cloned().collect();
        headers.sort_by_key(|&h| domtree.block_order(h));

        let mut forest = LoopForest::default();
        for header in headers {
            let (body, latches) = bodies.remove(&header).unwrap_or_default();
            let exit_edges: Vec<CfgEdge> = body
                .iter()
                .flat_map(|&bb| func.outgoing(bb).iter().cloned())
                .filter(|e| e.to.map(|to| !body.contains(&to)).unwrap_or(true))
                .collect();
            let exits: BTreeSet<Block> = exit_edges.iter().map(|e| e.from).collect();
            let exit_targets: BTreeSet<Block> = exit_edges.iter().filter_map(|e| e.to).collect();
            let exit_addresses = exit_targets.iter().map(|&bb| blocks[bb].start).collect();
            let kind = classify(header, &latches, &exit_edges);
            let exit_target = primary_exit(kind, header, &latches, &exit_edges);
            let id = forest.loops.add(NaturalLoop {
                id: LoopId::new(forest.loops.len()),
                header,
                body,
                latches,
                exits,
                exit_targets,
                exit_addresses,
                exit_target,
                parent: None,
                children: vec![],
                kind,
                depth: 0,
            });
            forest.by_header.insert(header, id);
        }

        // Link the loops by body containment, outermost first.
        let mut by_size: Vec<LoopId> = forest.loops.keys().collect();
        by_size.sort_by_key(|&id| std::cmp::Reverse(forest.loops[id].body.len()));
        for (i, &id) in by_size.iter().enumerate() {
            let parent = by_size[..i]
                .iter()
                .rev()
                .cloned()
                .find(|&other| {
                    let outer = &forest.loops[other];
                    forest.loops[id].body.is_subset(&outer.body)
                });
            if let Some(parent) = parent {
                let depth = forest.loops[parent].depth + 1;
                forest.loops[parent].children.push(id);
                let lp = &mut forest.loops[id];
                lp.parent = Some(parent);
                lp.depth = depth;
            }
        }
        for id in forest.loops.keys() {
            let mut children = std::mem::take(&mut forest.loops[id].children);
            children.sort_by_key(|&c| domtree.block_order(forest.loops[c].header));
            forest.loops[id].children = children;
        }

        for lp in forest.loops.values() {
            debug!(
                "{} in {}: header {}, {} blocks, {}, depth {}, exit {:?}",
                lp.id,
                func.display_name(),
                lp.header,
                lp.body.len(),
                lp.kind,
                lp.depth,
                lp.exit_target
            );
        }
        forest
    }

    /// Return the number of loops.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Check whether the function has no loops.
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Return an iterator over all loops, outer loops before inner ones.
    pub fn loops(&self) -> impl Iterator<Item = &NaturalLoop> {
        self.loops.values()
    }

    /// Return an iterator over the loops that are not nested in another loop.
    pub fn top_level(&self) -> impl Iterator<Item = &NaturalLoop> {
        self.loops.values().filter(|lp| lp.parent.is_none())
    }

    /// Get the loop a block is the header of.
    pub fn is_header(&self, bb: Block) -> Option<LoopId> {
        self.by_header.get(&bb).cloned()
    }

    /// Get the loops containing a block, innermost first.
    pub fn loops_containing(&self, bb: Block) -> Vec<LoopId> {
        let mut ids: Vec<LoopId> = self
            .loops
            .values()
            .filter(|lp| lp.contains(bb))
            .map(|lp| lp.id)
            .collect();
        ids.sort_by_key(|&id| std::cmp::Reverse(self.loops[id].depth));
        ids
    }

    /// Get the innermost loop containing a block.
    pub fn innermost(&self, bb: Block) -> Option<LoopId> {
        self.loops
            .values()
            .filter(|lp| lp.contains(bb))
            .max_by_key(|lp| lp.depth)
            .map(|lp| lp.id)
    }
}

impl Index<LoopId> for LoopForest {
    type Output = NaturalLoop;

    fn index(&self, idx: LoopId) -> &NaturalLoop {
        &self.loops[idx]
    }
}

impl fmt::Display for LoopForest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for lp in self.loops.values() {
            write!(
                f,
                "{}{} {} header {} body ",
                "  ".repeat(lp.depth),
                lp.id,
                lp.kind,
                lp.header
            )?;
            write_set(f, &lp.body)?;
            if let Some(exit) = lp.exit_target {
                write!(f, " exit {}", exit)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn is_conditional(edge: &CfgEdge) -> bool {
    edge.kind == EdgeKind::True || edge.kind == EdgeKind::False
}

/// Classify a loop by where its conditional exits are.
fn classify(header: Block, latches: &BTreeSet<Block>, exits: &[CfgEdge]) -> LoopKind {
    let cond_exit = |bb: Block| exits.iter().any(|e| e.from == bb && is_conditional(e));
    if latches.contains(&header) && cond_exit(header) {
        LoopKind::PostTest
    } else if cond_exit(header) {
        LoopKind::PreTest
    } else if latches.iter().any(|&l| cond_exit(l)) {
        LoopKind::PostTest
    } else if exits.iter().any(is_conditional) {
        LoopKind::PreTest
    } else {
        LoopKind::Infinite
    }
}

/// Pick the exit target a `break` out of the loop should go to.
fn primary_exit(
    kind: LoopKind,
    header: Block,
    latches: &BTreeSet<Block>,
    exits: &[CfgEdge],
) -> Option<Block> {
    let exit_of = |bb: Block| {
        exits
            .iter()
            .filter(|e| e.from == bb)
            .filter_map(|e| e.to)
            .min()
    };
    let tested = match kind {
        LoopKind::PreTest => exit_of(header),
        LoopKind::PostTest if latches.contains(&header) => exit_of(header),
        LoopKind::PostTest => latches.iter().filter_map(|&l| exit_of(l)).next(),
        LoopKind::Infinite => None,
    };
    tested.or_else(|| {
        // Most frequent target, lowest address on ties.
        let mut counts: BTreeMap<Block, usize> = BTreeMap::new();
        for bb in exits.iter().filter_map(|e| e.to) {
            *counts.entry(bb).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|&(bb, n)| (n, std::cmp::Reverse(bb)))
            .map(|(bb, _)| bb)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::Reachability,
        cfg::Cfg,
        program::{EntryKind, EntryPoint, InstData, Opcode, Program},
    };

    fn loops_of(insts: Vec<InstData>) -> LoopForest {
        let prog = Program::new(insts, vec![EntryPoint::at(0x10, EntryKind::Exported)]);
        let reach = Reachability::new(&prog);
        let blocks = BasicBlocks::new(&prog, &reach);
        let cfg = Cfg::new(&prog, &blocks);
        let func = &cfg.functions[0];
        let pred = PredecessorTable::new(func);
        let domtree = DominatorTree::new(func, &pred).unwrap();
        LoopForest::new(func, &blocks, &pred, &domtree)
    }

    #[test]
    fn jump_back_without_exit_is_infinite() {
        let loops = loops_of(vec![
            InstData::new(0x10, Opcode::Other, 1),
            InstData::new(0x11, Opcode::Other, 1),
            InstData::new(0x12, Opcode::Jump, 3).with_target(0x11),
        ]);
        assert_eq!(loops.len(), 1);
        let lp = loops.loops().next().unwrap();
        let bb = Block::new;
        assert_eq!(lp.header, bb(1));
        assert_eq!(lp.body, vec![bb(1)].into_iter().collect());
        assert_eq!(lp.kind, LoopKind::Infinite);
        assert_eq!(lp.exit_target, None);
        assert!(lp.exit_addresses.is_empty());
    }

    #[test]
    fn latches_share_one_loop() {
        let loops = loops_of(vec![
            InstData::new(0x10, Opcode::Other, 1),
            InstData::new(0x11, Opcode::Other, 1),
            InstData::new(0x12, Opcode::Branch, 2).with_target(0x11),
            InstData::new(0x14, Opcode::Other, 1),
            InstData::new(0x15, Opcode::Branch, 2).with_target(0x11),
            InstData::new(0x17, Opcode::Return, 1),
        ]);
        assert_eq!(loops.len(), 1);
        let lp = loops.loops().next().unwrap();
        let bb = Block::new;
        assert_eq!(lp.header, bb(1));
        assert_eq!(lp.latches, vec![bb(1), bb(2)].into_iter().collect());
        assert_eq!(lp.body, vec![bb(1), bb(2)].into_iter().collect());
        assert_eq!(lp.kind, LoopKind::PostTest);
        assert_eq!(lp.exit_target, Some(bb(3)));
        assert_eq!(lp.exit_addresses, vec![0x17].into_iter().collect());
        assert_eq!(loops.innermost(bb(2)), Some(lp.id));
        assert_eq!(loops.innermost(bb(0)), None);
    }

    #[test]
    fn unconditional_exits_pick_most_frequent_target() {
        let bb = Block::new;
        let exit = |from, to| CfgEdge {
            from: bb(from),
            to: Some(bb(to)),
            kind: EdgeKind::Unconditional,
        };
        let latches = vec![bb(3)].into_iter().collect();
        let exits = [exit(1, 5), exit(2, 4), exit(3, 4)];
        assert_eq!(
            primary_exit(LoopKind::Infinite, bb(1), &latches, &exits),
            Some(bb(4))
        );
        let exits = [exit(1, 5), exit(2, 4)];
        assert_eq!(
            primary_exit(LoopKind::Infinite, bb(1), &latches, &exits),
            Some(bb(4))
        );
    }
}
