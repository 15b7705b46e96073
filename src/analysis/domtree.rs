// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{
    analysis::{AnalysisError, PredecessorTable},
    block::Block,
    cfg::{CfgEdge, FunctionCfg},
    table::TableKey,
    util::write_set,
};
use hibitset::BitSet;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// A node in the dominator tree.
#[derive(Debug, Clone, Serialize)]
pub struct DominatorNode {
    pub block: Block,
    /// The immediate dominator. `None` for the entry.
    pub idom: Option<Block>,
    /// The blocks immediately dominated by this block, in reverse postorder.
    pub children: Vec<Block>,
    /// The dominance frontier.
    pub frontier: BTreeSet<Block>,
}

/// A block dominator tree.
///
/// Records for every block which other blocks in the CFG *have* to be traversed
/// to reach it. The nodes are stored in a flat arena in reverse postorder; the
/// links between them are block ids.
#[derive(Debug, Clone, Serialize)]
pub struct DominatorTree {
    entry: Block,
    nodes: Vec<DominatorNode>,
    #[serde(skip)]
    local: HashMap<Block, usize>,
    #[serde(skip)]
    sets: Vec<BTreeSet<usize>>,
    back_edges: Vec<CfgEdge>,
    iterations: usize,
}

impl DominatorTree {
    /// Compute the dominator tree of a function.
    ///
    /// Dominator sets are solved as an iterative dataflow problem in reverse
    /// postorder until no set changes anymore. The entry dominates only
    /// itself, every other block is dominated by itself and the intersection
    /// of the dominators of its predecessors.
    pub fn new(func: &FunctionCfg, pred: &PredecessorTable) -> Result<Self, AnalysisError> {
        let t0 = time::precise_time_ns();
        let mut post_order = compute_blocks_post_order(func, pred);
        post_order.reverse();
        let rpo = post_order;
        let local: HashMap<Block, usize> = rpo.iter().enumerate().map(|(i, &bb)| (bb, i)).collect();
        trace!("[DomTree] reverse post-order {:?}", rpo);

        let preds: Vec<Vec<usize>> = rpo
            .iter()
            .map(|&bb| {
                pred.pred(bb)
                    .filter_map(|p| local.get(&p).cloned())
                    .collect()
            })
            .collect();
        let order: Vec<usize> = (0..rpo.len()).collect();
        let (sets, iterations) = solve_dominators(rpo.len(), 0, &preds, &order);
        let idoms = immediate_dominators(&sets, 0).map_err(|msg| AnalysisError::new(func, msg))?;

        let mut nodes: Vec<DominatorNode> = rpo
            .iter()
            .enumerate()
            .map(|(i, &block)| DominatorNode {
                block,
                idom: idoms[i].map(|d| rpo[d]),
                children: vec![],
                frontier: BTreeSet::new(),
            })
            .collect();
        for i in 0..nodes.len() {
            if let Some(d) = idoms[i] {
                let child = nodes[i].block;
                nodes[d].children.push(child);
            }
        }
        check_acyclic(&idoms).map_err(|msg| AnalysisError::new(func, msg))?;

        // Dominance frontiers and back edges.
        let mut back_edges = vec![];
        for (x, &bb) in rpo.iter().enumerate() {
            for edge in func.outgoing(bb) {
                let s = match edge.to.and_then(|to| local.get(&to).cloned()) {
                    Some(s) => s,
                    None => continue,
                };
                if sets[x].contains(&s) {
                    back_edges.push(*edge);
                }
                for &b in &sets[x] {
                    if b == s || !sets[s].contains(&b) {
                        nodes[b].frontier.insert(rpo[s]);
                    }
                }
            }
        }

        let t1 = time::precise_time_ns();
        DOMINATOR_TREE_TIME.fetch_add(t1 - t0, Ordering::Relaxed);
        debug!(
            "Dominator tree of {} converged after {} iterations, {} back edges",
            func.display_name(),
            iterations,
            back_edges.len()
        );

        Ok(Self {
            entry: func.entry,
            nodes,
            local,
            sets,
            back_edges,
            iterations,
        })
    }

    fn node(&self, bb: Block) -> Option<&DominatorNode> {
        self.local.get(&bb).map(|&i| &self.nodes[i])
    }

    /// Get the root of the tree.
    pub fn entry(&self) -> Block {
        self.entry
    }

    /// Get all nodes in reverse postorder.
    pub fn nodes(&self) -> &[DominatorNode] {
        &self.nodes
    }

    /// Get the blocks in reverse postorder.
    pub fn blocks_rpo(&self) -> impl Iterator<Item = Block> + Clone + '_ {
        self.nodes.iter().map(|n| n.block)
    }

    /// Get the reverse postorder index of a block.
    pub fn block_order(&self, bb: Block) -> usize {
        self.local.get(&bb).cloned().unwrap_or(std::usize::MAX)
    }

    /// Check if a block dominates another.
    pub fn dominates(&self, dominator: Block, follower: Block) -> bool {
        match (self.local.get(&dominator), self.local.get(&follower)) {
            (Some(d), Some(f)) => self.sets[*f].contains(d),
            _ => false,
        }
    }

    /// Check if a block dominates another block other than itself.
    pub fn strictly_dominates(&self, dominator: Block, follower: Block) -> bool {
        dominator != follower && self.dominates(dominator, follower)
    }

    /// Get the immediate dominator of a block.
    pub fn idom(&self, bb: Block) -> Option<Block> {
        self.node(bb).and_then(|n| n.idom)
    }

    /// Get the dominators of a block, including the block itself.
    pub fn dominators(&self, follower: Block) -> Vec<Block> {
        match self.local.get(&follower) {
            Some(&f) => self.sets[f].iter().map(|&i| self.nodes[i].block).collect(),
            None => vec![],
        }
    }

    /// Get the blocks immediately dominated by a block.
    pub fn children(&self, bb: Block) -> &[Block] {
        self.node(bb).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Get the dominance frontier of a block.
    pub fn frontier(&self, bb: Block) -> Option<&BTreeSet<Block>> {
        self.node(bb).map(|n| &n.frontier)
    }

    /// Get the depth of a block in the tree. The entry has depth 0.
    pub fn depth(&self, bb: Block) -> usize {
        self.local
            .get(&bb)
            .map(|&i| self.sets[i].len().saturating_sub(1))
            .unwrap_or(0)
    }

    /// Get the edges whose destination dominates their source.
    pub fn back_edges(&self) -> &[CfgEdge] {
        &self.back_edges
    }

    /// Check if an edge between two blocks would be a back edge.
    pub fn is_back_edge(&self, from: Block, to: Block) -> bool {
        self.dominates(to, from)
    }

    /// Get the number of iterations the dataflow solver needed.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn write_subtree(&self, f: &mut fmt::Formatter, bb: Block, indent: usize) -> fmt::Result {
        write!(f, "{}{}", "  ".repeat(indent), bb)?;
        if let Some(frontier) = self.frontier(bb).filter(|df| !df.is_empty()) {
            write!(f, " frontier ")?;
            write_set(f, frontier)?;
        }
        writeln!(f)?;
        for &child in self.children(bb) {
            self.write_subtree(f, child, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for DominatorTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.nodes.is_empty() {
            return Ok(());
        }
        self.write_subtree(f, self.entry, 0)?;
        for edge in &self.back_edges {
            writeln!(f, "back edge {}", edge)?;
        }
        Ok(())
    }
}

/// A post-dominator tree over the forward edges of a function.
///
/// Back edges are removed and every block that can leave the function, or
/// has no forward successor, is connected to a virtual exit. The immediate
/// post-dominator of a branch is where its two sides reconverge.
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    local: HashMap<Block, usize>,
    blocks: Vec<Block>,
    sets: Vec<BTreeSet<usize>>,
    ipdoms: Vec<Option<usize>>,
}

impl PostDominatorTree {
    /// Compute the post-dominator tree of a function.
    pub fn new(func: &FunctionCfg, domtree: &DominatorTree) -> Result<Self, AnalysisError> {
        let blocks: Vec<Block> = domtree.blocks_rpo().collect();
        let exit = blocks.len();
        let local = domtree.local.clone();
        let back: HashSet<(Block, Block)> = domtree
            .back_edges()
            .iter()
            .filter_map(|e| e.to.map(|to| (e.from, to)))
            .collect();

        // Successors in the forward graph act as predecessors of the reverse
        // graph the solver runs on.
        let mut succs: Vec<Vec<usize>> = vec![vec![]; exit + 1];
        for (i, &bb) in blocks.iter().enumerate() {
            let mut leaves = false;
            for edge in func.outgoing(bb) {
                match edge.to.and_then(|to| local.get(&to).cloned()) {
                    Some(s) if !back.contains(&(bb, blocks[s])) => {
                        if !succs[i].contains(&s) {
                            succs[i].push(s);
                        }
                    }
                    Some(_) => (),
                    None => leaves = true,
                }
            }
            if leaves || succs[i].is_empty() {
                succs[i].push(exit);
            }
        }
        let order: Vec<usize> = Some(exit).into_iter().chain((0..exit).rev()).collect();
        let (mut sets, iterations) = solve_dominators(exit + 1, exit, &succs, &order);

        // Blocks caught in an endless cycle never reach the exit and have no
        // post-dominators besides themselves.
        let mut reaches = vec![false; exit + 1];
        reaches[exit] = true;
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..exit {
                if !reaches[i] && succs[i].iter().any(|&s| reaches[s]) {
                    reaches[i] = true;
                    changed = true;
                }
            }
        }
        for (i, set) in sets.iter_mut().enumerate() {
            if !reaches[i] {
                trace!("{} never reaches the function exit", blocks[i]);
                *set = Some(i).into_iter().collect();
            }
        }
        let ipdoms =
            immediate_dominators(&sets, exit).map_err(|msg| AnalysisError::new(func, msg))?;
        trace!(
            "Post-dominator tree of {} converged after {} iterations",
            func.display_name(),
            iterations
        );
        Ok(Self {
            local,
            blocks,
            sets,
            ipdoms,
        })
    }

    /// Get the immediate post-dominator of a block. `None` if that is the
    /// virtual exit.
    pub fn ipdom(&self, bb: Block) -> Option<Block> {
        let i = *self.local.get(&bb)?;
        self.ipdoms[i].and_then(|d| self.blocks.get(d).cloned())
    }

    /// Check if a block post-dominates another.
    pub fn postdominates(&self, dominator: Block, follower: Block) -> bool {
        match (self.local.get(&dominator), self.local.get(&follower)) {
            (Some(d), Some(f)) => self.sets[*f].contains(d),
            _ => false,
        }
    }
}

/// Solve the dominator sets of a graph given as predecessor lists.
///
/// Nodes are visited in `order` until a full pass changes nothing. Returns the
/// sets and the number of passes.
fn solve_dominators(
    len: usize,
    root: usize,
    preds: &[Vec<usize>],
    order: &[usize],
) -> (Vec<BTreeSet<usize>>, usize) {
    if len == 0 {
        return (vec![], 0);
    }
    let all: BTreeSet<usize> = (0..len).collect();
    let mut sets = vec![all; len];
    sets[root] = Some(root).into_iter().collect();

    let mut iterations = 0;
    let mut changed = true;
    while changed {
        changed = false;
        iterations += 1;
        if iterations == len + 3 {
            warn!(
                "Dominator sets of {} nodes still changing after {} iterations",
                len,
                iterations - 1
            );
        }
        for &idx in order {
            if idx == root {
                continue;
            }
            let mut new: Option<BTreeSet<usize>> = None;
            for &p in &preds[idx] {
                new = Some(match new {
                    None => sets[p].clone(),
                    Some(acc) => acc.intersection(&sets[p]).cloned().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(idx);
            if new != sets[idx] {
                sets[idx] = new;
                changed = true;
            }
        }
    }
    (sets, iterations)
}

/// Derive the immediate dominator of every node from its dominator set.
///
/// The immediate dominator is the strict dominator that is itself dominated by
/// all other strict dominators, i.e. the one with the largest dominator set.
fn immediate_dominators(
    sets: &[BTreeSet<usize>],
    root: usize,
) -> Result<Vec<Option<usize>>, String> {
    let mut idoms = vec![None; sets.len()];
    for (idx, set) in sets.iter().enumerate() {
        if idx == root {
            if set.len() != 1 {
                return Err(format!("root node {} has dominators {:?}", idx, set));
            }
            continue;
        }
        // Nodes disconnected from the root.
        if set.len() == 1 && set.contains(&idx) {
            continue;
        }
        let idom = set
            .iter()
            .cloned()
            .filter(|&d| d != idx)
            .max_by_key(|&d| sets[d].len());
        let idom = match idom {
            Some(d) => d,
            None => return Err(format!("node {} has no immediate dominator", idx)),
        };
        if let Some(&other) = set
            .iter()
            .find(|&&d| d != idx && d != idom && !sets[idom].contains(&d))
        {
            return Err(format!(
                "node {} has no unique immediate dominator ({} and {} are unrelated)",
                idx, idom, other
            ));
        }
        idoms[idx] = Some(idom);
    }
    Ok(idoms)
}

/// Make sure following immediate dominators from any node reaches a root.
fn check_acyclic(idoms: &[Option<usize>]) -> Result<(), String> {
    for start in 0..idoms.len() {
        let mut steps = 0;
        let mut node = start;
        while let Some(next) = idoms[node] {
            steps += 1;
            if steps > idoms.len() {
                return Err(format!("dominator tree has a cycle through node {}", start));
            }
            node = next;
        }
    }
    Ok(())
}

fn compute_blocks_post_order(func: &FunctionCfg, pred: &PredecessorTable) -> Vec<Block> {
    let mut order = Vec::with_capacity(func.len());

    let mut stack = Vec::with_capacity(8);
    let mut discovered = BitSet::new();
    let mut finished = BitSet::new();

    if !func.is_empty() {
        stack.push(func.entry);
    }

    while let Some(&next) = stack.last() {
        if !discovered.add(next.index() as u32) {
            // Push in reverse so the first edge is explored first.
            for succ in func.succ(next).collect::<Vec<_>>().into_iter().rev() {
                if pred.succ_set(next).contains(&succ)
                    && !discovered.contains(succ.index() as u32)
                {
                    stack.push(succ);
                }
            }
        } else {
            stack.pop();
            if !finished.add(next.index() as u32) {
                order.push(next);
            }
        }
    }

    order
}

/// Total time spent constructing dominator trees.
pub static DOMINATOR_TREE_TIME: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;

    fn preds(edges: &[(usize, usize)], len: usize) -> Vec<Vec<usize>> {
        let mut p = vec![vec![]; len];
        for &(a, b) in edges {
            p[b].push(a);
        }
        p
    }

    #[test]
    fn diamond() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let p = preds(&[(0, 1), (0, 2), (1, 3), (2, 3)], 4);
        let (sets, _) = solve_dominators(4, 0, &p, &[0, 1, 2, 3]);
        let idoms = immediate_dominators(&sets, 0).unwrap();
        assert_eq!(idoms, vec![None, Some(0), Some(0), Some(0)]);
        assert!(check_acyclic(&idoms).is_ok());
    }

    #[test]
    fn loop_converges_regardless_of_order() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let p = preds(&[(0, 1), (1, 2), (2, 1), (2, 3)], 4);
        let (sets, iterations) = solve_dominators(4, 0, &p, &[3, 2, 1, 0]);
        assert!(iterations >= 2);
        let idoms = immediate_dominators(&sets, 0).unwrap();
        assert_eq!(idoms, vec![None, Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn cycles_are_detected() {
        assert!(check_acyclic(&[None, Some(2), Some(1)]).is_err());
    }

    #[test]
    fn diamond_frontiers() {
        use crate::{
            analysis::Reachability,
            block::BasicBlocks,
            cfg::Cfg,
            program::{EntryKind, EntryPoint, InstData, Opcode, Program},
        };
        let prog = Program::new(
            vec![
                InstData::new(0x10, Opcode::Branch, 2).with_target(0x15),
                InstData::new(0x12, Opcode::Jump, 3).with_target(0x16),
                InstData::new(0x15, Opcode::Other, 1),
                InstData::new(0x16, Opcode::Return, 1),
            ],
            vec![EntryPoint::at(0x10, EntryKind::Exported)],
        );
        let reach = Reachability::new(&prog);
        let blocks = BasicBlocks::new(&prog, &reach);
        let cfg = Cfg::new(&prog, &blocks);
        let func = &cfg.functions[0];
        let pred = PredecessorTable::new(func);
        let domtree = DominatorTree::new(func, &pred).unwrap();
        let postdom = PostDominatorTree::new(func, &domtree).unwrap();

        let bb = Block::new;
        let (entry, els, then, merge) = (bb(0), bb(1), bb(2), bb(3));
        let merge_only: BTreeSet<Block> = vec![merge].into_iter().collect();
        assert_eq!(domtree.frontier(then), Some(&merge_only));
        assert_eq!(domtree.frontier(els), Some(&merge_only));
        assert_eq!(domtree.frontier(entry), Some(&BTreeSet::new()));
        assert_eq!(domtree.frontier(merge), Some(&BTreeSet::new()));
        assert_eq!(domtree.idom(merge), Some(entry));
        assert_eq!(domtree.depth(merge), 1);
        assert!(domtree.back_edges().is_empty());
        assert_eq!(postdom.ipdom(entry), Some(merge));
        assert!(postdom.postdominates(merge, then));
        assert!(!postdom.postdominates(then, entry));
    }
}
