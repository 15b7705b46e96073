// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{
    analysis::{DominatorTree, LoopForest, LoopId, PostDominatorTree},
    block::Block,
    cfg::{EdgeKind, FunctionCfg},
    table::{DenseTable, TableKey},
    util::write_set,
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    ops::Index,
};

impl_table_key! {
    /// A two-way conditional within a function.
    struct CondId(u32) as "cond";
}

/// The shape of a conditional.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CondKind {
    /// Only one side executes code before the merge point.
    If,
    /// Both sides execute code before the merge point.
    IfElse,
}

impl fmt::Display for CondKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CondKind::If => write!(f, "IF"),
            CondKind::IfElse => write!(f, "IF_ELSE"),
        }
    }
}

/// A conditional branch with the blocks executed on either side of it.
#[derive(Debug, Clone, Serialize)]
pub struct Conditional {
    pub id: CondId,
    /// The block ending in the conditional branch.
    pub header: Block,
    pub kind: CondKind,
    /// The branch edge that leads into `then_branch`. This is `False` if the
    /// taken side of the branch goes straight to the merge point.
    pub then_edge: EdgeKind,
    /// Blocks only executed on the `then_edge` side.
    pub then_branch: BTreeSet<Block>,
    /// Blocks only executed on the other side. Possibly empty.
    pub else_branch: BTreeSet<Block>,
    /// Where both sides reconverge. `None` if they never do within the
    /// enclosing loop or function.
    pub merge: Option<Block>,
    /// Nesting depth. Conditionals without parent have depth 0.
    pub depth: usize,
    pub parent: Option<CondId>,
    /// The innermost loop containing the header.
    pub enclosing_loop: Option<LoopId>,
}

impl Conditional {
    /// Return the header and all blocks on either side.
    pub fn blocks(&self) -> BTreeSet<Block> {
        let mut set: BTreeSet<Block> = self.then_branch.union(&self.else_branch).cloned().collect();
        set.insert(self.header);
        set
    }

    /// Check whether a block is on either side of the conditional.
    pub fn branches_contain(&self, bb: Block) -> bool {
        self.then_branch.contains(&bb) || self.else_branch.contains(&bb)
    }
}

/// All conditionals of a function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Conditionals {
    conds: DenseTable<CondId, Conditional>,
    #[serde(skip)]
    by_header: HashMap<Block, CondId>,
}

impl Conditionals {
    /// Detect the conditionals of a function.
    ///
    /// Every block ending in a conditional branch whose two destinations are
    /// distinct, are not reached over a back edge, and stay inside the
    /// innermost enclosing loop is a conditional. The sides extend from each
    /// destination up to the merge point, which is the immediate
    /// post-dominator of the header. Blocks reachable from both sides belong to
    /// neither.
    pub fn new(
        func: &FunctionCfg,
        domtree: &DominatorTree,
        postdom: &PostDominatorTree,
        loops: &LoopForest,
    ) -> Self {
        let mut found = vec![];
        for bb in domtree.blocks_rpo() {
            let edges = func.outgoing(bb);
            let dest = |kind| edges.iter().find(|e| e.kind == kind).and_then(|e| e.to);
            let (t, f) = match (dest(EdgeKind::True), dest(EdgeKind::False)) {
                (Some(t), Some(f)) if t != f => (t, f),
                _ => continue,
            };
            if domtree.is_back_edge(bb, t) || domtree.is_back_edge(bb, f) {
                trace!("{} branches back to a loop header", bb);
                continue;
            }
            let enclosing_loop = loops.innermost(bb);
            let in_scope = |x: Block| enclosing_loop.map(|l| loops[l].contains(x)).unwrap_or(true);
            if !in_scope(t) || !in_scope(f) {
                trace!("{} branches out of {:?}", bb, enclosing_loop);
                continue;
            }
            let merge = postdom.ipdom(bb).filter(|&m| in_scope(m));

            let reach = |start: Block| {
                let mut set = BTreeSet::new();
                let mut worklist = vec![start];
                while let Some(x) = worklist.pop() {
                    if Some(x) == merge
                        || x == bb
                        || !in_scope(x)
                        || !domtree.dominates(bb, x)
                        || !set.insert(x)
                    {
                        continue;
                    }
                    worklist.extend(func.succ(x).filter(|&y| !domtree.is_back_edge(x, y)));
                }
                set
            };
            let rt = reach(t);
            let rf = reach(f);
            let mut then_branch: BTreeSet<Block> = rt.difference(&rf).cloned().collect();
            let mut else_branch: BTreeSet<Block> = rf.difference(&rt).cloned().collect();
            let mut then_edge = EdgeKind::True;
            if then_branch.is_empty() {
                std::mem::swap(&mut then_branch, &mut else_branch);
                then_edge = EdgeKind::False;
            }
            if then_branch.is_empty() {
                trace!("{} has no code on either side", bb);
                continue;
            }
            let kind = if else_branch.is_empty() {
                CondKind::If
            } else {
                CondKind::IfElse
            };
            found.push(Conditional {
                id: CondId::new(0),
                header: bb,
                kind,
                then_edge,
                then_branch,
                else_branch,
                merge,
                depth: 0,
                parent: None,
                enclosing_loop,
            });
        }

        let mut result = Conditionals::default();
        for mut cond in found {
            cond.id = CondId::new(result.conds.len());
            result.by_header.insert(cond.header, cond.id);
            result.conds.add(cond);
        }

        // The parent is the smallest conditional with the header on one side.
        let mut by_size: Vec<CondId> = result.conds.keys().collect();
        by_size.sort_by_key(|&id| std::cmp::Reverse(result.conds[id].blocks().len()));
        for (i, &id) in by_size.iter().enumerate() {
            let header = result.conds[id].header;
            let parent = by_size[..i]
                .iter()
                .rev()
                .cloned()
                .find(|&other| result.conds[other].branches_contain(header));
            if let Some(parent) = parent {
                let depth = result.conds[parent].depth + 1;
                let cond = &mut result.conds[id];
                cond.parent = Some(parent);
                cond.depth = depth;
            }
        }

        for cond in result.conds.values() {
            debug!(
                "{} in {}: {} at {}, then {} blocks, else {} blocks, merge {:?}",
                cond.id,
                func.display_name(),
                cond.kind,
                cond.header,
                cond.then_branch.len(),
                cond.else_branch.len(),
                cond.merge
            );
        }
        result
    }

    /// Return the number of conditionals.
    pub fn len(&self) -> usize {
        self.conds.len()
    }

    /// Check whether the function has no conditionals.
    pub fn is_empty(&self) -> bool {
        self.conds.is_empty()
    }

    /// Return an iterator over all conditionals in reverse postorder of their
    /// headers.
    pub fn iter(&self) -> impl Iterator<Item = &Conditional> {
        self.conds.values()
    }

    /// Return an iterator over the conditionals that are neither nested in
    /// another conditional nor inside a loop.
    pub fn top_level(&self) -> impl Iterator<Item = &Conditional> {
        self.conds
            .values()
            .filter(|c| c.parent.is_none() && c.enclosing_loop.is_none())
    }

    /// Get the conditional a block is the header of.
    pub fn is_header(&self, bb: Block) -> Option<CondId> {
        self.by_header.get(&bb).cloned()
    }
}

impl Index<CondId> for Conditionals {
    type Output = Conditional;

    fn index(&self, idx: CondId) -> &Conditional {
        &self.conds[idx]
    }
}

impl fmt::Display for Conditionals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for cond in self.conds.values() {
            write!(
                f,
                "{}{} {} at {} ({}) then ",
                "  ".repeat(cond.depth),
                cond.id,
                cond.kind,
                cond.header,
                cond.then_edge
            )?;
            write_set(f, &cond.then_branch)?;
            write!(f, " else ")?;
            write_set(f, &cond.else_branch)?;
            match cond.merge {
                Some(m) => write!(f, " merge {}", m)?,
                None => write!(f, " no merge")?,
            }
            if let Some(lp) = cond.enclosing_loop {
                write!(f, " in {}", lp)?;
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
        analysis::{PredecessorTable, Reachability},
        block::BasicBlocks,
        cfg::Cfg,
        program::{EntryKind, EntryPoint, InstData, Opcode, Program},
    };

    #[test]
    fn nested_ifs() {
        // if (!b0) { b1; if (!b1) { b2 } b3 } b4
        let prog = Program::new(
            vec![
                InstData::new(0x10, Opcode::Branch, 2).with_target(0x1a),
                InstData::new(0x12, Opcode::Branch, 2).with_target(0x16),
                InstData::new(0x14, Opcode::Other, 2),
                InstData::new(0x16, Opcode::Other, 4),
                InstData::new(0x1a, Opcode::Return, 1),
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
        let loops = LoopForest::new(func, &blocks, &pred, &domtree);
        let conds = Conditionals::new(func, &domtree, &postdom, &loops);

        let bb = Block::new;
        assert_eq!(conds.len(), 2);
        let outer = conds.is_header(bb(0)).unwrap();
        let inner = conds.is_header(bb(1)).unwrap();
        let set = |v: Vec<usize>| v.into_iter().map(Block::new).collect::<BTreeSet<_>>();

        let c = &conds[outer];
        assert_eq!(c.kind, CondKind::If);
        assert_eq!(c.then_edge, EdgeKind::False);
        assert_eq!(c.then_branch, set(vec![1, 2, 3]));
        assert_eq!(c.merge, Some(bb(4)));
        assert_eq!(c.parent, None);

        let c = &conds[inner];
        assert_eq!(c.then_branch, set(vec![2]));
        assert_eq!(c.merge, Some(bb(3)));
        assert_eq!(c.parent, Some(outer));
        assert_eq!(c.depth, 1);
    }

    #[test]
    fn conditional_in_loop_is_not_top_level() {
        // if (!b0) { b1 } do { b2; if (!b2) { b3 } b4 } while (b4); b5
        let prog = Program::new(
            vec![
                InstData::new(0x10, Opcode::Branch, 2).with_target(0x14),
                InstData::new(0x12, Opcode::Other, 2),
                InstData::new(0x14, Opcode::Other, 1),
                InstData::new(0x15, Opcode::Branch, 2).with_target(0x19),
                InstData::new(0x17, Opcode::Other, 2),
                InstData::new(0x19, Opcode::Branch, 2).with_target(0x14),
                InstData::new(0x1b, Opcode::Return, 1),
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
        let loops = LoopForest::new(func, &blocks, &pred, &domtree);
        let conds = Conditionals::new(func, &domtree, &postdom, &loops);

        let bb = Block::new;
        let lp = loops.is_header(bb(2)).unwrap();
        assert_eq!(conds.len(), 2);
        let inner = &conds[conds.is_header(bb(2)).unwrap()];
        assert_eq!(inner.enclosing_loop, Some(lp));
        assert_eq!(inner.merge, Some(bb(4)));
        assert_eq!(inner.parent, None);
        assert!(conds.is_header(bb(4)).is_none());

        let top: Vec<Block> = conds.top_level().map(|c| c.header).collect();
        assert_eq!(top, vec![bb(0)]);
    }
}
