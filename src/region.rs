// Copyright (c) 2017-2021 Fabian Schuiki

//! Region trees.
//!
//! A region tree groups the blocks of a function into nested loops,
//! conditionals, and sequences. Every block appears in exactly one leaf. The
//! tree is built top-down: each block set is covered by the largest loops and
//! conditionals that fit into it entirely, whose own blocks are then covered
//! recursively. Whatever remains becomes a plain block. Loops and conditionals
//! that only partially overlap a set (irreducible flow) degrade to plain
//! blocks at that level.

use crate::{
    analysis::{CondId, Conditionals, DominatorTree, LoopForest, LoopId, LoopKind},
    block::Block,
    cfg::{EdgeKind, FunctionCfg},
};
use serde::Serialize;
use std::{collections::BTreeSet, fmt};

/// A node in the region tree.
#[derive(Debug, Clone, Serialize)]
pub enum Region {
    /// A single basic block.
    Block(Block),
    /// A natural loop with its body.
    Loop(LoopRegion),
    /// A conditional with its branches.
    IfThenElse(IfRegion),
    /// Regions executed one after another.
    Sequence(SequenceRegion),
    /// The body of a function.
    Function(FunctionRegion),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopRegion {
    pub id: LoopId,
    pub header: Block,
    pub kind: LoopKind,
    /// The loop body, always a sequence starting at the header.
    pub body: Box<Region>,
    pub blocks: BTreeSet<Block>,
    pub exits: BTreeSet<Block>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IfRegion {
    pub id: CondId,
    /// The block ending in the conditional branch.
    pub header: Block,
    /// The branch edge leading into `then_region`.
    pub then_edge: EdgeKind,
    pub then_region: Box<Region>,
    pub else_region: Option<Box<Region>>,
    pub merge: Option<Block>,
    pub blocks: BTreeSet<Block>,
    pub exits: BTreeSet<Block>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequenceRegion {
    pub entry: Block,
    pub children: Vec<Region>,
    pub blocks: BTreeSet<Block>,
    pub exits: BTreeSet<Block>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionRegion {
    pub entry: Block,
    pub body: Box<Region>,
    pub blocks: BTreeSet<Block>,
}

impl Region {
    /// Get the block control enters the region through.
    pub fn entry(&self) -> Block {
        match self {
            Region::Block(bb) => *bb,
            Region::Loop(r) => r.header,
            Region::IfThenElse(r) => r.header,
            Region::Sequence(r) => r.entry,
            Region::Function(r) => r.entry,
        }
    }

    /// Get all blocks covered by the region.
    pub fn blocks(&self) -> BTreeSet<Block> {
        match self {
            Region::Block(bb) => Some(*bb).into_iter().collect(),
            Region::Loop(r) => r.blocks.clone(),
            Region::IfThenElse(r) => r.blocks.clone(),
            Region::Sequence(r) => r.blocks.clone(),
            Region::Function(r) => r.blocks.clone(),
        }
    }

    /// Get the blocks outside the region that control may leave to.
    pub fn exits(&self, func: &FunctionCfg) -> BTreeSet<Block> {
        match self {
            Region::Block(bb) => func.succ(*bb).filter(|s| s != bb).collect(),
            Region::Loop(r) => r.exits.clone(),
            Region::IfThenElse(r) => r.exits.clone(),
            Region::Sequence(r) => r.exits.clone(),
            Region::Function(_) => BTreeSet::new(),
        }
    }

    /// Get the direct children of the region.
    pub fn children(&self) -> Vec<&Region> {
        match self {
            Region::Block(_) => vec![],
            Region::Loop(r) => vec![&*r.body],
            Region::IfThenElse(r) => Some(&*r.then_region)
                .into_iter()
                .chain(r.else_region.as_ref().map(|e| &**e))
                .collect(),
            Region::Sequence(r) => r.children.iter().collect(),
            Region::Function(r) => vec![&*r.body],
        }
    }

    /// Get the number of levels in the tree. A leaf has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(|c| c.depth())
            .max()
            .unwrap_or(0)
    }

    /// Get the blocks of all leaves, in tree order. The header of a
    /// conditional counts as its first leaf.
    pub fn leaves(&self) -> Vec<Block> {
        match self {
            Region::Block(bb) => vec![*bb],
            Region::IfThenElse(r) => Some(r.header)
                .into_iter()
                .chain(self.children().into_iter().flat_map(|c| c.leaves()))
                .collect(),
            _ => self
                .children()
                .into_iter()
                .flat_map(|c| c.leaves())
                .collect(),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter, indent: usize) -> fmt::Result {
        write!(f, "{}", "  ".repeat(indent))?;
        match self {
            Region::Block(bb) => writeln!(f, "Block {}", bb)?,
            Region::Loop(r) => writeln!(f, "Loop {} ({}) header {}", r.id, r.kind, r.header)?,
            Region::IfThenElse(r) => match r.merge {
                Some(m) => writeln!(f, "IfThenElse {} header {} merge {}", r.id, r.header, m)?,
                None => writeln!(f, "IfThenElse {} header {}", r.id, r.header)?,
            },
            Region::Sequence(r) => writeln!(f, "Sequence {}", r.entry)?,
            Region::Function(r) => writeln!(f, "Function {}", r.entry)?,
        }
        for child in self.children() {
            child.write_indented(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// The region tree of a function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionRegions {
    /// The root, always a `Region::Function`.
    pub root: Region,
    /// The blocks of the function in reverse postorder, which is the order
    /// sibling regions are arranged in.
    pub order: Vec<Block>,
}

impl FunctionRegions {
    /// Build the region tree of a function.
    pub fn new(
        func: &FunctionCfg,
        domtree: &DominatorTree,
        loops: &LoopForest,
        conds: &Conditionals,
    ) -> Self {
        let builder = Builder {
            func,
            domtree,
            loops,
            conds,
        };
        let all: BTreeSet<Block> = func.blocks.iter().cloned().collect();
        let body = builder.sequence(&all, func.entry, None, false);
        let root = Region::Function(FunctionRegion {
            entry: func.entry,
            body: Box::new(body),
            blocks: all,
        });
        debug!(
            "Region tree of {} has depth {}",
            func.display_name(),
            root.depth()
        );
        Self {
            root,
            order: domtree.blocks_rpo().collect(),
        }
    }

    /// Get the region directly below the function root.
    pub fn body(&self) -> &Region {
        match self.root {
            Region::Function(ref r) => &r.body,
            ref other => other,
        }
    }
}

impl fmt::Display for FunctionRegions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

struct Builder<'a> {
    func: &'a FunctionCfg,
    domtree: &'a DominatorTree,
    loops: &'a LoopForest,
    conds: &'a Conditionals,
}

enum Candidate {
    Loop(LoopId),
    Cond(CondId),
}

impl<'a> Builder<'a> {
    fn exits_of(&self, blocks: &BTreeSet<Block>) -> BTreeSet<Block> {
        blocks
            .iter()
            .flat_map(|&bb| self.func.succ(bb))
            .filter(|s| !blocks.contains(s))
            .collect()
    }

    /// Cover a set of blocks with regions and arrange them in a sequence.
    ///
    /// `skip` excludes the loop whose body is being covered. Unless `always`
    /// is set, a sequence of one region is returned as that region.
    fn sequence(
        &self,
        set: &BTreeSet<Block>,
        entry: Block,
        skip: Option<LoopId>,
        always: bool,
    ) -> Region {
        let mut candidates: Vec<(Candidate, BTreeSet<Block>, Block)> = vec![];
        for lp in self.loops.loops() {
            if Some(lp.id) != skip && lp.body.is_subset(set) {
                candidates.push((Candidate::Loop(lp.id), lp.body.clone(), lp.header));
            }
        }
        for cond in self.conds.iter() {
            let cond_blocks = cond.blocks();
            if cond_blocks.is_subset(set) {
                candidates.push((Candidate::Cond(cond.id), cond_blocks, cond.header));
            }
        }
        // Largest first; loops before conditionals of the same size.
        candidates.sort_by_key(|(c, blocks, header)| {
            (
                std::cmp::Reverse(blocks.len()),
                match c {
                    Candidate::Loop(_) => 0,
                    Candidate::Cond(_) => 1,
                },
                self.domtree.block_order(*header),
            )
        });

        let mut covered = BTreeSet::new();
        let mut children = vec![];
        for (cand, blocks, header) in candidates {
            if !covered.is_disjoint(&blocks) {
                continue;
            }
            if blocks.contains(&entry) && header != entry {
                trace!("Skipping region at {} entered through {}", header, entry);
                continue;
            }
            covered.extend(blocks.iter().cloned());
            children.push(match cand {
                Candidate::Loop(id) => self.loop_region(id),
                Candidate::Cond(id) => self.if_region(id),
            });
        }
        children.extend(
            set.iter()
                .filter(|bb| !covered.contains(bb))
                .map(|&bb| Region::Block(bb)),
        );
        children.sort_by_key(|r| {
            let e = r.entry();
            (e != entry, self.domtree.block_order(e))
        });

        if children.len() == 1 && !always {
            if let Some(only) = children.pop() {
                return only;
            }
        }
        Region::Sequence(SequenceRegion {
            entry,
            children,
            blocks: set.clone(),
            exits: self.exits_of(set),
        })
    }

    fn loop_region(&self, id: LoopId) -> Region {
        let lp = &self.loops[id];
        let body = self.sequence(&lp.body, lp.header, Some(id), true);
        Region::Loop(LoopRegion {
            id,
            header: lp.header,
            kind: lp.kind,
            body: Box::new(body),
            blocks: lp.body.clone(),
            exits: lp.exit_targets.clone(),
        })
    }

    fn if_region(&self, id: CondId) -> Region {
        let cond = &self.conds[id];
        let edges = self.func.outgoing(cond.header);
        let dest = |kind: EdgeKind| edges.iter().find(|e| e.kind == kind).and_then(|e| e.to);
        let else_edge = match cond.then_edge {
            EdgeKind::True => EdgeKind::False,
            _ => EdgeKind::True,
        };
        // A side is entered through its branch destination.
        let entry_of = |set: &BTreeSet<Block>, kind: EdgeKind| {
            dest(kind)
                .filter(|d| set.contains(d))
                .or_else(|| {
                    set.iter()
                        .cloned()
                        .min_by_key(|&bb| self.domtree.block_order(bb))
                })
                .unwrap_or(cond.header)
        };
        let then_entry = entry_of(&cond.then_branch, cond.then_edge);
        let then_region = self.sequence(&cond.then_branch, then_entry, None, false);
        let else_region = if cond.else_branch.is_empty() {
            None
        } else {
            let else_entry = entry_of(&cond.else_branch, else_edge);
            Some(Box::new(self.sequence(
                &cond.else_branch,
                else_entry,
                None,
                false,
            )))
        };
        let blocks = cond.blocks();
        Region::IfThenElse(IfRegion {
            id,
            header: cond.header,
            then_edge: cond.then_edge,
            then_region: Box::new(then_region),
            else_region,
            merge: cond.merge,
            exits: self.exits_of(&blocks),
            blocks,
        })
    }
}
