// Copyright (c) 2017-2021 Fabian Schuiki

//! Verification of analysis results.
//!
//! This module checks the invariants the analyses are supposed to uphold:
//! blocks partition the reachable instructions, edges follow the terminators,
//! the dominator tree is well-formed, back edges and loop headers agree,
//! conditionals have disjoint sides, and the region tree and structured code
//! cover every block exactly once. A violation indicates a bug in an
//! analysis, not malformed input.

use crate::{
    analysis::{Conditionals, DominatorTree, LoopForest, Reachability},
    block::{BasicBlocks, Block},
    cfg::{block_edges, Cfg, FunctionCfg},
    program::Program,
    region::{FunctionRegions, Region},
    structure::FunctionStructure,
};
use bitflags::bitflags;
use itertools::Itertools;
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    ops::{Deref, DerefMut},
};

bitflags! {
    /// A set of flags selecting the checks to perform.
    #[derive(Default)]
    pub struct VerifyFlags: u8 {
        /// Blocks partition the reachable instructions.
        const BLOCKS = 0b0000001;
        /// Edges match the block terminators.
        const EDGES = 0b0000010;
        /// The dominator tree is well-formed.
        const DOMINATORS = 0b0000100;
        /// Back edges and loop headers agree.
        const LOOPS = 0b0001000;
        /// Conditionals have disjoint sides.
        const CONDITIONALS = 0b0010000;
        /// The region tree covers every block once.
        const REGIONS = 0b0100000;
        /// The structured code contains every block once.
        const STRUCTURE = 0b1000000;
        /// All checks.
        const ALL = 0b1111111;
    }
}

/// An analysis verifier.
///
/// The `Verifier` acts as a context to call the various checking functions
/// on. It keeps track of errors.
#[derive(Default)]
pub struct Verifier {
    errors: VerifierErrors,
    function: Option<String>,
}

impl Verifier {
    /// Create a new verifier.
    pub fn new() -> Self {
        Default::default()
    }

    /// Attribute subsequent errors to a function.
    pub fn set_function(&mut self, func: &FunctionCfg) {
        self.function = Some(func.display_name());
    }

    fn error(&mut self, object: Option<String>, message: String) {
        self.errors.push(VerifierError {
            function: self.function.clone(),
            object,
            message,
        });
    }

    /// Check that every reachable instruction is in exactly one block, every
    /// unreachable one in none, and that blocks are straight-line code.
    pub fn verify_blocks(&mut self, prog: &Program, reach: &Reachability, blocks: &BasicBlocks) {
        let mut owners: HashMap<_, Vec<Block>> = HashMap::new();
        for bb in blocks.blocks() {
            let data = &blocks[bb];
            if data.insts.first() != Some(&data.leader) || data.insts.last() != Some(&data.last) {
                self.error(
                    Some(bb.to_string()),
                    format!(
                        "leader {} and last {} do not match the instruction list",
                        data.leader, data.last
                    ),
                );
            }
            for &inst in &data.insts {
                owners.entry(inst).or_default().push(bb);
                if inst != data.last && prog[inst].opcode.is_terminator() {
                    self.error(
                        Some(bb.to_string()),
                        format!("terminator {} in the middle of the block", inst),
                    );
                }
            }
            for pair in data.insts.windows(2) {
                if prog.next_inst(pair[0]) != Some(pair[1]) {
                    self.error(
                        Some(bb.to_string()),
                        format!("{} does not directly follow {}", pair[1], pair[0]),
                    );
                }
            }
        }
        for inst in prog.insts() {
            let owned = owners.get(&inst).map(|o| o.len()).unwrap_or(0);
            let reachable = reach.is_reachable(inst);
            if reachable && owned != 1 {
                self.error(
                    Some(inst.to_string()),
                    format!("reachable instruction is in {} blocks", owned),
                );
            }
            if !reachable && owned != 0 {
                self.error(
                    Some(inst.to_string()),
                    format!(
                        "unreachable instruction is in {}",
                        owners.get(&inst).into_iter().flatten().join(", ")
                    ),
                );
            }
        }
    }

    /// Check that each block's edges are exactly those its terminator
    /// produces.
    pub fn verify_edges(&mut self, blocks: &BasicBlocks, cfg: &Cfg) {
        for bb in blocks.blocks() {
            let expected = block_edges(blocks, bb);
            if cfg.outgoing(bb) != expected.as_slice() {
                self.error(
                    Some(bb.to_string()),
                    format!(
                        "edges {:?} do not match terminator {}",
                        cfg.outgoing(bb),
                        blocks[bb].term
                    ),
                );
            }
        }
    }

    /// Check the dominator tree of a function.
    pub fn verify_domtree(&mut self, func: &FunctionCfg, domtree: &DominatorTree) {
        let entry = func.entry;
        if domtree.dominators(entry) != vec![entry] {
            self.error(
                Some(entry.to_string()),
                format!("entry is dominated by {:?}", domtree.dominators(entry)),
            );
        }
        for bb in domtree.blocks_rpo() {
            if bb == entry {
                continue;
            }
            let idom = match domtree.idom(bb) {
                Some(idom) => idom,
                None => {
                    self.error(Some(bb.to_string()), "no immediate dominator".to_string());
                    continue;
                }
            };
            if !domtree.strictly_dominates(idom, bb) {
                self.error(
                    Some(bb.to_string()),
                    format!("immediate dominator {} does not dominate", idom),
                );
            }
            for other in domtree.dominators(bb) {
                if other != bb && !domtree.dominates(other, idom) {
                    self.error(
                        Some(bb.to_string()),
                        format!(
                            "dominator {} does not dominate immediate dominator {}",
                            other, idom
                        ),
                    );
                }
            }
        }
        for edge in func.edges() {
            let to = match edge.to {
                Some(to) => to,
                None => continue,
            };
            let listed = domtree.back_edges().contains(edge);
            if domtree.dominates(to, edge.from) != listed {
                self.error(
                    Some(edge.to_string()),
                    format!(
                        "listed as back edge: {}, target dominates source: {}",
                        listed, !listed
                    ),
                );
            }
        }
    }

    /// Check that back edges and loop headers agree, and that headers
    /// dominate their loop bodies.
    pub fn verify_loops(&mut self, domtree: &DominatorTree, loops: &LoopForest) {
        for edge in domtree.back_edges() {
            let header = match edge.to {
                Some(h) => h,
                None => continue,
            };
            match loops.is_header(header) {
                Some(id) if loops[id].latches.contains(&edge.from) => (),
                _ => self.error(
                    Some(edge.to_string()),
                    format!("back edge does not belong to a loop headed by {}", header),
                ),
            }
        }
        for lp in loops.loops() {
            if !domtree.back_edges().iter().any(|e| e.to == Some(lp.header)) {
                self.error(
                    Some(lp.id.to_string()),
                    format!("header {} has no back edge", lp.header),
                );
            }
            for &bb in &lp.body {
                if !domtree.dominates(lp.header, bb) {
                    self.error(
                        Some(lp.id.to_string()),
                        format!("header {} does not dominate {}", lp.header, bb),
                    );
                }
            }
        }
    }

    /// Check that the sides of every conditional are disjoint.
    pub fn verify_conds(&mut self, conds: &Conditionals) {
        for cond in conds.iter() {
            let both: Vec<_> = cond.then_branch.intersection(&cond.else_branch).collect();
            if !both.is_empty() {
                self.error(
                    Some(cond.id.to_string()),
                    format!("{:?} on both sides", both),
                );
            }
            if cond.branches_contain(cond.header) {
                self.error(
                    Some(cond.id.to_string()),
                    format!("header {} on a side", cond.header),
                );
            }
            if let Some(merge) = cond.merge {
                if cond.branches_contain(merge) {
                    self.error(
                        Some(cond.id.to_string()),
                        format!("merge point {} on a side", merge),
                    );
                }
            }
        }
    }

    /// Check that every block of the function is in exactly one leaf of the
    /// region tree, and that composites own exactly their children's blocks.
    pub fn verify_regions(&mut self, func: &FunctionCfg, regions: &FunctionRegions) {
        let mut seen = BTreeSet::new();
        for bb in regions.root.leaves() {
            if !seen.insert(bb) {
                self.error(
                    Some(bb.to_string()),
                    "block owned by two regions".to_string(),
                );
            }
        }
        let all: BTreeSet<Block> = func.blocks.iter().cloned().collect();
        if seen != all {
            let diff: Vec<_> = seen.symmetric_difference(&all).collect();
            self.error(None, format!("regions and function differ in {:?}", diff));
        }
        self.verify_region_blocks(&regions.root);
    }

    fn verify_region_blocks(&mut self, region: &Region) {
        let children = region.children();
        if children.is_empty() {
            return;
        }
        let mut union: BTreeSet<Block> = children.iter().flat_map(|c| c.blocks()).collect();
        if let Region::IfThenElse(r) = region {
            union.insert(r.header);
        }
        if union != region.blocks() {
            self.error(
                Some(region.entry().to_string()),
                format!(
                    "region blocks differ from the union of its {} children",
                    children.len()
                ),
            );
        }
        for child in children {
            self.verify_region_blocks(child);
        }
    }

    /// Check that the structured code contains every block exactly once and
    /// expresses every unresolved jump of the function.
    pub fn verify_structure(&mut self, func: &FunctionCfg, structure: &FunctionStructure) {
        let mut counts: HashMap<Block, usize> = HashMap::new();
        for bb in structure.block_codes() {
            *counts.entry(bb).or_insert(0) += 1;
        }
        for &bb in &func.blocks {
            let n = counts.remove(&bb).unwrap_or(0);
            if n != 1 {
                self.error(Some(bb.to_string()), format!("code emitted {} times", n));
            }
        }
        for bb in counts.keys() {
            self.error(
                Some(bb.to_string()),
                "code of foreign block emitted".to_string(),
            );
        }
        for u in &func.unresolved {
            let n = structure.unresolved.iter().filter(|&x| x == u).count();
            if n != 1 {
                self.error(
                    Some(u.from.to_string()),
                    format!("unresolved jump {} emitted {} times", u, n),
                );
            }
        }
        let clean = structure.gotos.is_empty() && structure.unresolved.is_empty();
        if structure.fully_structured != clean {
            self.error(
                None,
                format!(
                    "structured flag disagrees with {} gotos and {} unresolved jumps",
                    structure.gotos.len(),
                    structure.unresolved.len()
                ),
            );
        }
    }

    /// Finish verification and return the result.
    ///
    /// Consumes the verifier.
    pub fn finish(self) -> Result<(), VerifierErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    /// Finish verification and panic if errors occurred.
    ///
    /// Consumes the verifier.
    pub fn finish_panic(self) {
        match self.finish() {
            Ok(()) => (),
            Err(errs) => panic!("Verification failed:\n{}", errs),
        }
    }
}

/// A verification error.
#[derive(Debug)]
pub struct VerifierError {
    /// The function within which the error occurred.
    pub function: Option<String>,
    /// The object which caused the error.
    pub object: Option<String>,
    /// The error message.
    pub message: String,
}

impl Display for VerifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(ref function) = self.function {
            write!(f, "{}: ", function)?;
        }
        if let Some(ref object) = self.object {
            write!(f, "{}: ", object)?;
        }
        write!(f, "{}", self.message)?;
        Ok(())
    }
}

/// A list of verification errors.
#[derive(Debug, Default)]
pub struct VerifierErrors(pub Vec<VerifierError>);

impl Deref for VerifierErrors {
    type Target = Vec<VerifierError>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VerifierErrors {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for VerifierErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for err in self.iter() {
            writeln!(f, "- {}", err)?;
        }
        Ok(())
    }
}
