// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{block::Block, cfg::FunctionCfg};
use std::collections::{BTreeSet, HashMap};

/// A table of basic block predecessors within a function.
#[derive(Debug, Clone)]
pub struct PredecessorTable {
    pred: HashMap<Block, BTreeSet<Block>>,
    succ: HashMap<Block, BTreeSet<Block>>,
}

impl PredecessorTable {
    /// Compute the predecessor table for a function.
    ///
    /// Only edges with a concrete destination inside the function are
    /// considered.
    pub fn new(func: &FunctionCfg) -> Self {
        let mut pred: HashMap<Block, BTreeSet<Block>> = HashMap::new();
        let mut succ = HashMap::new();
        for &bb in &func.blocks {
            pred.insert(bb, BTreeSet::new());
        }
        for &bb in &func.blocks {
            let to: BTreeSet<Block> = func.succ(bb).filter(|&to| func.contains(to)).collect();
            for &to_bb in &to {
                if let Some(set) = pred.get_mut(&to_bb) {
                    set.insert(bb);
                }
            }
            succ.insert(bb, to);
        }
        Self { pred, succ }
    }

    /// Get the successors of a block.
    pub fn succ_set(&self, bb: Block) -> &BTreeSet<Block> {
        &self.succ[&bb]
    }

    /// Get the predecessors of a block.
    pub fn pred(&self, bb: Block) -> impl Iterator<Item = Block> + Clone + '_ {
        self.pred[&bb].iter().cloned()
    }
}
