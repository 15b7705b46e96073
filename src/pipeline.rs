// Copyright (c) 2017-2021 Fabian Schuiki

//! The analysis pipeline.
//!
//! Threads the output of every stage into the next one. Program-wide stages
//! (reachability, blocks, edges, call graph) run once; everything after the
//! function CFGs runs per function and fans out across threads if enabled.

use crate::{
    analysis::{
        AnalysisError, CallGraph, Conditionals, DominatorTree, LoopForest, PostDominatorTree,
        PredecessorTable, Reachability,
    },
    block::BasicBlocks,
    cfg::{Cfg, FunctionCfg},
    program::Program,
    region::FunctionRegions,
    structure::FunctionStructure,
    verifier::{Verifier, VerifyFlags},
};
use rayon::prelude::*;
use serde::Serialize;

/// Additional context and configuration for the analyses.
#[derive(Debug, Clone, Copy)]
pub struct PassContext {
    /// Analyze functions in parallel.
    pub parallel: bool,
    /// The invariants to check after each stage.
    pub verify: VerifyFlags,
}

impl Default for PassContext {
    fn default() -> Self {
        Self {
            parallel: true,
            verify: VerifyFlags::ALL,
        }
    }
}

/// The analysis results of a whole program.
#[derive(Debug, Serialize)]
pub struct ProgramAnalysis {
    #[serde(skip)]
    pub reach: Reachability,
    pub blocks: BasicBlocks,
    #[serde(skip)]
    pub cfg: Cfg,
    pub calls: CallGraph,
    /// One result per function, in the order of `cfg.functions`.
    #[serde(serialize_with = "serialize_functions")]
    pub functions: Vec<Result<FunctionAnalysis, AnalysisError>>,
}

impl ProgramAnalysis {
    /// Return an iterator over the functions whose analysis succeeded.
    pub fn analyzed(&self) -> impl Iterator<Item = &FunctionAnalysis> {
        self.functions.iter().filter_map(|f| f.as_ref().ok())
    }

    /// Return an iterator over the functions whose analysis failed.
    pub fn failed(&self) -> impl Iterator<Item = &AnalysisError> {
        self.functions.iter().filter_map(|f| f.as_ref().err())
    }

    /// Find the analysis of a function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionAnalysis> {
        self.analyzed().find(|f| f.cfg.display_name() == name)
    }
}

fn serialize_functions<S: serde::Serializer>(
    functions: &[Result<FunctionAnalysis, AnalysisError>],
    s: S,
) -> Result<S::Ok, S::Error> {
    s.collect_seq(functions.iter().filter_map(|f| f.as_ref().ok()))
}

/// The analysis results of one function.
#[derive(Debug, Serialize)]
pub struct FunctionAnalysis {
    pub cfg: FunctionCfg,
    #[serde(skip)]
    pub preds: PredecessorTable,
    pub domtree: DominatorTree,
    #[serde(skip)]
    pub postdom: PostDominatorTree,
    pub loops: LoopForest,
    pub conds: Conditionals,
    pub regions: FunctionRegions,
    pub structure: FunctionStructure,
}

impl FunctionAnalysis {
    /// Run the per-function stages on a function CFG.
    pub fn new(
        ctx: &PassContext,
        blocks: &BasicBlocks,
        cfg: &FunctionCfg,
    ) -> Result<Self, AnalysisError> {
        debug!("Analyzing {}", cfg.display_name());
        let mut verifier = Verifier::new();
        verifier.set_function(cfg);

        let preds = PredecessorTable::new(cfg);
        let domtree = DominatorTree::new(cfg, &preds)?;
        if ctx.verify.contains(VerifyFlags::DOMINATORS) {
            verifier.verify_domtree(cfg, &domtree);
        }
        let postdom = PostDominatorTree::new(cfg, &domtree)?;
        let loops = LoopForest::new(cfg, blocks, &preds, &domtree);
        if ctx.verify.contains(VerifyFlags::LOOPS) {
            verifier.verify_loops(&domtree, &loops);
        }
        let conds = Conditionals::new(cfg, &domtree, &postdom, &loops);
        if ctx.verify.contains(VerifyFlags::CONDITIONALS) {
            verifier.verify_conds(&conds);
        }
        let regions = FunctionRegions::new(cfg, &domtree, &loops, &conds);
        if ctx.verify.contains(VerifyFlags::REGIONS) {
            verifier.verify_regions(cfg, &regions);
        }
        let structure = FunctionStructure::new(cfg, &loops, &regions);
        if ctx.verify.contains(VerifyFlags::STRUCTURE) {
            verifier.verify_structure(cfg, &structure);
        }
        verifier.finish()?;

        Ok(Self {
            cfg: cfg.clone(),
            preds,
            domtree,
            postdom,
            loops,
            conds,
            regions,
            structure,
        })
    }
}

/// Run all analyses on a program.
///
/// Fails only if the program-wide checks selected in `ctx` find a violation.
/// Failures in individual functions are reported per function.
pub fn analyze(ctx: &PassContext, prog: &Program) -> Result<ProgramAnalysis, AnalysisError> {
    let reach = Reachability::new(prog);
    let blocks = BasicBlocks::new(prog, &reach);
    let cfg = Cfg::new(prog, &blocks);
    let calls = CallGraph::new(&blocks, &cfg);

    let mut verifier = Verifier::new();
    if ctx.verify.contains(VerifyFlags::BLOCKS) {
        verifier.verify_blocks(prog, &reach, &blocks);
    }
    if ctx.verify.contains(VerifyFlags::EDGES) {
        verifier.verify_edges(&blocks, &cfg);
    }
    verifier.finish()?;

    let run = |func: &FunctionCfg| {
        let result = FunctionAnalysis::new(ctx, &blocks, func);
        if let Err(ref e) = result {
            warn!("{}", e);
        }
        result
    };
    let functions = if ctx.parallel {
        cfg.functions.par_iter().map(run).collect()
    } else {
        cfg.functions.iter().map(run).collect()
    };
    info!(
        "Analyzed {} functions, {} blocks, {} unreachable instructions",
        cfg.functions.len(),
        blocks.len(),
        reach.dead().len()
    );

    Ok(ProgramAnalysis {
        reach,
        blocks,
        cfg,
        calls,
        functions,
    })
}
