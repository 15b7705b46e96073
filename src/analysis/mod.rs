// Copyright (c) 2017-2021 Fabian Schuiki

//! Analyses on function control flow graphs.
//!
//! This module implements the graph analyses control flow structuring is built
//! on: reachability, predecessor tables, dominators, natural loops, and
//! conditionals. The call graph links the functions of a program.

use crate::{cfg::FunctionCfg, verifier::VerifierErrors};
use std::fmt;

mod callgraph;
mod conds;
mod domtree;
mod loops;
mod preds;
mod reach;

pub use self::callgraph::*;
pub use self::conds::*;
pub use self::domtree::*;
pub use self::loops::*;
pub use self::preds::*;
pub use self::reach::*;

/// A violated internal invariant that aborts the analysis of a function.
///
/// Malformed input never produces this error; it indicates a bug in one of
/// the analyses.
#[derive(Debug, Clone)]
pub struct AnalysisError {
    /// The function whose analysis failed.
    pub function: Option<String>,
    /// The error message.
    pub message: String,
}

impl AnalysisError {
    /// Create a new error for a function.
    pub fn new(func: &FunctionCfg, message: impl Into<String>) -> Self {
        Self {
            function: Some(func.display_name()),
            message: message.into(),
        }
    }
}

impl From<VerifierErrors> for AnalysisError {
    fn from(errs: VerifierErrors) -> Self {
        Self {
            function: errs.first().and_then(|e| e.function.clone()),
            message: format!("verification failed:\n{}", errs),
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref function) = self.function {
            write!(f, "{}: ", function)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AnalysisError {}
