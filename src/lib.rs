// Copyright (c) 2017-2021 Fabian Schuiki

//! Control flow recovery and structuring for 6502 machine code. This library
//! turns decoded instructions into basic blocks, function control flow graphs,
//! dominator trees, loops, conditionals, region trees, and finally structured
//! statements with `goto` as a last resort.

#[macro_use]
extern crate log;

#[macro_use]
pub mod table;
pub mod analysis;
pub mod block;
pub mod cfg;
pub mod listing;
pub mod pipeline;
pub mod program;
pub mod region;
pub mod structure;
pub mod util;
pub mod verifier;

pub use crate::{
    listing::{parse_listing, ListingError},
    pipeline::{analyze, FunctionAnalysis, PassContext, ProgramAnalysis},
    program::{Address, EntryKind, EntryPoint, InstData, Interrupt, Opcode, Program},
};
