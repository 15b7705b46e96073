// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{
    program::{Inst, Opcode, Program},
    table::TableKey,
};
use hibitset::BitSet;

/// The set of instructions reachable from a program's entry points.
///
/// Everything the decoder produced but no entry point can reach is considered
/// dead code (or data misinterpreted as code) and is excluded from block
/// construction.
#[derive(Debug, Clone)]
pub struct Reachability {
    reachable: BitSet,
    count: usize,
    dead: Vec<Inst>,
}

impl Reachability {
    /// Trace all reachable instructions from the entry points of a program.
    pub fn new(prog: &Program) -> Self {
        let mut reachable = BitSet::with_capacity(prog.len() as u32);
        let mut count = 0;
        let mut worklist: Vec<Inst> = prog
            .entries()
            .iter()
            .filter_map(|entry| {
                let inst = prog.resolve_entry(entry);
                if inst.is_none() {
                    debug!("Entry point {:?} does not start an instruction", entry);
                }
                inst
            })
            .collect();

        while let Some(inst) = worklist.pop() {
            if reachable.add(inst.index() as u32) {
                continue;
            }
            count += 1;
            let data = &prog[inst];
            let target = prog.target_inst(inst);
            if data.opcode.has_target() && target.is_none() {
                trace!("Unknown target of {} at ${:04X}", data.opcode, data.address);
            }
            let next = match data.opcode {
                Opcode::Branch | Opcode::Call | Opcode::Other => prog.next_inst(inst),
                Opcode::Jump | Opcode::Return => None,
            };
            worklist.extend(target);
            worklist.extend(next);
        }

        let dead: Vec<Inst> = prog
            .insts()
            .filter(|inst| !reachable.contains(inst.index() as u32))
            .collect();
        debug!(
            "{} of {} instructions reachable, {} dead",
            count,
            prog.len(),
            dead.len()
        );
        Self {
            reachable,
            count,
            dead,
        }
    }

    /// Check whether an instruction is reachable.
    pub fn is_reachable(&self, inst: Inst) -> bool {
        self.reachable.contains(inst.index() as u32)
    }

    /// Return the number of reachable instructions.
    pub fn num_reachable(&self) -> usize {
        self.count
    }

    /// Return the unreachable instructions in address order.
    pub fn dead(&self) -> &[Inst] {
        &self.dead
    }
}
