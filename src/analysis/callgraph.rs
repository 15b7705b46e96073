// Copyright (c) 2017-2021 Fabian Schuiki

//! Call graph construction.
//!
//! Collects the subroutine calls in every function and links callers to
//! callees by their entry blocks. A set of functions calling each other in a
//! circle, or a single function calling itself, forms a call cycle.

use crate::{
    block::{BasicBlocks, Block},
    cfg::Cfg,
    program::{Address, Opcode},
    util::write_set,
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
};

/// A subroutine call instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CallSite {
    /// Entry of the calling function.
    pub caller: Block,
    /// The block ending in the call.
    pub block: Block,
    /// Address of the call instruction.
    pub address: Address,
    /// Entry of the called function. `None` if the target is unknown or not
    /// a function entry.
    pub callee: Option<Block>,
    /// The decoded target operand.
    pub target: Option<Address>,
}

/// The calls into and out of one function.
#[derive(Clone, Debug, Serialize)]
pub struct FunctionCalls {
    pub entry: Block,
    pub name: String,
    pub callees: BTreeSet<Block>,
    pub callers: BTreeSet<Block>,
    pub sites: Vec<CallSite>,
    /// Whether the function calls itself directly.
    pub recursive: bool,
}

/// The call graph of a program.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CallGraph {
    functions: Vec<FunctionCalls>,
    #[serde(skip)]
    by_entry: HashMap<Block, usize>,
    /// Sets of mutually recursive functions, including directly recursive
    /// ones.
    pub cycles: Vec<BTreeSet<Block>>,
    /// Functions no call site targets.
    pub never_called: BTreeSet<Block>,
    /// Whether some call site has no known callee.
    pub indirect_calls: bool,
}

impl CallGraph {
    /// Build the call graph from the functions of a program.
    pub fn new(blocks: &BasicBlocks, cfg: &Cfg) -> Self {
        let entries: HashSet<Block> = cfg.functions.iter().map(|f| f.entry).collect();
        let mut functions = vec![];
        let mut by_entry = HashMap::new();
        for func in &cfg.functions {
            let sites: Vec<CallSite> = func
                .blocks
                .iter()
                .filter(|&&bb| blocks[bb].term == Opcode::Call)
                .map(|&bb| CallSite {
                    caller: func.entry,
                    block: bb,
                    address: blocks[bb].end,
                    callee: blocks[bb]
                        .targets
                        .iter()
                        .cloned()
                        .find(|t| entries.contains(t)),
                    target: blocks[bb].target_address,
                })
                .collect();
            let callees: BTreeSet<Block> = sites.iter().filter_map(|s| s.callee).collect();
            by_entry.insert(func.entry, functions.len());
            functions.push(FunctionCalls {
                entry: func.entry,
                name: func.display_name(),
                recursive: callees.contains(&func.entry),
                callees,
                callers: BTreeSet::new(),
                sites,
            });
        }

        let edges: Vec<(Block, Block)> = functions
            .iter()
            .flat_map(|f| f.callees.iter().map(move |&c| (f.entry, c)))
            .collect();
        for (caller, callee) in edges {
            if let Some(&i) = by_entry.get(&callee) {
                functions[i].callers.insert(caller);
            }
        }

        let never_called = functions
            .iter()
            .filter(|f| f.callers.is_empty())
            .map(|f| f.entry)
            .collect();
        let indirect_calls = functions
            .iter()
            .flat_map(|f| f.sites.iter())
            .any(|s| s.callee.is_none());

        let mut tarjan = Tarjan {
            functions: &functions,
            by_entry: &by_entry,
            next: 0,
            index: vec![None; functions.len()],
            low: vec![0; functions.len()],
            stack: vec![],
            on_stack: vec![false; functions.len()],
            cycles: vec![],
        };
        for v in 0..functions.len() {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }
        let cycles = tarjan.cycles;

        debug!(
            "Built call graph of {} functions with {} cycles",
            functions.len(),
            cycles.len()
        );
        Self {
            functions,
            by_entry,
            cycles,
            never_called,
            indirect_calls,
        }
    }

    /// Get the calls of the function with the given entry block.
    pub fn get(&self, entry: Block) -> Option<&FunctionCalls> {
        self.by_entry.get(&entry).map(|&i| &self.functions[i])
    }

    /// Return an iterator over all functions, in entry address order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionCalls> {
        self.functions.iter()
    }

    /// Return the length of the shortest call chain from a function that is
    /// never called. `None` if there is no such chain.
    pub fn call_depth(&self, entry: Block) -> Option<usize> {
        let mut seen: HashSet<Block> = self.never_called.iter().cloned().collect();
        let mut queue: VecDeque<(Block, usize)> =
            self.never_called.iter().map(|&f| (f, 0)).collect();
        while let Some((f, depth)) = queue.pop_front() {
            if f == entry {
                return Some(depth);
            }
            for &callee in self.get(f).into_iter().flat_map(|c| c.callees.iter()) {
                if seen.insert(callee) {
                    queue.push_back((callee, depth + 1));
                }
            }
        }
        None
    }

    /// Return all functions called directly or indirectly by a function.
    pub fn transitive_callees(&self, entry: Block) -> BTreeSet<Block> {
        let mut result = BTreeSet::new();
        let mut worklist = vec![entry];
        while let Some(f) = worklist.pop() {
            for &callee in self.get(f).into_iter().flat_map(|c| c.callees.iter()) {
                if result.insert(callee) {
                    worklist.push(callee);
                }
            }
        }
        result
    }
}

/// Tarjan's strongly connected components over the callee relation.
struct Tarjan<'a> {
    functions: &'a [FunctionCalls],
    by_entry: &'a HashMap<Block, usize>,
    next: usize,
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    stack: Vec<usize>,
    on_stack: Vec<bool>,
    cycles: Vec<BTreeSet<Block>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.low[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let functions = self.functions;
        for callee in &functions[v].callees {
            let w = match self.by_entry.get(callee) {
                Some(&w) => w,
                None => continue,
            };
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.low[v] = self.low[v].min(self.low[w]);
                }
                Some(iw) if self.on_stack[w] => self.low[v] = self.low[v].min(iw),
                Some(_) => (),
            }
        }

        if self.index[v] == Some(self.low[v]) {
            let mut scc = BTreeSet::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                scc.insert(functions[w].entry);
                if w == v {
                    break;
                }
            }
            if scc.len() > 1 || functions[v].recursive {
                self.cycles.push(scc);
            }
        }
    }
}

impl fmt::Display for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for func in &self.functions {
            write!(f, "{} ({}) calls ", func.name, func.entry)?;
            write_set(f, &func.callees)?;
            write!(f, " called by ")?;
            write_set(f, &func.callers)?;
            if func.recursive {
                write!(f, " recursive")?;
            }
            writeln!(f)?;
            for site in func.sites.iter().filter(|s| s.callee.is_none()) {
                match site.target {
                    Some(t) => writeln!(f, "  ${:04X} calls ${:04X}", site.address, t)?,
                    None => writeln!(f, "  ${:04X} calls ?", site.address)?,
                }
            }
        }
        for cycle in &self.cycles {
            write!(f, "cycle ")?;
            write_set(f, cycle)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::Reachability,
        program::{EntryKind, EntryPoint, InstData, Program},
    };

    fn calls_of(insts: Vec<InstData>, entries: Vec<EntryPoint>) -> (BasicBlocks, CallGraph) {
        let prog = Program::new(insts, entries);
        let reach = Reachability::new(&prog);
        let blocks = BasicBlocks::new(&prog, &reach);
        let cfg = Cfg::new(&prog, &blocks);
        let calls = CallGraph::new(&blocks, &cfg);
        (blocks, calls)
    }

    #[test]
    fn mutual_recursion_forms_a_cycle() {
        // main calls a; a calls b and itself; b calls a.
        let (blocks, calls) = calls_of(
            vec![
                InstData::new(0x10, Opcode::Call, 3).with_target(0x20),
                InstData::new(0x13, Opcode::Return, 1),
                InstData::new(0x20, Opcode::Call, 3).with_target(0x30),
                InstData::new(0x23, Opcode::Call, 3).with_target(0x20),
                InstData::new(0x26, Opcode::Return, 1),
                InstData::new(0x30, Opcode::Call, 3).with_target(0x20),
                InstData::new(0x33, Opcode::Return, 1),
            ],
            vec![
                EntryPoint::at(0x10, EntryKind::Exported),
                EntryPoint::at(0x20, EntryKind::CallTarget),
                EntryPoint::at(0x30, EntryKind::CallTarget),
            ],
        );
        let main = blocks.block_at(0x10).unwrap();
        let a = blocks.block_at(0x20).unwrap();
        let b = blocks.block_at(0x30).unwrap();

        assert_eq!(
            calls.get(main).unwrap().callees,
            vec![a].into_iter().collect()
        );
        assert!(calls.get(a).unwrap().recursive);
        assert!(!calls.get(b).unwrap().recursive);
        assert_eq!(
            calls.get(a).unwrap().callers,
            vec![main, a, b].into_iter().collect()
        );
        assert_eq!(calls.get(a).unwrap().sites.len(), 2);
        assert_eq!(calls.cycles, vec![vec![a, b].into_iter().collect()]);
        assert_eq!(calls.never_called, vec![main].into_iter().collect());
        assert!(!calls.indirect_calls);
        assert_eq!(calls.call_depth(main), Some(0));
        assert_eq!(calls.call_depth(b), Some(2));
        assert_eq!(
            calls.transitive_callees(main),
            vec![a, b].into_iter().collect()
        );
    }

    #[test]
    fn unknown_callee_is_indirect() {
        let (blocks, calls) = calls_of(
            vec![
                InstData::new(0x10, Opcode::Call, 3),
                InstData::new(0x13, Opcode::Call, 3).with_target(0x40),
                InstData::new(0x16, Opcode::Return, 1),
                InstData::new(0x40, Opcode::Return, 1),
            ],
            vec![EntryPoint::at(0x10, EntryKind::Exported)],
        );
        let main = blocks.block_at(0x10).unwrap();
        let sites = &calls.get(main).unwrap().sites;
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].callee, None);
        assert_eq!(sites[0].target, None);
        assert_eq!(sites[1].callee, None);
        assert_eq!(sites[1].target, Some(0x40));
        assert!(calls.indirect_calls);
        assert!(calls.cycles.is_empty());
    }
}
