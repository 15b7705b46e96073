// Copyright (c) 2017-2021 Fabian Schuiki

//! Control flow structuring.
//!
//! Lowers the region tree of a function into nested structured statements.
//! The lowering keeps track of the block that executes next when control falls
//! out of the statements currently being produced (the *follow* block) and of
//! the loops it is nested in. Every control transfer of a block is then
//! expressed as the cheapest construct that preserves its meaning:
//!
//! - nothing, if it goes to the follow block;
//! - `continue` or `break`, if it goes to the header or exit of an enclosing
//!   loop, labeled if that loop is not the innermost one;
//! - `return`, if it leaves the function, or a tail call if it jumps to the
//!   entry of another function;
//! - `goto`, otherwise.
//!
//! A jump or taken branch whose destination is unknown becomes an explicit
//! unresolved `goto`, so control never falls into the code lowered next.
//!
//! Loops are first lowered as `while (true)` and then reshaped into `while` or
//! `do ... while` if the condition is found at the top or bottom of the body.

use crate::{
    analysis::{LoopForest, LoopId, LoopKind},
    block::Block,
    cfg::{CfgEdge, EdgeKind, FunctionCfg, UnresolvedTransfer},
    region::{FunctionRegions, IfRegion, LoopRegion, Region},
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// The condition of an `if` or loop statement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Condition {
    /// Always true.
    Always,
    /// The outcome of the conditional branch ending `block`, i.e. true if the
    /// branch is taken. The block's code has executed right before.
    Branch { block: Block, negated: bool },
}

impl Condition {
    /// Create the condition a block's branch is taken under.
    pub fn taken(block: Block) -> Self {
        Condition::Branch {
            block,
            negated: false,
        }
    }

    /// Return the logical negation of the condition.
    ///
    /// `Always` has no negation that is useful for structuring and is returned
    /// unchanged.
    pub fn negate(self) -> Self {
        match self {
            Condition::Always => Condition::Always,
            Condition::Branch { block, negated } => Condition::Branch {
                block,
                negated: !negated,
            },
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "true"),
            Condition::Branch {
                block,
                negated: false,
            } => write!(f, "{}", block),
            Condition::Branch {
                block,
                negated: true,
            } => write!(f, "!{}", block),
        }
    }
}

/// A statement label.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Label {
    /// Names a loop for labeled `break` and `continue`.
    Loop(LoopId),
    /// Marks the position of a block for `goto`.
    Block(Block),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Label::Loop(id) => write!(f, "{}", id),
            Label::Block(bb) => write!(f, "{}", bb),
        }
    }
}

/// A structured control flow statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Stmt {
    If {
        condition: Condition,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// A loop testing its condition at the top. The `prelude` executes before
    /// every test, including the one that ends the loop.
    While {
        condition: Condition,
        prelude: Vec<Stmt>,
        body: Vec<Stmt>,
    },
    /// A loop testing its condition at the bottom.
    DoWhile {
        body: Vec<Stmt>,
        condition: Condition,
    },
    /// Leave a loop. Without label, the innermost one.
    Break(Option<LoopId>),
    /// Start the next iteration of a loop. Without label, the innermost one.
    Continue(Option<LoopId>),
    Return,
    /// The instructions of a basic block, excluding control flow.
    BlockCode(Block),
    Sequence(Vec<Stmt>),
    Labeled { label: Label, body: Vec<Stmt> },
    /// An unstructured jump to the labeled position of a block.
    Goto { target: Block, reason: String },
    /// A jump to the entry of another function.
    TailCall(Block),
    /// A jump or taken branch to a destination that is not a known block.
    GotoUnresolved(UnresolvedTransfer),
}

impl Stmt {
    fn write_indented(&self, f: &mut fmt::Formatter, indent: usize) -> fmt::Result {
        let pad = "    ".repeat(indent);
        match self {
            Stmt::If {
                condition,
                then_body,
                else_body,
            } => {
                writeln!(f, "{}if ({}) {{", pad, condition)?;
                write_stmts(f, then_body, indent + 1)?;
                if let Some(else_body) = else_body {
                    writeln!(f, "{}}} else {{", pad)?;
                    write_stmts(f, else_body, indent + 1)?;
                }
                writeln!(f, "{}}}", pad)
            }
            Stmt::While {
                condition,
                prelude,
                body,
            } => {
                if prelude.is_empty() {
                    writeln!(f, "{}while ({}) {{", pad, condition)?;
                } else {
                    writeln!(f, "{}while ({{", pad)?;
                    write_stmts(f, prelude, indent + 2)?;
                    writeln!(f, "{}    {}", pad, condition)?;
                    writeln!(f, "{}}}) {{", pad)?;
                }
                write_stmts(f, body, indent + 1)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::DoWhile { body, condition } => {
                writeln!(f, "{}do {{", pad)?;
                write_stmts(f, body, indent + 1)?;
                writeln!(f, "{}}} while ({})", pad, condition)
            }
            Stmt::Break(None) => writeln!(f, "{}break", pad),
            Stmt::Break(Some(id)) => writeln!(f, "{}break {}", pad, id),
            Stmt::Continue(None) => writeln!(f, "{}continue", pad),
            Stmt::Continue(Some(id)) => writeln!(f, "{}continue {}", pad, id),
            Stmt::Return => writeln!(f, "{}return", pad),
            Stmt::BlockCode(bb) => writeln!(f, "{}{}", pad, bb),
            Stmt::Sequence(stmts) => write_stmts(f, stmts, indent),
            Stmt::Labeled { label, body } => {
                writeln!(f, "{}{}:", pad, label)?;
                write_stmts(f, body, indent)
            }
            Stmt::Goto { target, reason } => writeln!(f, "{}goto {} // {}", pad, target, reason),
            Stmt::TailCall(callee) => writeln!(f, "{}tailcall {}", pad, callee),
            Stmt::GotoUnresolved(u) => writeln!(f, "{}goto ? // unresolved {}", pad, u),
        }
    }

    /// Call a function on this statement and everything nested in it.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Stmt)) {
        f(self);
        for child in self.nested() {
            child.walk(f);
        }
    }

    fn nested(&self) -> Vec<&Stmt> {
        match self {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => then_body
                .iter()
                .chain(else_body.iter().flat_map(|b| b.iter()))
                .collect(),
            Stmt::While { prelude, body, .. } => prelude.iter().chain(body.iter()).collect(),
            Stmt::DoWhile { body, .. } => body.iter().collect(),
            Stmt::Sequence(body) | Stmt::Labeled { body, .. } => body.iter().collect(),
            _ => vec![],
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

fn write_stmts(f: &mut fmt::Formatter, stmts: &[Stmt], indent: usize) -> fmt::Result {
    for stmt in stmts {
        stmt.write_indented(f, indent)?;
    }
    Ok(())
}

/// A control transfer that could not be structured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GotoRecord {
    pub from: Block,
    pub target: Block,
    pub reason: String,
}

/// Counts of the statements in a structured function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StructureStats {
    pub blocks: usize,
    pub ifs: usize,
    pub loops: usize,
    pub breaks: usize,
    pub continues: usize,
    pub returns: usize,
    pub tail_calls: usize,
    pub gotos: usize,
    pub unresolved: usize,
}

/// The structured statements of a function.
#[derive(Clone, Debug, Serialize)]
pub struct FunctionStructure {
    pub entry: Block,
    pub body: Vec<Stmt>,
    /// The jumps that had to be expressed as `goto`.
    pub gotos: Vec<GotoRecord>,
    /// The jumps to unknown destinations, in the order they were lowered.
    pub unresolved: Vec<UnresolvedTransfer>,
    /// Whether the function is free of `goto`, resolved or not.
    pub fully_structured: bool,
}

impl FunctionStructure {
    /// Structure a function from its region tree.
    pub fn new(func: &FunctionCfg, loops: &LoopForest, regions: &FunctionRegions) -> Self {
        let t0 = time::precise_time_ns();
        let mut lower = Lowering {
            func,
            loops,
            frames: vec![],
            gotos: vec![],
            unresolved: vec![],
            labeled_loops: HashSet::new(),
        };
        let mut body = lower.region(&regions.root, None);

        let targets: BTreeSet<Block> = lower.gotos.iter().map(|g| g.target).collect();
        if !targets.is_empty() {
            label_blocks(&mut body, &targets);
        }
        let gotos = lower.gotos;
        let unresolved = lower.unresolved;
        let t1 = time::precise_time_ns();
        STRUCTURING_TIME.fetch_add(t1 - t0, Ordering::Relaxed);

        let fully_structured = gotos.is_empty() && unresolved.is_empty();
        if fully_structured {
            debug!("Structured {} without goto", func.display_name());
        } else {
            debug!(
                "Structured {} with {} goto(s), {} unresolved",
                func.display_name(),
                gotos.len(),
                unresolved.len()
            );
        }
        Self {
            entry: func.entry,
            fully_structured,
            body,
            gotos,
            unresolved,
        }
    }

    /// Count the statements by kind.
    pub fn stats(&self) -> StructureStats {
        let mut stats = StructureStats::default();
        for stmt in &self.body {
            stmt.walk(&mut |s| match s {
                Stmt::BlockCode(_) => stats.blocks += 1,
                Stmt::If { .. } => stats.ifs += 1,
                Stmt::While { .. } | Stmt::DoWhile { .. } => stats.loops += 1,
                Stmt::Break(_) => stats.breaks += 1,
                Stmt::Continue(_) => stats.continues += 1,
                Stmt::Return => stats.returns += 1,
                Stmt::TailCall(_) => stats.tail_calls += 1,
                Stmt::Goto { .. } => stats.gotos += 1,
                Stmt::GotoUnresolved(_) => stats.unresolved += 1,
                _ => (),
            });
        }
        stats
    }

    /// Return all `BlockCode` blocks in the order they appear.
    pub fn block_codes(&self) -> Vec<Block> {
        let mut blocks = vec![];
        for stmt in &self.body {
            stmt.walk(&mut |s| {
                if let Stmt::BlockCode(bb) = s {
                    blocks.push(*bb);
                }
            });
        }
        blocks
    }
}

impl fmt::Display for FunctionStructure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_stmts(f, &self.body, 0)
    }
}

/// Wrap the code of the given blocks in labels.
fn label_blocks(stmts: &mut Vec<Stmt>, targets: &BTreeSet<Block>) {
    for stmt in stmts.iter_mut() {
        match stmt {
            Stmt::BlockCode(bb) if targets.contains(bb) => {
                let bb = *bb;
                *stmt = Stmt::Labeled {
                    label: Label::Block(bb),
                    body: vec![Stmt::BlockCode(bb)],
                };
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                label_blocks(then_body, targets);
                if let Some(else_body) = else_body {
                    label_blocks(else_body, targets);
                }
            }
            Stmt::While { prelude, body, .. } => {
                label_blocks(prelude, targets);
                label_blocks(body, targets);
            }
            Stmt::DoWhile { body, .. } => label_blocks(body, targets),
            Stmt::Sequence(body) => label_blocks(body, targets),
            Stmt::Labeled { label, body } => {
                if let Label::Loop(_) = label {
                    label_blocks(body, targets);
                }
            }
            _ => (),
        }
    }
}

struct LoopFrame {
    id: LoopId,
    header: Block,
    exit: Option<Block>,
}

struct Lowering<'a> {
    func: &'a FunctionCfg,
    loops: &'a LoopForest,
    /// Enclosing loops, innermost last.
    frames: Vec<LoopFrame>,
    gotos: Vec<GotoRecord>,
    unresolved: Vec<UnresolvedTransfer>,
    /// Loops referenced by a labeled `break` or `continue`.
    labeled_loops: HashSet<LoopId>,
}

impl<'a> Lowering<'a> {
    fn region(&mut self, region: &Region, follow: Option<Block>) -> Vec<Stmt> {
        match region {
            Region::Block(bb) => self.block(*bb, follow),
            Region::Loop(r) => self.lower_loop(r, follow),
            Region::IfThenElse(r) => self.lower_if(r, follow),
            Region::Sequence(r) => self.sequence(&r.children, follow),
            Region::Function(r) => self.region(&r.body, follow),
        }
    }

    fn sequence(&mut self, children: &[Region], follow: Option<Block>) -> Vec<Stmt> {
        let mut stmts = vec![];
        for (i, child) in children.iter().enumerate() {
            let next = children.get(i + 1).map(|c| c.entry()).or(follow);
            stmts.extend(self.region(child, next));
        }
        stmts
    }

    /// Express a transfer of control from `from` to `target`.
    fn jump(&mut self, from: Block, target: Block, follow: Option<Block>) -> Option<Stmt> {
        if Some(target) == follow {
            return None;
        }
        let innermost = self.frames.len().wrapping_sub(1);
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let label = if i == innermost { None } else { Some(frame.id) };
            let stmt = if target == frame.header {
                Stmt::Continue(label)
            } else if Some(target) == frame.exit {
                Stmt::Break(label)
            } else {
                continue;
            };
            if let Some(id) = label {
                self.labeled_loops.insert(id);
            }
            return Some(stmt);
        }
        let reason = match self.frames.last() {
            Some(frame) => format!(
                "{} is neither the next block nor the header or exit of an enclosing loop ({})",
                target, frame.id
            ),
            None => format!("{} is not the next block", target),
        };
        Some(self.goto(from, target, reason))
    }

    fn goto(&mut self, from: Block, target: Block, reason: String) -> Stmt {
        trace!("goto {} -> {}: {}", from, target, reason);
        self.gotos.push(GotoRecord {
            from,
            target,
            reason: reason.clone(),
        });
        Stmt::Goto { target, reason }
    }

    fn unresolved_jump(&mut self, transfer: UnresolvedTransfer) -> Stmt {
        trace!("goto ? from {}: {}", transfer.from, transfer);
        self.unresolved.push(transfer);
        Stmt::GotoUnresolved(transfer)
    }

    /// Express a single edge, including edges that leave the function.
    fn edge(&mut self, edge: &CfgEdge, follow: Option<Block>) -> Option<Stmt> {
        match edge.to {
            Some(to) if to == self.func.entry && edge.from != self.func.entry => {
                let reason = format!("{} re-enters the function entry", edge.from);
                Some(self.goto(edge.from, to, reason))
            }
            Some(to) => self.jump(edge.from, to, follow),
            None => match self.func.tail_call(edge.from) {
                Some(callee) if edge.kind == EdgeKind::Unconditional => {
                    Some(Stmt::TailCall(callee))
                }
                _ => Some(Stmt::Return),
            },
        }
    }

    fn block(&mut self, bb: Block, follow: Option<Block>) -> Vec<Stmt> {
        let mut stmts = vec![Stmt::BlockCode(bb)];
        let transfers = self.func.transfers(bb);
        let unknown = self.func.unresolved(bb).cloned();
        let conditional = unknown.map(|u| u.kind == EdgeKind::True).unwrap_or(false);
        let find = |kind| transfers.iter().find(|e| e.kind == kind).cloned();
        match (find(EdgeKind::True), find(EdgeKind::False)) {
            (None, None) if !conditional => {
                for edge in &transfers {
                    stmts.extend(self.edge(edge, follow));
                }
                if let Some(u) = unknown {
                    stmts.push(self.unresolved_jump(u));
                }
            }
            (taken, not_taken) => {
                let jt = match (taken, unknown) {
                    (Some(e), _) => self.edge(&e, follow),
                    (None, Some(u)) => Some(self.unresolved_jump(u)),
                    (None, None) => None,
                };
                let jf = not_taken.and_then(|e| self.edge(&e, follow));
                if let (Some(Stmt::Goto { .. }), true) = (&jt, jt == jf) {
                    // Both sides collapse into one statement.
                    self.gotos.pop();
                }
                stmts.extend(branch(Condition::taken(bb), jt, jf));
            }
        }
        stmts
    }

    fn lower_if(&mut self, region: &IfRegion, follow: Option<Block>) -> Vec<Stmt> {
        let header = region.header;
        let mut stmts = vec![Stmt::BlockCode(header)];
        let inner = region.merge.or(follow);
        let other_edge = match region.then_edge {
            EdgeKind::True => EdgeKind::False,
            _ => EdgeKind::True,
        };
        let other = self
            .func
            .outgoing(header)
            .iter()
            .find(|e| e.kind == other_edge)
            .cloned();

        let then_body = self.region(&region.then_region, inner);
        let else_body = match region.else_region {
            Some(ref r) => self.region(r, inner),
            None => other
                .and_then(|e| self.edge(&e, inner))
                .into_iter()
                .collect(),
        };
        let condition = match region.then_edge {
            EdgeKind::True => Condition::taken(header),
            _ => Condition::taken(header).negate(),
        };
        stmts.extend(if_stmt(condition, then_body, else_body));
        if let Some(merge) = region.merge {
            stmts.extend(self.jump(header, merge, follow));
        }
        stmts
    }

    fn lower_loop(&mut self, region: &LoopRegion, follow: Option<Block>) -> Vec<Stmt> {
        let loops = self.loops;
        let lp = &loops[region.id];
        self.frames.push(LoopFrame {
            id: region.id,
            header: region.header,
            exit: lp.exit_target,
        });
        let body = self.region(&region.body, Some(region.header));
        self.frames.pop();

        let shaped = match lp.kind {
            LoopKind::PreTest => {
                as_while(region.header, &body).or_else(|| as_do_while(region.id, &body))
            }
            LoopKind::PostTest => {
                as_do_while(region.id, &body).or_else(|| as_while(region.header, &body))
            }
            LoopKind::Infinite => None,
        };
        let stmt = shaped.unwrap_or(Stmt::While {
            condition: Condition::Always,
            prelude: vec![],
            body,
        });
        let mut stmts = vec![if self.labeled_loops.contains(&region.id) {
            Stmt::Labeled {
                label: Label::Loop(region.id),
                body: vec![stmt],
            }
        } else {
            stmt
        }];
        if let Some(exit) = lp.exit_target {
            stmts.extend(self.jump(region.header, exit, follow));
        }
        stmts
    }
}

/// Combine the two sides of a conditional branch into one statement.
fn branch(condition: Condition, taken: Option<Stmt>, not_taken: Option<Stmt>) -> Option<Stmt> {
    if taken == not_taken {
        return taken;
    }
    if_stmt(
        condition,
        taken.into_iter().collect(),
        not_taken.into_iter().collect(),
    )
}

/// Build an `if` statement, dropping empty sides.
fn if_stmt(condition: Condition, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Option<Stmt> {
    match (then_body.is_empty(), else_body.is_empty()) {
        (true, true) => None,
        (false, true) => Some(Stmt::If {
            condition,
            then_body,
            else_body: None,
        }),
        (true, false) => Some(Stmt::If {
            condition: condition.negate(),
            then_body: else_body,
            else_body: None,
        }),
        (false, false) => Some(Stmt::If {
            condition,
            then_body,
            else_body: Some(else_body),
        }),
    }
}

/// Match `if (c) break` where `c` is the branch of `block`.
fn exit_test(stmt: &Stmt, block: Block) -> Option<Condition> {
    match stmt {
        Stmt::If {
            condition,
            then_body,
            else_body: None,
        } if then_body.len() == 1 && then_body[0] == Stmt::Break(None) => match condition {
            Condition::Branch { block: b, .. } if *b == block => Some(*condition),
            _ => None,
        },
        _ => None,
    }
}

/// Reshape `loop { H; if (c) break; rest }` into `while (!c) { rest }` with
/// `H` as prelude.
fn as_while(header: Block, body: &[Stmt]) -> Option<Stmt> {
    if body.first() != Some(&Stmt::BlockCode(header)) {
        return None;
    }
    let test = exit_test(body.get(1)?, header)?;
    Some(Stmt::While {
        condition: test.negate(),
        prelude: vec![Stmt::BlockCode(header)],
        body: body[2..].to_vec(),
    })
}

/// Reshape `loop { rest; L; if (c) break }` into `do { rest; L } while (!c)`.
///
/// Not applicable if anything continues the loop, since `continue` in a
/// `do ... while` skips to the test instead of the top.
fn as_do_while(id: LoopId, body: &[Stmt]) -> Option<Stmt> {
    if body.len() < 2 {
        return None;
    }
    let latch = match body[body.len() - 2] {
        Stmt::BlockCode(bb) => bb,
        _ => return None,
    };
    let test = exit_test(&body[body.len() - 1], latch)?;
    if body.iter().any(|s| continues(s, id, true)) {
        return None;
    }
    Some(Stmt::DoWhile {
        body: body[..body.len() - 1].to_vec(),
        condition: test.negate(),
    })
}

/// Check whether a statement continues loop `id`. `innermost` is true as long
/// as no other loop has been entered.
fn continues(stmt: &Stmt, id: LoopId, innermost: bool) -> bool {
    match stmt {
        Stmt::Continue(None) => innermost,
        Stmt::Continue(Some(l)) => *l == id,
        Stmt::While { prelude, body, .. } => prelude
            .iter()
            .chain(body.iter())
            .any(|s| continues(s, id, false)),
        Stmt::DoWhile { body, .. } => body.iter().any(|s| continues(s, id, false)),
        _ => stmt
            .nested()
            .into_iter()
            .any(|s| continues(s, id, innermost)),
    }
}

/// Total time spent structuring functions.
pub static STRUCTURING_TIME: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableKey;

    fn bb(i: usize) -> Block {
        Block::new(i)
    }

    #[test]
    fn equal_sides_need_no_if() {
        assert_eq!(branch(Condition::taken(bb(0)), None, None), None);
        assert_eq!(
            branch(
                Condition::taken(bb(0)),
                Some(Stmt::Return),
                Some(Stmt::Return)
            ),
            Some(Stmt::Return)
        );
    }

    #[test]
    fn empty_then_side_is_negated() {
        assert_eq!(
            branch(Condition::taken(bb(0)), None, Some(Stmt::Return)),
            Some(Stmt::If {
                condition: Condition::Branch {
                    block: bb(0),
                    negated: true
                },
                then_body: vec![Stmt::Return],
                else_body: None,
            })
        );
    }

    #[test]
    fn while_shape() {
        let id = LoopId::new(0);
        let body = vec![
            Stmt::BlockCode(bb(1)),
            Stmt::If {
                condition: Condition::taken(bb(1)),
                then_body: vec![Stmt::Break(None)],
                else_body: None,
            },
            Stmt::BlockCode(bb(2)),
        ];
        assert_eq!(
            as_while(bb(1), &body),
            Some(Stmt::While {
                condition: Condition::taken(bb(1)).negate(),
                prelude: vec![Stmt::BlockCode(bb(1))],
                body: vec![Stmt::BlockCode(bb(2))],
            })
        );
        assert_eq!(as_do_while(id, &body), None);
    }

    #[test]
    fn continue_prevents_do_while() {
        let id = LoopId::new(0);
        let test = Stmt::If {
            condition: Condition::taken(bb(2)).negate(),
            then_body: vec![Stmt::Break(None)],
            else_body: None,
        };
        let plain = vec![Stmt::BlockCode(bb(1)), Stmt::BlockCode(bb(2)), test.clone()];
        assert!(as_do_while(id, &plain).is_some());
        let with_continue = vec![
            Stmt::BlockCode(bb(1)),
            Stmt::If {
                condition: Condition::taken(bb(1)),
                then_body: vec![Stmt::Continue(None)],
                else_body: None,
            },
            Stmt::BlockCode(bb(2)),
            test,
        ];
        assert_eq!(as_do_while(id, &with_continue), None);
    }
}
