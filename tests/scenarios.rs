// Copyright (c) 2017-2021 Fabian Schuiki

#[macro_use]
extern crate indoc;

use mosflow::{
    analysis::{CondKind, LoopKind},
    block::Block,
    cfg::{CfgEdge, EdgeKind, UnresolvedTransfer},
    parse_listing,
    region::Region,
    structure::{Condition, Label, Stmt},
    table::TableKey,
    verifier::VerifyFlags,
    FunctionAnalysis, PassContext, ProgramAnalysis,
};

fn analyze(input: &str) -> ProgramAnalysis {
    let _ = env_logger::builder().is_test(true).try_init();
    let prog = parse_listing(input).unwrap();
    let ctx = PassContext {
        parallel: false,
        verify: VerifyFlags::ALL,
    };
    mosflow::analyze(&ctx, &prog).unwrap()
}

fn main_of(analysis: &ProgramAnalysis) -> &FunctionAnalysis {
    analysis.function("main").unwrap()
}

fn bb(i: usize) -> Block {
    Block::new(i)
}

fn code(i: usize) -> Stmt {
    Stmt::BlockCode(bb(i))
}

fn cond(i: usize, negated: bool) -> Condition {
    Condition::Branch {
        block: bb(i),
        negated,
    }
}

#[test]
fn straight_line() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other   ; LDA #5
              8002 3 other   ; STA $200
              8005 1 return  ; RTS
    "});
    assert_eq!(analysis.blocks.len(), 1);
    let func = main_of(&analysis);
    assert_eq!(
        func.cfg.outgoing(bb(0)),
        &[CfgEdge {
            from: bb(0),
            to: None,
            kind: EdgeKind::Return
        }]
    );
    match func.regions.body() {
        Region::Block(b) => assert_eq!(*b, bb(0)),
        other => panic!("expected a block region, got {:?}", other),
    }
    assert_eq!(func.structure.body, vec![code(0), Stmt::Return]);
    assert!(func.structure.fully_structured);
}

#[test]
fn if_without_else() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other   ; CMP #5
              8002 2 branch skip ; BEQ skip
              8004 2 other   ; LDA #1
        skip: 8006 3 other   ; STA $200
              8009 1 return  ; RTS
    "});
    let func = main_of(&analysis);
    assert_eq!(func.conds.len(), 1);
    let c = func.conds.iter().next().unwrap();
    assert_eq!(c.kind, CondKind::If);
    assert_eq!(c.header, bb(0));
    assert_eq!(c.merge, analysis.blocks.block_at(0x8006));
    assert_eq!(c.then_edge, EdgeKind::False);
    assert!(c.else_branch.is_empty());
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, true),
                then_body: vec![code(1)],
                else_body: None,
            },
            code(2),
            Stmt::Return,
        ]
    );
}

#[test]
fn if_else() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other   ; CMP #5
              8002 2 branch t ; BEQ T
              8004 2 other   ; LDA #1
              8006 3 jump e  ; JMP E
        t:    8009 2 other   ; LDA #2
        e:    800B 3 other   ; STA $200
              800E 1 return  ; RTS
    "});
    let func = main_of(&analysis);
    assert_eq!(func.conds.len(), 1);
    let c = func.conds.iter().next().unwrap();
    assert_eq!(c.kind, CondKind::IfElse);
    assert!(!c.then_branch.is_empty());
    assert!(!c.else_branch.is_empty());
    assert_eq!(c.merge, analysis.blocks.block_at(0x800B));
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, false),
                then_body: vec![code(2)],
                else_body: Some(vec![code(1)]),
            },
            code(3),
            Stmt::Return,
        ]
    );
}

#[test]
fn single_block_loop() {
    let analysis = analyze(indoc! {"
        .entry loop exported
        loop: 8000 1 other   ; DEX
              8001 2 branch loop ; BNE loop
              8003 1 return  ; RTS
    "});
    let func = analysis.function("loop").unwrap();
    assert_eq!(func.loops.len(), 1);
    let lp = func.loops.loops().next().unwrap();
    assert_eq!(lp.header, bb(0));
    assert_eq!(lp.body.iter().cloned().collect::<Vec<_>>(), vec![bb(0)]);
    assert_eq!(lp.kind, LoopKind::PostTest);
    assert_eq!(lp.exit_target, Some(bb(1)));
    assert_eq!(
        func.structure.body,
        vec![
            Stmt::DoWhile {
                body: vec![code(0)],
                condition: cond(0, false),
            },
            code(1),
            Stmt::Return,
        ]
    );
}

#[test]
fn recursion_is_bounded() {
    let analysis = analyze(indoc! {"
        .entry func exported
        func: 8000 2 other
              8002 2 branch done
              8004 2 other
              8006 3 call func
              8009 3 jump func
        done: 800C 1 return
    "});
    let func = analysis.function("func").unwrap();
    assert_eq!(func.cfg.len(), 4);
    assert_eq!(
        func.cfg.outgoing(bb(2)),
        &[CfgEdge {
            from: bb(2),
            to: None,
            kind: EdgeKind::Return
        }]
    );
    assert_eq!(func.cfg.reentries.len(), 1);
    assert_eq!(func.cfg.reentries[0].to, Some(bb(0)));
    assert!(!func.structure.fully_structured);
    assert_eq!(func.structure.gotos.len(), 1);
    assert_eq!(func.structure.gotos[0].from, bb(2));
    assert_eq!(func.structure.gotos[0].target, bb(0));
    assert_eq!(
        func.structure.body[0],
        Stmt::Labeled {
            label: Label::Block(bb(0)),
            body: vec![code(0)],
        }
    );
}

#[test]
fn nested_loops() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main:  8000 2 other        ; LDX #8
        outer: 8002 2 other        ; LDY #8
        inner: 8004 1 other        ; DEY
               8005 2 branch inner ; BNE inner
               8007 1 other        ; DEX
               8008 2 branch outer ; BNE outer
               800A 1 return       ; RTS
    "});
    let func = main_of(&analysis);
    assert_eq!(func.loops.len(), 2);
    let outer = func.loops.is_header(bb(1)).unwrap();
    let inner = func.loops.is_header(bb(2)).unwrap();
    assert_eq!(func.loops[outer].depth, 0);
    assert_eq!(func.loops[inner].depth, func.loops[outer].depth + 1);
    assert_eq!(func.loops[inner].parent, Some(outer));
    assert_eq!(func.loops[outer].kind, LoopKind::PostTest);
    assert_eq!(func.loops[inner].kind, LoopKind::PostTest);
    assert!(func.regions.root.depth() >= 3);
    assert!(func.structure.fully_structured);
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::DoWhile {
                body: vec![
                    code(1),
                    Stmt::DoWhile {
                        body: vec![code(2)],
                        condition: cond(2, false),
                    },
                    code(3),
                ],
                condition: cond(3, false),
            },
            code(4),
            Stmt::Return,
        ]
    );
}

#[test]
fn pre_test_loop() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other       ; LDX #8
        loop: 8002 2 branch done ; BEQ done
              8004 1 other       ; DEX
              8005 3 jump loop   ; JMP loop
        done: 8008 1 return      ; RTS
    "});
    let func = main_of(&analysis);
    let lp = func.loops.loops().next().unwrap();
    assert_eq!(lp.kind, LoopKind::PreTest);
    assert_eq!(lp.exit_target, Some(bb(3)));
    assert!(func.conds.is_empty());
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::While {
                condition: cond(1, true),
                prelude: vec![code(1)],
                body: vec![code(2)],
            },
            code(3),
            Stmt::Return,
        ]
    );
}

#[test]
fn continue_keeps_endless_loop() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 1 other
        loop: 8001 1 other
              8002 2 branch loop
              8004 1 other
              8005 2 branch loop
              8007 1 return
    "});
    let func = main_of(&analysis);
    let lp = func.loops.loops().next().unwrap();
    assert_eq!(lp.latches.len(), 2);
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::While {
                condition: Condition::Always,
                prelude: vec![],
                body: vec![
                    code(1),
                    Stmt::If {
                        condition: cond(1, false),
                        then_body: vec![Stmt::Continue(None)],
                        else_body: None,
                    },
                    code(2),
                    Stmt::If {
                        condition: cond(2, true),
                        then_body: vec![Stmt::Break(None)],
                        else_body: None,
                    },
                ],
            },
            code(3),
            Stmt::Return,
        ]
    );
    let stats = func.structure.stats();
    assert_eq!(stats.loops, 1);
    assert_eq!(stats.breaks, 1);
    assert_eq!(stats.continues, 1);
    assert_eq!(stats.gotos, 0);
}

#[test]
fn both_sides_return() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 branch t
              8002 1 return
        t:    8003 1 return
    "});
    let func = main_of(&analysis);
    let c = func.conds.iter().next().unwrap();
    assert_eq!(c.kind, CondKind::IfElse);
    assert_eq!(c.merge, None);
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, false),
                then_body: vec![code(2), Stmt::Return],
                else_body: Some(vec![code(1), Stmt::Return]),
            },
        ]
    );
}

#[test]
fn irreducible_cycle_needs_goto() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 branch b
        a:    8002 1 other
        b:    8003 1 other
              8004 2 branch a
              8006 1 return
    "});
    let func = main_of(&analysis);
    assert!(func.domtree.back_edges().is_empty());
    assert!(func.loops.is_empty());
    assert!(!func.structure.fully_structured);
    assert_eq!(func.structure.gotos.len(), 1);
    assert_eq!(func.structure.gotos[0].from, bb(2));
    assert_eq!(func.structure.gotos[0].target, bb(1));
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, true),
                then_body: vec![Stmt::Labeled {
                    label: Label::Block(bb(1)),
                    body: vec![code(1)],
                }],
                else_body: None,
            },
            code(2),
            Stmt::If {
                condition: cond(2, false),
                then_body: vec![Stmt::Goto {
                    target: bb(1),
                    reason: func.structure.gotos[0].reason.clone(),
                }],
                else_body: None,
            },
            code(3),
            Stmt::Return,
        ]
    );
}

#[test]
fn unknown_jump_target() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other
              8002 3 jump ?   ; JMP ($0300)
              8005 1 return   ; unreachable
    "});
    assert_eq!(analysis.reach.dead().len(), 1);
    let func = main_of(&analysis);
    assert!(func.cfg.outgoing(bb(0)).is_empty());
    assert!(analysis.blocks[bb(0)].unresolved);
    let jump = UnresolvedTransfer {
        from: bb(0),
        kind: EdgeKind::Unconditional,
        address: 0x8002,
        target: None,
    };
    assert_eq!(func.cfg.unresolved, vec![jump]);
    assert_eq!(
        func.structure.body,
        vec![code(0), Stmt::GotoUnresolved(jump)]
    );
    assert_eq!(func.structure.unresolved, vec![jump]);
    assert!(!func.structure.fully_structured);
}

#[test]
fn unknown_jump_does_not_fall_through() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 1 other
        loop: 8001 2 branch body
              8003 3 jump ?
        body: 8006 1 other
              8007 2 branch loop
              8009 1 return
    "});
    let func = main_of(&analysis);
    let jump_block = analysis.blocks.block_at(0x8003).unwrap();
    let mut walked = vec![];
    for stmt in &func.structure.body {
        stmt.walk(&mut |s| walked.push(s));
    }
    let at = walked
        .iter()
        .position(|&s| *s == Stmt::BlockCode(jump_block))
        .unwrap();
    assert_eq!(
        walked[at + 1],
        &Stmt::GotoUnresolved(UnresolvedTransfer {
            from: jump_block,
            kind: EdgeKind::Unconditional,
            address: 0x8003,
            target: None,
        })
    );
    assert_eq!(func.structure.stats().unresolved, 1);
    assert!(!func.structure.fully_structured);
}

#[test]
fn branch_into_operand_needs_unresolved_goto() {
    let analysis = analyze(indoc! {"
        .entry main exported
        main: 8000 2 other
              8002 2 branch $8005   ; lands inside the next instruction
              8004 3 other
              8007 1 return
    "});
    assert_eq!(analysis.blocks.len(), 2);
    let func = main_of(&analysis);
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, false),
                then_body: vec![Stmt::GotoUnresolved(UnresolvedTransfer {
                    from: bb(0),
                    kind: EdgeKind::True,
                    address: 0x8002,
                    target: Some(0x8005),
                })],
                else_body: None,
            },
            code(1),
            Stmt::Return,
        ]
    );
    assert!(!func.structure.fully_structured);
}

#[test]
fn jump_to_other_function_is_tail_call() {
    let analysis = analyze(indoc! {"
        .entry main exported
        .entry helper call
        main:   8000 2 branch done
                8002 3 jump helper
        done:   8005 1 return
        helper: 8006 2 other
                8008 1 return
    "});
    let func = main_of(&analysis);
    let helper = analysis.blocks.block_at(0x8006).unwrap();
    assert_eq!(func.cfg.blocks.len(), 3);
    assert!(!func.cfg.contains(helper));
    assert_eq!(func.cfg.tail_call(bb(1)), Some(helper));
    assert_eq!(
        func.structure.body,
        vec![
            code(0),
            Stmt::If {
                condition: cond(0, false),
                then_body: vec![code(2), Stmt::Return],
                else_body: Some(vec![code(1), Stmt::TailCall(helper)]),
            },
        ]
    );
    assert_eq!(func.structure.stats().tail_calls, 1);
    assert!(func.structure.fully_structured);
    assert!(analysis.cfg.shared.is_empty());

    let main = analysis.calls.get(bb(0)).unwrap();
    assert!(main.sites.is_empty());
    assert!(analysis.calls.never_called.contains(&helper));
}

#[test]
fn both_sides_reenter_entry_once() {
    let analysis = analyze(indoc! {"
        .entry main exported
        top:  8000 2 branch main   ; both sides land on main
        main: 8002 1 other
              8003 2 branch top
              8005 1 return
    "});
    let func = main_of(&analysis);
    assert_eq!(func.cfg.entry, bb(1));
    assert_eq!(func.cfg.reentries.len(), 2);
    assert_eq!(func.structure.gotos.len(), 1);
    assert_eq!(func.structure.gotos[0].from, bb(0));
    assert_eq!(func.structure.stats().gotos, 1);
    assert_eq!(
        func.structure.body,
        vec![
            Stmt::Labeled {
                label: Label::Block(bb(1)),
                body: vec![code(1)],
            },
            Stmt::If {
                condition: cond(1, false),
                then_body: vec![
                    code(0),
                    Stmt::Goto {
                        target: bb(1),
                        reason: func.structure.gotos[0].reason.clone(),
                    },
                ],
                else_body: Some(vec![code(2), Stmt::Return]),
            },
        ]
    );
}
