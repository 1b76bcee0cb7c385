use expect_test::expect;
use test_env_log::test;

use crate::{ArgSpec, CatchKind, IrepBuilder, LoadError, OpCode};

use super::*;

fn increment_method() -> Arc<Irep> {
    let mut b = IrepBuilder::new(2, 4);
    b.enter(ArgSpec::required(1));
    let done = b.label();
    b.jump(OpCode::JmpNot, Some(1), done);
    b.load_int(2, 300);
    b.op_ab(OpCode::Move, 3, 1);
    b.send(2, "+", 1);
    b.op_a(OpCode::Return, 2);
    b.bind(done);
    b.load_sym(2, "none");
    b.op_a(OpCode::Return, 2);
    b.build()
}

#[test]
fn test_disassemble() {
    let mut top = IrepBuilder::new(1, 3);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "inc", increment_method());
    top.op_a(OpCode::Return, 1);
    let irep = top.build();

    expect![[r#"
        irep nlocals=1 nregs=3 iseq=10
          000 TCLASS    R1
          002 METHOD    R2 0
          005 DEF       R1 :inc
          008 RETURN    R1
        irep.0 nlocals=2 nregs=4 iseq=26
          000 ENTER     1:0:0:0:0:0:0
          004 JMPNOT    R1 -> 021
          008 LOADI16   R2 300
          012 MOVE      R3 1
          015 SEND      R2 :+ 1
          019 RETURN    R2
          021 LOADSYM   R2 :none
          024 RETURN    R2
    "#]]
    .assert_eq(&irep.to_string());
}

#[test]
fn test_innermost_handler_wins() {
    let mut b = IrepBuilder::new(1, 3);
    let outer_begin = b.mark();
    b.op_a(OpCode::LoadNil, 1);
    let inner_begin = b.mark();
    b.op_a(OpCode::LoadNil, 2);
    let inner_end = b.mark();
    b.op_a(OpCode::LoadNil, 1);
    let outer_end = b.mark();
    let rescue = b.mark();
    b.op_a(OpCode::Return, 1);
    let ensure = b.mark();
    b.op_a(OpCode::Return, 1);
    b.catch(CatchKind::Ensure, outer_begin, outer_end, ensure);
    b.catch(CatchKind::Rescue, inner_begin, inner_end, rescue);
    let irep = b.build();

    // pc is the address after the faulting instruction
    assert_eq!(irep.catch_handler(4, None).map(|h| h.kind), Some(CatchKind::Rescue));
    assert_eq!(
        irep.catch_handler(4, Some(CatchKind::Ensure)).map(|h| h.target),
        Some(8)
    );
    assert_eq!(irep.catch_handler(6, None).map(|h| h.kind), Some(CatchKind::Ensure));
    assert!(irep.catch_handler(0, None).is_none());
    assert!(irep.catch_handler(8, None).is_none());
}

#[test]
fn test_validate_rejects_bad_indices() {
    let irep = Irep {
        nlocals: 1,
        nregs: 2,
        iseq: Bytes::from_static(&[OpCode::LoadSym as u8, 1, 3]),
        catch_handlers: vec![],
        pool: vec![],
        syms: vec![None],
        reps: vec![],
    };
    assert_eq!(
        irep.validate(),
        Err(LoadError::Instruction {
            pc: 0,
            reason: "symbol index out of range"
        })
    );

    let irep = Irep {
        iseq: Bytes::from_static(&[OpCode::Jmp as u8, 0x00, 0x10]),
        syms: vec![],
        ..irep
    };
    assert_eq!(
        irep.validate(),
        Err(LoadError::Instruction {
            pc: 0,
            reason: "jump target out of range"
        })
    );

    let irep = Irep {
        iseq: Bytes::from_static(&[OpCode::Nop as u8, OpCode::Ext2 as u8]),
        ..irep
    };
    assert_eq!(
        irep.validate(),
        Err(LoadError::Instruction {
            pc: 1,
            reason: "operand extension"
        })
    );
}

#[test]
fn test_validate_checks_children() {
    let bad_child = Arc::new(Irep {
        nlocals: 1,
        nregs: 1,
        iseq: Bytes::from_static(&[0xee]),
        catch_handlers: vec![],
        pool: vec![],
        syms: vec![],
        reps: vec![],
    });
    let mut top = IrepBuilder::new(1, 2);
    let idx = top.child(bad_child);
    top.op_ab(OpCode::Block, 1, idx);
    top.op_a(OpCode::Return, 1);
    assert_eq!(
        top.build().validate(),
        Err(LoadError::Instruction {
            pc: 0,
            reason: "unknown opcode"
        })
    );
}

#[test]
fn test_argspec_fields() {
    let spec = ArgSpec::new(2, 1, true, 1, 2, false, true);
    assert_eq!(
        (spec.req(), spec.opt(), spec.rest(), spec.post(), spec.key(), spec.kdict(), spec.block()),
        (2, 1, true, 1, 2, false, true)
    );
    assert!(spec.has_keywords());
    assert!(!ArgSpec::required(3).has_keywords());
}
