use test_env_log::test;

use crate::InstContainer;

use super::*;

fn ops_of(irep: &Irep) -> Vec<(OpCode, Operands)> {
    irep.insts().map(|i| (i.op, i.operands)).collect()
}

#[test]
fn test_integer_encodings() {
    let mut b = IrepBuilder::new(1, 2);
    for i in [-1, 0, 7, 8, 255, -2, -255, -256, 32767, 40000, -70000, 1 << 33] {
        b.load_int(1, i);
    }
    let irep = b.build();
    let ops = ops_of(&irep).into_iter().map(|(op, _)| op).collect::<Vec<_>>();
    pretty_assertions::assert_eq!(
        ops,
        vec![
            OpCode::LoadIMinus1,
            OpCode::LoadI0,
            OpCode::LoadI7,
            OpCode::LoadI8,
            OpCode::LoadI8,
            OpCode::LoadINeg,
            OpCode::LoadINeg,
            OpCode::LoadI16,
            OpCode::LoadI16,
            OpCode::LoadI32,
            OpCode::LoadI32,
            OpCode::LoadL,
        ]
    );
    assert_eq!(irep.pool, vec![PoolValue::Int(1 << 33)]);
}

#[test]
fn test_labels_resolve_both_directions() {
    let mut b = IrepBuilder::new(2, 3);
    let top = b.mark();
    let exit = b.label();
    b.jump(OpCode::JmpNil, Some(1), exit);
    b.op_ab(OpCode::AddI, 1, 1);
    b.jump(OpCode::Jmp, None, top);
    b.bind(exit);
    b.op_a(OpCode::Return, 1);
    let irep = b.build();

    let targets = irep
        .insts()
        .filter_map(|i| i.jump_target())
        .collect::<Vec<_>>();
    assert_eq!(targets, vec![10, 0]);
}

#[test]
fn test_symbols_and_literals_are_shared() {
    let mut b = IrepBuilder::new(1, 3);
    b.send(1, "foo", 0).ssend(2, "foo", 0).send(1, "bar", 1);
    b.load_string(1, "x").load_string(2, "x");
    let irep = b.build();
    assert_eq!(irep.syms, vec![Some("foo".into()), Some("bar".into())]);
    assert_eq!(irep.pool.len(), 1);
}

#[test]
#[should_panic(expected = "never bound")]
fn test_unbound_label_panics() {
    let mut b = IrepBuilder::new(1, 1);
    let nowhere = b.label();
    b.jump(OpCode::Jmp, None, nowhere);
    b.build();
}

#[test]
#[should_panic(expected = "operand count")]
fn test_operand_count_checked() {
    IrepBuilder::new(1, 1).op_a(OpCode::Move, 1);
}
