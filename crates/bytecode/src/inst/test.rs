use test_env_log::test;

use super::*;

#[test]
fn test_decode_signed_operands() {
    let code = [OpCode::LoadI32 as u8, 3, 0xff, 0xff, 0xff, 0xfe];
    let inst = code[..].fetch(0).expect("decodes");
    assert_eq!(inst.op, OpCode::LoadI32);
    assert_eq!(inst.operands.a, 3);
    assert_eq!((inst.operands.b << 16 | inst.operands.c) as i32, -2);
    assert_eq!(inst.next, 6);

    let code = [OpCode::Jmp as u8, 0xff, 0xfd];
    let inst = code[..].fetch(0).expect("decodes");
    assert_eq!(inst.operands.a_signed(), -3);
    assert_eq!(inst.jump_target(), Some(0));
}

#[test]
fn test_decode_aspec_word() {
    let code = [OpCode::Enter as u8, 0x04, 0x20, 0x01];
    let inst = code[..].fetch(0).expect("decodes");
    let spec = crate::ArgSpec(inst.operands.a);
    assert_eq!(spec.req(), 1);
    assert_eq!(spec.opt(), 1);
    assert!(spec.block());
    assert!(!spec.rest());
}

#[test]
fn test_reject_unknown_and_truncated() {
    assert_eq!(OpCode::from_byte(105), Some(OpCode::Stop));
    assert_eq!(OpCode::from_byte(106), None);
    assert!([200u8][..].fetch(0).is_none());
    assert!([OpCode::Send as u8, 1, 2][..].fetch(0).is_none());
}

#[test]
fn test_emit_then_iterate() {
    let mut code = Vec::new();
    code.emit(OpCode::LoadI8, Operands::new(1, 42, 0))
        .emit(OpCode::LoadI16, Operands::new(2, (-300i16) as u16 as u32, 0))
        .emit(OpCode::Return, Operands::new(1, 0, 0));
    let ops = code.insts().map(|i| i.op).collect::<Vec<_>>();
    pretty_assertions::assert_eq!(ops, vec![OpCode::LoadI8, OpCode::LoadI16, OpCode::Return]);
    let second = code.fetch(3).expect("decodes");
    assert_eq!(second.operands.b_signed(), -300);
}
