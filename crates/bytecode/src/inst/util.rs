use bytes::BufMut;

use super::{OpCode, OperandFormat, Operands};

/// A decoded instruction together with its address and the address of the one
/// following it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub op: OpCode,
    pub operands: Operands,
    pub pc: usize,
    pub next: usize,
}

impl Inst {
    /// Absolute target of a jump instruction
    pub fn jump_target(&self) -> Option<isize> {
        let offset = match self.op.jump_operand()? {
            super::JumpOperand::A => self.operands.a_signed(),
            super::JumpOperand::B => self.operands.b_signed(),
        };
        Some(self.next as isize + offset as isize)
    }
}

pub trait InstContainer {
    fn code(&self) -> &[u8];

    /// Decode the instruction at `pc`. Returns `None` for an unknown opcode or
    /// a truncated operand.
    fn fetch(&self, pc: usize) -> Option<Inst> {
        let code = self.code();
        let op = OpCode::from_byte(*code.get(pc)?)?;
        let next = pc + op.len();
        let operands = op.format().read(code.get(pc + 1..next)?);
        Some(Inst {
            op,
            operands,
            pc,
            next,
        })
    }

    /// Iterate over the instructions, stopping at the first undecodable one.
    fn insts(&self) -> Insts<'_, Self> {
        Insts {
            container: self,
            pc: 0,
        }
    }
}

pub struct Insts<'a, C: ?Sized> {
    container: &'a C,
    pc: usize,
}

impl<'a, C: InstContainer + ?Sized> Iterator for Insts<'a, C> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let inst = self.container.fetch(self.pc)?;
        self.pc = inst.next;
        Some(inst)
    }
}

impl InstContainer for [u8] {
    fn code(&self) -> &[u8] {
        self
    }
}

impl InstContainer for bytes::Bytes {
    fn code(&self) -> &[u8] {
        self
    }
}

impl InstContainer for Vec<u8> {
    fn code(&self) -> &[u8] {
        self
    }
}

pub trait InstContainerMut {
    fn write_u8(&mut self, v: u8);
    fn write_operands(&mut self, format: OperandFormat, ops: Operands);

    fn emit(&mut self, i: OpCode, ops: Operands) -> &mut Self {
        self.write_u8(i as u8);
        self.write_operands(i.format(), ops);
        self
    }
}

impl<T> InstContainerMut for T
where
    T: BufMut,
{
    fn write_u8(&mut self, v: u8) {
        self.put_u8(v);
    }

    fn write_operands(&mut self, format: OperandFormat, ops: Operands) {
        format.write(ops, self);
    }
}
