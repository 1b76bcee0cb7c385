use bytes::{Buf, BufMut};

/// Operand layouts. `B` is an unsigned byte, `S` a big-endian 16-bit word and
/// `W` a big-endian 24-bit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandFormat {
    Z,
    B,
    BB,
    BBB,
    BS,
    BSS,
    S,
    W,
}

impl OperandFormat {
    /// Number of bytes the operands occupy
    #[allow(clippy::len_without_is_empty)]
    pub fn len(self) -> usize {
        match self {
            OperandFormat::Z => 0,
            OperandFormat::B => 1,
            OperandFormat::BB => 2,
            OperandFormat::BBB | OperandFormat::BS | OperandFormat::W => 3,
            OperandFormat::BSS => 5,
            OperandFormat::S => 2,
        }
    }

    /// Number of operands
    pub fn arity(self) -> usize {
        match self {
            OperandFormat::Z => 0,
            OperandFormat::B | OperandFormat::S | OperandFormat::W => 1,
            OperandFormat::BB | OperandFormat::BS => 2,
            OperandFormat::BBB | OperandFormat::BSS => 3,
        }
    }

    /// Parse the operands from the buffer's head pointer. **Panics if the buffer
    /// holds fewer than [`len`](Self::len) bytes.**
    pub fn read(self, mut r: impl Buf) -> Operands {
        match self {
            OperandFormat::Z => Operands::default(),
            OperandFormat::B => Operands::new(r.get_u8() as u32, 0, 0),
            OperandFormat::BB => {
                let a = r.get_u8() as u32;
                Operands::new(a, r.get_u8() as u32, 0)
            }
            OperandFormat::BBB => {
                let a = r.get_u8() as u32;
                let b = r.get_u8() as u32;
                Operands::new(a, b, r.get_u8() as u32)
            }
            OperandFormat::BS => {
                let a = r.get_u8() as u32;
                Operands::new(a, r.get_u16() as u32, 0)
            }
            OperandFormat::BSS => {
                let a = r.get_u8() as u32;
                let b = r.get_u16() as u32;
                Operands::new(a, b, r.get_u16() as u32)
            }
            OperandFormat::S => Operands::new(r.get_u16() as u32, 0, 0),
            OperandFormat::W => {
                let hi = r.get_u8() as u32;
                Operands::new(hi << 16 | r.get_u16() as u32, 0, 0)
            }
        }
    }

    /// Write the operands into the given buffer. Operands are truncated to the
    /// width of their slot.
    pub fn write(self, ops: Operands, mut w: impl BufMut) {
        match self {
            OperandFormat::Z => {}
            OperandFormat::B => w.put_u8(ops.a as u8),
            OperandFormat::BB => {
                w.put_u8(ops.a as u8);
                w.put_u8(ops.b as u8);
            }
            OperandFormat::BBB => {
                w.put_u8(ops.a as u8);
                w.put_u8(ops.b as u8);
                w.put_u8(ops.c as u8);
            }
            OperandFormat::BS => {
                w.put_u8(ops.a as u8);
                w.put_u16(ops.b as u16);
            }
            OperandFormat::BSS => {
                w.put_u8(ops.a as u8);
                w.put_u16(ops.b as u16);
                w.put_u16(ops.c as u16);
            }
            OperandFormat::S => w.put_u16(ops.a as u16),
            OperandFormat::W => {
                w.put_u8((ops.a >> 16) as u8);
                w.put_u16(ops.a as u16);
            }
        }
    }

    /// Largest value each operand slot can hold, `a` first.
    pub fn limits(self) -> [u32; 3] {
        const B: u32 = u8::MAX as u32;
        const S: u32 = u16::MAX as u32;
        match self {
            OperandFormat::Z => [0, 0, 0],
            OperandFormat::B => [B, 0, 0],
            OperandFormat::BB => [B, B, 0],
            OperandFormat::BBB => [B, B, B],
            OperandFormat::BS => [B, S, 0],
            OperandFormat::BSS => [B, S, S],
            OperandFormat::S => [S, 0, 0],
            OperandFormat::W => [0xff_ffff, 0, 0],
        }
    }
}

/// Decoded operands. Unused slots are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Operands {
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl Operands {
    pub fn new(a: u32, b: u32, c: u32) -> Operands {
        Operands { a, b, c }
    }

    /// `a` as a signed 16-bit value
    pub fn a_signed(&self) -> i32 {
        self.a as u16 as i16 as i32
    }

    /// `b` as a signed 16-bit value
    pub fn b_signed(&self) -> i32 {
        self.b as u16 as i16 as i32
    }
}
