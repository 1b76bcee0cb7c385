mod operand;
mod util;

use enum_ordinalize::Ordinalize;

pub use operand::{OperandFormat, Operands};
pub use util::*;

macro_rules! define_inst {
    (
        $(#[$meta:meta])*
        // type names
        $ty_vis:vis $type:ident,
        // instruction variant definition
        $(
            // metadata for this variant. Will be put inside the final enum
            $(#[$variant_meta:meta])*
            // variant name
            $name:ident
            // operand layout
            ($fmt:ident)
            // disassembler mnemonic
            $mnemonic:literal
            // opcode byte
            = $n:tt
        ),* $(,)?
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Copy, Ordinalize)]
        #[repr(u8)]
        $ty_vis enum $type {$(
            $(#[$variant_meta])*
            $name = $n
        ),*}

        impl $type {
            /// Returns the operand layout following this opcode
            pub fn format(self) -> OperandFormat {
                match self {$(
                    Self::$name => OperandFormat::$fmt,
                )*}
            }

            pub fn mnemonic(self) -> &'static str {
                match self {$(
                    Self::$name => $mnemonic,
                )*}
            }

            /// Encoded length of the instruction, opcode byte included
            #[allow(clippy::len_without_is_empty)]
            pub fn len(self) -> usize {
                1 + self.format().len()
            }
        }

        impl ::std::fmt::Display for $type {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.mnemonic())
            }
        }
    };
}

// instruction definition.
//
// Each line is an instruction: its operand layout, its mnemonic and its opcode
// byte. Register operands are relative to the current frame's register window.
// Jump offsets are relative to the instruction following the jump.
define_inst! {
    /// The mruby 3 instruction set.
    pub OpCode,

    Nop(Z) "NOP" = 0,
    /// R[a] = R[b]
    Move(BB) "MOVE" = 1,
    /// R[a] = Pool[b]
    LoadL(BB) "LOADL" = 2,
    /// R[a] = b
    LoadI8(BB) "LOADI8" = 3,
    /// R[a] = -b
    LoadINeg(BB) "LOADINEG" = 4,
    LoadIMinus1(B) "LOADI__1" = 5,
    LoadI0(B) "LOADI_0" = 6,
    LoadI1(B) "LOADI_1" = 7,
    LoadI2(B) "LOADI_2" = 8,
    LoadI3(B) "LOADI_3" = 9,
    LoadI4(B) "LOADI_4" = 10,
    LoadI5(B) "LOADI_5" = 11,
    LoadI6(B) "LOADI_6" = 12,
    LoadI7(B) "LOADI_7" = 13,
    /// R[a] = b as i16
    LoadI16(BS) "LOADI16" = 14,
    /// R[a] = (b << 16 | c) as i32
    LoadI32(BSS) "LOADI32" = 15,
    /// R[a] = Syms[b]
    LoadSym(BB) "LOADSYM" = 16,
    LoadNil(B) "LOADNIL" = 17,
    LoadSelf(B) "LOADSELF" = 18,
    LoadT(B) "LOADT" = 19,
    LoadF(B) "LOADF" = 20,
    /// R[a] = getglobal(Syms[b])
    GetGV(BB) "GETGV" = 21,
    /// setglobal(Syms[b], R[a])
    SetGV(BB) "SETGV" = 22,
    GetSV(BB) "GETSV" = 23,
    SetSV(BB) "SETSV" = 24,
    /// R[a] = ivget(Syms[b])
    GetIV(BB) "GETIV" = 25,
    SetIV(BB) "SETIV" = 26,
    GetCV(BB) "GETCV" = 27,
    SetCV(BB) "SETCV" = 28,
    GetConst(BB) "GETCONST" = 29,
    SetConst(BB) "SETCONST" = 30,
    /// R[a] = R[a]::Syms[b]
    GetMCnst(BB) "GETMCNST" = 31,
    /// R[a+1]::Syms[b] = R[a]
    SetMCnst(BB) "SETMCNST" = 32,
    /// R[a] = uvget(b, c)
    GetUpVar(BBB) "GETUPVAR" = 33,
    /// uvset(b, c, R[a])
    SetUpVar(BBB) "SETUPVAR" = 34,
    /// R[a] = R[a][R[a+1]]
    GetIdx(B) "GETIDX" = 35,
    /// R[a][R[a+1]] = R[a+2]
    SetIdx(B) "SETIDX" = 36,
    Jmp(S) "JMP" = 37,
    JmpIf(BS) "JMPIF" = 38,
    JmpNot(BS) "JMPNOT" = 39,
    JmpNil(BS) "JMPNIL" = 40,
    /// Jump out of a protected region, running the ensure clauses on the way.
    JmpUw(S) "JMPUW" = 41,
    /// R[a] = the pending exception or break record
    Except(B) "EXCEPT" = 42,
    /// R[b] = R[a].is_a?(R[b])
    Rescue(BB) "RESCUE" = 43,
    /// raise(R[a]) if R[a] is an exception; resume R[a] if it is a break record
    RaiseIf(B) "RAISEIF" = 44,
    /// R[a] = self.send(Syms[b], R[a+1]..R[a+n], R[a+n+1]..R[a+n+2k])
    SSend(BBB) "SSEND" = 45,
    /// Same as `SSend` with a block in the register following the arguments
    SSendB(BBB) "SSENDB" = 46,
    /// R[a] = R[a].send(Syms[b], R[a+1]..R[a+n], R[a+n+1]..R[a+n+2k])
    Send(BBB) "SEND" = 47,
    SendB(BBB) "SENDB" = 48,
    /// Replace the current frame with the receiver proc
    Call(Z) "CALL" = 49,
    /// R[a] = super(R[a+1],...)
    Super(BB) "SUPER" = 50,
    /// R[a] = argument array of the method `b` levels up
    ArgAry(BS) "ARGARY" = 51,
    /// Argument processing according to the 24-bit argument spec
    Enter(W) "ENTER" = 52,
    /// R[a] = kdict.key?(Syms[b])
    KeyP(BB) "KEY_P" = 53,
    /// raise unless kdict.empty?
    KeyEnd(Z) "KEYEND" = 54,
    /// R[a] = kdict.delete(Syms[b]), raising when missing
    KArg(BB) "KARG" = 55,
    Return(B) "RETURN" = 56,
    /// Return from the method enclosing the current block
    ReturnBlk(B) "RETURN_BLK" = 57,
    Break(B) "BREAK" = 58,
    /// R[a] = the block of the method `b` levels up
    BlkPush(BS) "BLKPUSH" = 59,
    /// R[a] = R[a] + R[a+1]
    Add(B) "ADD" = 60,
    /// R[a] = R[a] + b
    AddI(BB) "ADDI" = 61,
    Sub(B) "SUB" = 62,
    SubI(BB) "SUBI" = 63,
    Mul(B) "MUL" = 64,
    Div(B) "DIV" = 65,
    Eq(B) "EQ" = 66,
    Lt(B) "LT" = 67,
    Le(B) "LE" = 68,
    Gt(B) "GT" = 69,
    Ge(B) "GE" = 70,
    /// R[a] = [R[a]..R[a+b]]
    Array(BB) "ARRAY" = 71,
    /// R[a] = [R[b]..R[b+c]]
    Array2(BBB) "ARRAY2" = 72,
    /// R[a] = R[a] + splat(R[a+1])
    AryCat(B) "ARYCAT" = 73,
    /// R[a].push(R[a+1]..R[a+b])
    AryPush(BB) "ARYPUSH" = 74,
    ArySplat(B) "ARYSPLAT" = 75,
    /// R[a] = R[b][c]
    ARef(BBB) "AREF" = 76,
    /// R[b][c] = R[a]
    ASet(BBB) "ASET" = 77,
    /// *R[a], R[a+1]..R[a+c] = R[a][b..]
    APost(BBB) "APOST" = 78,
    /// R[a] = intern(R[a])
    Intern(B) "INTERN" = 79,
    /// R[a] = intern(Pool[b])
    Symbol(BB) "SYMBOL" = 80,
    /// R[a] = str_dup(Pool[b])
    String(BB) "STRING" = 81,
    /// R[a] = R[a] + R[a+1].to_s
    StrCat(B) "STRCAT" = 82,
    /// R[a] = {R[a] => R[a+1], ...} with b pairs
    Hash(BB) "HASH" = 83,
    HashAdd(BB) "HASHADD" = 84,
    HashCat(B) "HASHCAT" = 85,
    /// R[a] = lambda(Reps[b])
    Lambda(BB) "LAMBDA" = 86,
    /// R[a] = block(Reps[b])
    Block(BB) "BLOCK" = 87,
    /// R[a] = method body(Reps[b])
    Method(BB) "METHOD" = 88,
    RangeInc(B) "RANGE_INC" = 89,
    RangeExc(B) "RANGE_EXC" = 90,
    OClass(B) "OCLASS" = 91,
    /// R[a] = newclass(R[a], Syms[b], R[a+1])
    Class(BB) "CLASS" = 92,
    Module(BB) "MODULE" = 93,
    /// R[a] = blockexec(R[a], Reps[b])
    Exec(BB) "EXEC" = 94,
    /// R[a].define_method(Syms[b], R[a+1])
    Def(BB) "DEF" = 95,
    /// alias_method(target_class, Syms[a], Syms[b])
    Alias(BB) "ALIAS" = 96,
    Undef(B) "UNDEF" = 97,
    /// R[a] = R[a].singleton_class
    SClass(B) "SCLASS" = 98,
    TClass(B) "TCLASS" = 99,
    Debug(BBB) "DEBUG" = 100,
    /// raise LocalJumpError, Pool[a]
    Err(B) "ERR" = 101,
    Ext1(Z) "EXT1" = 102,
    Ext2(Z) "EXT2" = 103,
    Ext3(Z) "EXT3" = 104,
    Stop(Z) "STOP" = 105,
}

impl OpCode {
    /// Whether this opcode is a relative jump, and which operand holds the offset.
    pub fn jump_operand(self) -> Option<JumpOperand> {
        match self {
            OpCode::Jmp | OpCode::JmpUw => Some(JumpOperand::A),
            OpCode::JmpIf | OpCode::JmpNot | OpCode::JmpNil => Some(JumpOperand::B),
            _ => None,
        }
    }

    pub fn from_byte(b: u8) -> Option<OpCode> {
        OpCode::from_ordinal(b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpOperand {
    A,
    B,
}

#[cfg(test)]
mod test;
