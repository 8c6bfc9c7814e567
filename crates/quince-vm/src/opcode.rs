//! OpCode definitions for the Quince VM
//!
//! Instructions are 32-bit words partitioned Lua 5.1 style:
//!
//! ```text
//!   [ op:6 | a:8 | c:9 | b:9 ]      (LSB ... MSB)
//! ```
//!
//! with a `bx = (c << 9) | b` 18-bit unsigned view and a signed
//! `sbx = bx - 2^17` view for jumps. Encoding helpers live in
//! [`crate::chunk::instruction`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // --- Data movement ---
    /// R[A] := R[B]
    Move = 0,
    /// R[A] := K[Bx]
    LoadK,
    /// R[A] := bool(B); if C, skip next instruction
    LoadBool,
    /// R[A..=A+B] := nil
    LoadNil,

    // --- Arithmetic ---
    /// R[A] := R[B] + R[C]  (number add, `__add__` overload, or
    /// string concatenation fallback)
    Add,
    /// R[A] := R[B] - R[C]
    Sub,
    /// R[A] := R[B] * R[C]
    Mul,
    /// R[A] := R[B] / R[C]
    Div,
    /// R[A] := R[B] % R[C]
    Mod,
    /// R[A] := R[B] ^ R[C]
    Pow,
    /// R[A] := -R[B]
    Unm,

    // --- Logic ---
    /// R[A] := not R[B]
    Not,
    /// R[A] := length of R[B]
    Len,
    /// R[A] := to_string(R[B]) ++ to_string(R[C])
    Concat,

    // --- Comparison (result is a boolean in R[A]) ---
    Eq,
    Lt,
    Le,

    // --- Control flow ---
    /// ip += sBx
    Jmp,
    /// if truthy(R[A]) == (C != 0), skip next instruction
    Test,
    /// Reserved for short-circuit fusion; never emitted.
    TestSet,

    // --- Calls ---
    /// R[A](R[A+1] .. R[A+B-1]); result written back to R[A]
    Call,
    /// Reserved; never emitted.
    TailCall,
    /// B > 1: return R[A]; otherwise return nil
    Return,

    // --- Globals and upvalues ---
    /// R[A] := globals[K[Bx]]
    GetGlobal,
    /// globals[K[Bx]] := R[A]
    SetGlobal,
    /// R[A] := upvalues[B]
    GetUpval,
    /// upvalues[B] := R[A]
    SetUpval,
    /// R[A] := close over K[Bx]; followed by one capture word per upvalue
    Closure,

    // --- Aggregates ---
    NewList,
    NewTable,
    /// R[A] := R[B][R[C]]
    GetTable,
    /// R[A][R[B]] := R[C]
    SetTable,
    /// Reserved; never emitted.
    SelfOp,

    // --- Iteration ---
    /// Reserved numeric-for; never emitted.
    ForLoop,
    /// Reserved numeric-for; never emitted.
    ForPrep,
    /// Drive one iteration step over the state block at B; the loop result
    /// lands in R[A] (nil when exhausted), its companion in R[A+1]
    TForCall,
    /// if R[A+2] is not nil: R[A+1] := R[A+2]; ip += sBx
    TForLoop,

    // --- Modules ---
    /// R[A] := load module named K[Bx]
    Import,
    /// current module exports[K[Bx]] := R[A]
    Export,

    // --- Misc ---
    /// R[A] := iterator for R[B] (calls `iterator` on instances)
    GetIter,
    /// R[A] := R[B][R[C] : R[C+1]]
    Slice,
    /// print R[A..A+B-1] separated by spaces, then a newline
    Print,
}

pub const OPCODE_COUNT: u8 = OpCode::Print as u8 + 1;

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        if byte < OPCODE_COUNT {
            // Safety: OpCode is repr(u8) with contiguous discriminants
            // starting at zero, checked against OPCODE_COUNT above.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Jmp => "JMP",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::Closure => "CLOSURE",
            OpCode::NewList => "NEWLIST",
            OpCode::NewTable => "NEWTABLE",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTable => "SETTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::Import => "IMPORT",
            OpCode::Export => "EXPORT",
            OpCode::GetIter => "GETITER",
            OpCode::Slice => "SLICE",
            OpCode::Print => "PRINT",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_fits_six_bits() {
        assert!(OPCODE_COUNT <= 64);
    }

    #[test]
    fn round_trip() {
        for byte in 0..OPCODE_COUNT {
            let op = OpCode::from_u8(byte).expect("valid opcode byte");
            assert_eq!(op.as_u8(), byte);
        }
        assert_eq!(OpCode::from_u8(OPCODE_COUNT), None);
        assert_eq!(OpCode::from_u8(63), None);
    }
}
