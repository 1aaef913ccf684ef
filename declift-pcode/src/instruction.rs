//! PCode instructions, opcodes and operand varnodes.

use crate::offset::ComplexOffset;
use crate::register::Register;
use core::fmt;

/// A PCode operation code.
///
/// The set follows the register-transfer language machine instructions are decoded into. Integer
/// comparisons come in unsigned and signed (`S`-prefixed) flavors; `IntNegate` is bitwise
/// complement while `Int2Comp` is arithmetic negation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Copy the input to the output.
    Copy,
    /// Read memory at the address given by the first input.
    Load,
    /// Write the second input to memory at the address given by the first input.
    Store,

    /// Integer addition.
    IntAdd,
    /// Integer subtraction.
    IntSub,
    /// Integer multiplication.
    IntMult,
    /// Unsigned integer division.
    IntDiv,
    /// Signed integer division.
    IntSDiv,
    /// Unsigned integer remainder.
    IntRem,
    /// Signed integer remainder.
    IntSRem,
    /// Bitwise and.
    IntAnd,
    /// Bitwise or.
    IntOr,
    /// Bitwise exclusive or.
    IntXor,
    /// Bitwise complement.
    IntNegate,
    /// Arithmetic (two's complement) negation.
    Int2Comp,
    /// Shift left.
    IntLeft,
    /// Logical shift right.
    IntRight,
    /// Arithmetic shift right.
    IntSRight,
    /// Zero extension to the output size.
    IntZExt,
    /// Sign extension to the output size.
    IntSExt,

    /// Integer equality.
    IntEqual,
    /// Integer inequality.
    IntNotEqual,
    /// Unsigned less-than.
    IntLess,
    /// Unsigned less-or-equal.
    IntLessEqual,
    /// Signed less-than.
    IntSLess,
    /// Signed less-or-equal.
    IntSLessEqual,
    /// Unsigned carry out of an addition.
    IntCarry,
    /// Signed overflow of an addition.
    IntSCarry,
    /// Signed overflow of a subtraction.
    IntSBorrow,

    /// Boolean conjunction.
    BoolAnd,
    /// Boolean disjunction.
    BoolOr,
    /// Boolean exclusive or.
    BoolXor,
    /// Boolean negation.
    BoolNegate,

    /// Floating point addition.
    FloatAdd,
    /// Floating point subtraction.
    FloatSub,
    /// Floating point multiplication.
    FloatMult,
    /// Floating point division.
    FloatDiv,
    /// Floating point negation.
    FloatNeg,
    /// Floating point absolute value.
    FloatAbs,
    /// Floating point square root.
    FloatSqrt,
    /// Floating point equality.
    FloatEqual,
    /// Floating point inequality.
    FloatNotEqual,
    /// Floating point less-than.
    FloatLess,
    /// Floating point less-or-equal.
    FloatLessEqual,

    /// Unconditional branch to the first input.
    Branch,
    /// Conditional branch: branch to the first input if the second input is non-zero.
    CBranch,
    /// Indirect branch through a computed address.
    BranchInd,
    /// Direct call to the first input.
    Call,
    /// Indirect call through a computed address.
    CallInd,
    /// Return from the function.
    Return,
}

impl Opcode {
    /// True if the instruction transfers control (and therefore ends a basic block).
    pub fn is_branching(self) -> bool {
        matches!(
            self,
            Self::Branch | Self::CBranch | Self::BranchInd | Self::Return
        )
    }

    /// True if control can reach the next instruction in the stream.
    ///
    /// Calls fall through: the callee returns. A conditional branch falls through on the
    /// untaken side.
    pub fn can_fall_through(self) -> bool {
        !matches!(self, Self::Branch | Self::BranchInd | Self::Return)
    }

    /// True for the call opcodes.
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::CallInd)
    }

    /// True if the opcode produces a boolean (0/1) result.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::IntEqual
                | Self::IntNotEqual
                | Self::IntLess
                | Self::IntLessEqual
                | Self::IntSLess
                | Self::IntSLessEqual
                | Self::IntCarry
                | Self::IntSCarry
                | Self::IntSBorrow
                | Self::FloatEqual
                | Self::FloatNotEqual
                | Self::FloatLess
                | Self::FloatLessEqual
        )
    }

    /// True for the floating point opcodes.
    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            Self::FloatAdd
                | Self::FloatSub
                | Self::FloatMult
                | Self::FloatDiv
                | Self::FloatNeg
                | Self::FloatAbs
                | Self::FloatSqrt
                | Self::FloatEqual
                | Self::FloatNotEqual
                | Self::FloatLess
                | Self::FloatLessEqual
        )
    }

    fn name(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Load => "load",
            Self::Store => "store",
            Self::IntAdd => "int_add",
            Self::IntSub => "int_sub",
            Self::IntMult => "int_mult",
            Self::IntDiv => "int_div",
            Self::IntSDiv => "int_sdiv",
            Self::IntRem => "int_rem",
            Self::IntSRem => "int_srem",
            Self::IntAnd => "int_and",
            Self::IntOr => "int_or",
            Self::IntXor => "int_xor",
            Self::IntNegate => "int_negate",
            Self::Int2Comp => "int_2comp",
            Self::IntLeft => "int_left",
            Self::IntRight => "int_right",
            Self::IntSRight => "int_sright",
            Self::IntZExt => "int_zext",
            Self::IntSExt => "int_sext",
            Self::IntEqual => "int_equal",
            Self::IntNotEqual => "int_notequal",
            Self::IntLess => "int_less",
            Self::IntLessEqual => "int_lessequal",
            Self::IntSLess => "int_sless",
            Self::IntSLessEqual => "int_slessequal",
            Self::IntCarry => "int_carry",
            Self::IntSCarry => "int_scarry",
            Self::IntSBorrow => "int_sborrow",
            Self::BoolAnd => "bool_and",
            Self::BoolOr => "bool_or",
            Self::BoolXor => "bool_xor",
            Self::BoolNegate => "bool_negate",
            Self::FloatAdd => "float_add",
            Self::FloatSub => "float_sub",
            Self::FloatMult => "float_mult",
            Self::FloatDiv => "float_div",
            Self::FloatNeg => "float_neg",
            Self::FloatAbs => "float_abs",
            Self::FloatSqrt => "float_sqrt",
            Self::FloatEqual => "float_equal",
            Self::FloatNotEqual => "float_notequal",
            Self::FloatLess => "float_less",
            Self::FloatLessEqual => "float_lessequal",
            Self::Branch => "branch",
            Self::CBranch => "cbranch",
            Self::BranchInd => "branchind",
            Self::Call => "call",
            Self::CallInd => "callind",
            Self::Return => "return",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operand of a PCode instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Varnode {
    /// A register slice.
    Register(Register),
    /// A symbolic temporary produced by the decoder, unique within the stream.
    Symbol {
        /// Decoder-assigned unique id.
        id: u32,
        /// Width in bytes.
        size: u8,
    },
    /// A constant.
    Constant {
        /// The constant's value, zero extended.
        value: u64,
        /// Width in bytes.
        size: u8,
    },
}

impl Varnode {
    /// Width of the operand in bytes.
    pub fn size(self) -> u8 {
        match self {
            Self::Register(reg) => reg.size,
            Self::Symbol { size, .. } | Self::Constant { size, .. } => size,
        }
    }

    /// The register slice, if this operand is one.
    pub fn as_register(self) -> Option<Register> {
        match self {
            Self::Register(reg) => Some(reg),
            _ => None,
        }
    }

    /// The constant value, if this operand is one.
    pub fn as_constant(self) -> Option<u64> {
        match self {
            Self::Constant { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Register(reg) => reg.fmt(f),
            Self::Symbol { id, size } => write!(f, "u{id}:{size}"),
            Self::Constant { value, size } => write!(f, "{value:#x}:{size}"),
        }
    }
}

impl fmt::Debug for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

/// A single PCode operation.
///
/// The instruction remembers the byte length of the machine instruction it was decoded from so
/// that the end offset of the original instruction can be recovered without consulting the
/// decoder again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Where this operation lives in the image.
    pub offset: ComplexOffset,
    /// The operation.
    pub opcode: Opcode,
    /// Destination operand, if the opcode produces a value.
    pub output: Option<Varnode>,
    /// First input operand.
    pub input0: Option<Varnode>,
    /// Second input operand.
    pub input1: Option<Varnode>,
    /// Byte length of the originating machine instruction.
    pub orig_length: u8,
}

impl Instruction {
    /// Create an instruction.
    pub fn new(
        offset: ComplexOffset,
        opcode: Opcode,
        output: Option<Varnode>,
        input0: Option<Varnode>,
        input1: Option<Varnode>,
        orig_length: u8,
    ) -> Self {
        Self {
            offset,
            opcode,
            output,
            input0,
            input1,
            orig_length,
        }
    }

    /// End byte offset (exclusive) of the originating machine instruction.
    pub fn orig_offset_end(&self) -> u64 {
        self.offset.byte_offset() + u64::from(self.orig_length)
    }

    /// The branch target byte offset, for direct branch and call opcodes whose first input is a
    /// constant address.
    pub fn constant_target(&self) -> Option<u64> {
        match self.opcode {
            Opcode::Branch | Opcode::CBranch | Opcode::Call => {
                self.input0.and_then(Varnode::as_constant)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.offset, self.opcode)?;
        if let Some(out) = self.output {
            write!(f, " {out} <-")?;
        }
        if let Some(in0) = self.input0 {
            write!(f, " {in0}")?;
        }
        if let Some(in1) = self.input1 {
            write!(f, ", {in1}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterId;

    #[test]
    fn opcode_predicates() {
        assert!(Opcode::CBranch.is_branching());
        assert!(Opcode::CBranch.can_fall_through());
        assert!(!Opcode::Branch.can_fall_through());
        assert!(!Opcode::Call.is_branching());
        assert!(Opcode::Call.can_fall_through());
        assert!(Opcode::IntSLess.is_comparison());
        assert!(!Opcode::IntAdd.is_comparison());
    }

    #[test]
    fn display() {
        let rax = Register::whole(RegisterId::from_u16(0), 8);
        let instr = Instruction::new(
            ComplexOffset::new(0x1000, 0),
            Opcode::Copy,
            Some(Varnode::Register(rax)),
            Some(Varnode::Constant {
                value: 0x42,
                size: 8,
            }),
            None,
            3,
        );
        assert_eq!(instr.to_string(), "0x1000:0 copy r0:8 <- 0x42:8");
        assert_eq!(instr.orig_offset_end(), 0x1003);
    }
}
