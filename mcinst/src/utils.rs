use strum::EnumIs;
use thiserror::Error;

use crate::operand::{Opcode, PhysReg};

#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, Error)]
pub enum Error {
    /// The opcode has no descriptor in the instruction table.
    #[error("Opcode {0} has no descriptor in the instruction table.")]
    UnknownOpcode(Opcode),

    /// The register id is outside of the register table.
    #[error("Physical register {0} is not defined in the register table.")]
    UnknownRegister(PhysReg),

    /// A register cannot contain itself nor be related to the reserved `NoRegister` slot.
    #[error(
        "Invalid sub-register relation: `{sub}` cannot be declared a sub-register of `{sup}`."
    )]
    InvalidRegisterRelation { sup: PhysReg, sub: PhysReg },

    /// A non-empty nested instruction was found where the annotation sentinel was expected.
    #[error(
        "Operand #{position} is a nested instruction. Only the empty placeholder may separate prime operands from annotations."
    )]
    NestedInstructionOperand { position: usize },

    /// The annotation region contains something else than immediate slots.
    #[error(
        "Operand #{position} lies in the annotation region but is not an immediate annotation slot."
    )]
    MalformedAnnotationSlot { position: usize },

    /// An instruction has fewer prime operands than its descriptor requires.
    #[error(
        "Instruction `{name}` declares {expected} operands ({defs} defs) but only {found} prime operands are present."
    )]
    MissingOperands {
        name: String,
        expected: usize,
        defs: usize,
        found: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
