//! Machine instruction records and the instruction-set description tables
//! they are interpreted against.
//!
//! - [`operand`]: operands, symbolic expressions and physical register ids.
//! - [`inst`]: the instruction record itself, including the location of the
//!   out-of-band annotation region appended after the prime operands.
//! - [`desc`]: per-opcode descriptors (operand counts, flags, implicit
//!   register operands) and the [`desc::InstrInfo`] table.
//! - [`register`]: per-register descriptors (size, sub/super registers) and
//!   the [`register::RegisterInfo`] table.
//!
//! The descriptor tables are owned by whatever instruction-set description
//! the embedder has; this crate only fixes their shape.

pub mod desc;
pub mod inst;
pub mod operand;
pub mod register;
pub mod utils;

pub use desc::{InstrDesc, InstrFlags, InstrInfo};
pub use inst::Inst;
pub use operand::{BinaryOp, Expr, NO_REGISTER, Opcode, Operand, PhysReg, Symbol};
pub use register::{RegisterDesc, RegisterInfo};
pub use utils::Error;
