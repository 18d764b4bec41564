//! Per-opcode instruction descriptors.
//!
//! A descriptor tells generic code how to read an instruction without knowing
//! the target: how many prime operands it has, which of them are defs, which
//! registers it reads or writes implicitly, and a handful of behaviour flags.
use std::ops::Range;

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    inst::Inst,
    operand::{Opcode, PhysReg},
    utils::{Error, Result},
};

bitflags! {
    /// Behaviour flags attached to an opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct InstrFlags: u32 {
        /// The instruction may read memory.
        const MAY_LOAD = 1 << 0;
        /// The instruction may write memory.
        const MAY_STORE = 1 << 1;
        /// Pseudo instruction, never emitted as is.
        const PSEUDO = 1 << 2;
        const CALL = 1 << 3;
        const RETURN = 1 << 4;
        const BRANCH = 1 << 5;
        const CONDITIONAL_BRANCH = 1 << 6;
        /// Branch target held in a register or in memory.
        const INDIRECT_BRANCH = 1 << 7;
        /// Control never falls through to the next instruction.
        const BARRIER = 1 << 8;
        const TERMINATOR = 1 << 9;
        /// Instruction prefix (lock, rep, ...). Touches no register by itself.
        const PREFIX = 1 << 10;
        /// Call-frame-information pseudo instruction.
        const CFI = 1 << 11;
        /// The instruction takes a variable number of trailing operands.
        const VARIADIC = 1 << 12;
    }
}

/// Static description of one opcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InstrDesc {
    pub name: String,
    /// Number of prime operands (explicit defs included).
    pub num_operands: usize,
    /// Number of leading prime operands that are defs.
    pub num_defs: usize,
    pub flags: InstrFlags,
    pub implicit_defs: SmallVec<[PhysReg; 4]>,
    pub implicit_uses: SmallVec<[PhysReg; 4]>,
}

impl InstrDesc {
    pub fn new(name: impl Into<String>, num_operands: usize, num_defs: usize) -> Self {
        debug_assert!(num_defs <= num_operands);
        Self {
            name: name.into(),
            num_operands,
            num_defs,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: InstrFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_implicit_defs(mut self, regs: impl IntoIterator<Item = PhysReg>) -> Self {
        self.implicit_defs.extend(regs);
        self
    }

    pub fn with_implicit_uses(mut self, regs: impl IntoIterator<Item = PhysReg>) -> Self {
        self.implicit_uses.extend(regs);
        self
    }

    pub fn may_load(&self) -> bool {
        self.flags.contains(InstrFlags::MAY_LOAD)
    }

    pub fn may_store(&self) -> bool {
        self.flags.contains(InstrFlags::MAY_STORE)
    }

    pub fn is_pseudo(&self) -> bool {
        self.flags.contains(InstrFlags::PSEUDO)
    }

    pub fn is_call(&self) -> bool {
        self.flags.contains(InstrFlags::CALL)
    }

    pub fn is_return(&self) -> bool {
        self.flags.contains(InstrFlags::RETURN)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(InstrFlags::BRANCH)
    }

    pub fn is_conditional_branch(&self) -> bool {
        self.flags
            .contains(InstrFlags::BRANCH | InstrFlags::CONDITIONAL_BRANCH)
    }

    pub fn is_unconditional_branch(&self) -> bool {
        self.flags.contains(InstrFlags::BRANCH | InstrFlags::BARRIER)
            && !self.flags.contains(InstrFlags::INDIRECT_BRANCH)
    }

    pub fn is_indirect_branch(&self) -> bool {
        self.flags
            .contains(InstrFlags::BRANCH | InstrFlags::INDIRECT_BRANCH)
    }

    pub fn is_barrier(&self) -> bool {
        self.flags.contains(InstrFlags::BARRIER)
    }

    pub fn is_terminator(&self) -> bool {
        self.flags.contains(InstrFlags::TERMINATOR)
    }

    pub fn is_prefix(&self) -> bool {
        self.flags.contains(InstrFlags::PREFIX)
    }

    pub fn is_cfi(&self) -> bool {
        self.flags.contains(InstrFlags::CFI)
    }

    pub fn is_variadic(&self) -> bool {
        self.flags.contains(InstrFlags::VARIADIC)
    }

    /// Operand positions of the explicit defs of `inst`.
    pub fn def_operands(&self, inst: &Inst) -> Range<usize> {
        0..self.num_defs.min(inst.num_prime_operands())
    }

    /// Operand positions of the explicit uses of `inst`, i.e. every prime
    /// operand after the defs.
    pub fn use_operands(&self, inst: &Inst) -> Range<usize> {
        let prime = inst.num_prime_operands();
        self.num_defs.min(prime)..prime
    }

    /// Whether `inst` carries at least the operands this descriptor declares.
    pub fn verify(&self, inst: &Inst) -> Result<()> {
        let found = inst.num_prime_operands();
        if found < self.num_operands {
            return Err(Error::MissingOperands {
                name: self.name.clone(),
                expected: self.num_operands,
                defs: self.num_defs,
                found,
            });
        }
        Ok(())
    }
}

/// Opcode-indexed descriptor table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InstrInfo {
    descs: Vec<InstrDesc>,
}

impl InstrInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor and return the opcode assigned to it.
    pub fn add(&mut self, desc: InstrDesc) -> Opcode {
        let opcode = self.descs.len() as Opcode;
        self.descs.push(desc);
        opcode
    }

    pub fn try_get(&self, opcode: Opcode) -> Result<&InstrDesc> {
        self.descs
            .get(opcode as usize)
            .ok_or(Error::UnknownOpcode(opcode))
    }

    /// Descriptor of `opcode`. Panics on an opcode outside of the table,
    /// which means the instruction was built against another table.
    pub fn get(&self, opcode: Opcode) -> &InstrDesc {
        match self.try_get(opcode) {
            Ok(desc) => desc,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn desc_of(&self, inst: &Inst) -> &InstrDesc {
        self.get(inst.opcode())
    }

    pub fn find(&self, name: &str) -> Option<Opcode> {
        self.descs
            .iter()
            .position(|desc| desc.name == name)
            .map(|i| i as Opcode)
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Opcode, &InstrDesc)> {
        self.descs
            .iter()
            .enumerate()
            .map(|(i, desc)| (i as Opcode, desc))
    }
}

impl FromIterator<InstrDesc> for InstrInfo {
    fn from_iter<I: IntoIterator<Item = InstrDesc>>(iter: I) -> Self {
        Self {
            descs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Operand;

    #[test]
    fn branch_predicates_follow_flags() {
        let jmp = InstrDesc::new("JMP", 1, 0)
            .with_flags(InstrFlags::BRANCH | InstrFlags::BARRIER | InstrFlags::TERMINATOR);
        let jcc = InstrDesc::new("JCC", 1, 0)
            .with_flags(InstrFlags::BRANCH | InstrFlags::CONDITIONAL_BRANCH);
        let jmp_reg = InstrDesc::new("JMP_REG", 1, 0).with_flags(
            InstrFlags::BRANCH | InstrFlags::BARRIER | InstrFlags::INDIRECT_BRANCH,
        );

        assert!(jmp.is_unconditional_branch());
        assert!(!jmp.is_conditional_branch());
        assert!(jcc.is_conditional_branch());
        assert!(!jcc.is_unconditional_branch());
        assert!(jmp_reg.is_indirect_branch());
        assert!(!jmp_reg.is_unconditional_branch());
    }

    #[test]
    fn def_and_use_ranges_stop_at_annotations() {
        let desc = InstrDesc::new("ADD", 3, 1);
        let mut inst = Inst::with_operands(0, [Operand::Reg(1), Operand::Reg(1), Operand::Reg(2)]);
        inst.add_operand(Operand::sentinel());
        inst.add_operand(Operand::Imm(5));

        assert_eq!(desc.def_operands(&inst), 0..1);
        assert_eq!(desc.use_operands(&inst), 1..3);
        assert!(desc.verify(&inst).is_ok());
    }

    #[test]
    fn table_lookup() {
        let info: InstrInfo = [InstrDesc::new("NOP", 0, 0), InstrDesc::new("RET", 0, 0)]
            .into_iter()
            .collect();
        assert_eq!(info.find("RET"), Some(1));
        assert_eq!(info.try_get(9), Err(Error::UnknownOpcode(9)));
        assert_eq!(info.len(), 2);
    }
}
