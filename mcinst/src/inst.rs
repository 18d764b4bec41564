//! The machine instruction record.
//!
//! An [`Inst`] is an opcode and an ordered operand list. The operand list is
//! split in two regions:
//!
//! ```text
//!   [ prime operands ... ] [ sentinel ] [ annotation slot ... ]
//! ```
//!
//! Prime operands are the real architectural operands. The sentinel
//! (`Operand::Inst(None)`) and the immediate slots after it form the
//! annotation region, which this crate only locates and truncates; the
//! meaning of the slots is owned by the annotation layer built on top.
//!
//! An instruction that never carried annotations has no sentinel, so
//! cloning, comparing or hashing plain instructions is unaffected.
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    desc::InstrInfo,
    operand::{Opcode, Operand},
    register::RegisterInfo,
    utils::{Error, Result},
};

/// Inline capacity of an operand list before spilling to the heap. Covers
/// the prime operands of most instructions plus a couple of annotations.
pub const INLINE_OPERANDS: usize = 8;

pub type OperandList = SmallVec<[Operand; INLINE_OPERANDS]>;

/// A machine instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Inst {
    opcode: Opcode,
    operands: OperandList,
}

impl Inst {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operands: SmallVec::new(),
        }
    }

    pub fn with_operands(opcode: Opcode, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            opcode,
            operands: operands.into_iter().collect(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    /// All operands, annotation region included.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operands_mut(&mut self) -> &mut [Operand] {
        &mut self.operands
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    pub fn operand_mut(&mut self, index: usize) -> Option<&mut Operand> {
        self.operands.get_mut(index)
    }

    pub fn add_operand(&mut self, operand: Operand) {
        self.operands.push(operand);
    }

    /// Insert a prime operand at `index`. Panics if `index` lies past the
    /// prime operands.
    pub fn insert_operand(&mut self, index: usize, operand: Operand) {
        assert!(
            index <= self.num_prime_operands(),
            "prime operands cannot be inserted inside the annotation region"
        );
        self.operands.insert(index, operand);
    }

    pub fn remove_operand(&mut self, index: usize) -> Operand {
        self.operands.remove(index)
    }

    /// Remove every operand, annotations included.
    pub fn clear(&mut self) {
        self.operands.clear();
    }

    /// Replace opcode and prime operands, keeping the annotation region.
    pub fn rebuild(&mut self, opcode: Opcode, prime: impl IntoIterator<Item = Operand>) {
        let region = self.split_off_annotation_region();
        self.opcode = opcode;
        self.operands = prime.into_iter().collect();
        if let Some(region) = region {
            self.operands.extend(region);
        }
    }

    /// Position of the annotation sentinel, if the instruction has an
    /// annotation region.
    ///
    /// The operand list is scanned from the back: the region only ever holds
    /// immediates, so the first non-immediate operand found is either the
    /// sentinel or a prime operand (in which case there is no region).
    pub fn annotation_sentinel(&self) -> Option<usize> {
        for (position, operand) in self.operands.iter().enumerate().rev() {
            match operand {
                Operand::Inst(None) => return Some(position),
                Operand::Imm(_) => continue,
                _ => return None,
            }
        }
        None
    }

    pub fn has_annotation_region(&self) -> bool {
        self.annotation_sentinel().is_some()
    }

    /// Number of prime (architectural) operands.
    pub fn num_prime_operands(&self) -> usize {
        self.annotation_sentinel()
            .unwrap_or(self.operands.len())
    }

    pub fn prime_operands(&self) -> &[Operand] {
        &self.operands[..self.num_prime_operands()]
    }

    pub fn prime_operands_mut(&mut self) -> &mut [Operand] {
        let n = self.num_prime_operands();
        &mut self.operands[..n]
    }

    /// The annotation slots (sentinel excluded). Empty when there is no
    /// annotation region.
    pub fn annotation_slots(&self) -> &[Operand] {
        match self.annotation_sentinel() {
            Some(sentinel) => &self.operands[sentinel + 1..],
            None => &[],
        }
    }

    pub fn annotation_slots_mut(&mut self) -> &mut [Operand] {
        match self.annotation_sentinel() {
            Some(sentinel) => &mut self.operands[sentinel + 1..],
            None => &mut [],
        }
    }

    /// Drop the sentinel and every annotation slot. Returns `true` if there
    /// was a region to drop.
    pub fn truncate_annotation_region(&mut self) -> bool {
        match self.annotation_sentinel() {
            Some(sentinel) => {
                self.operands.truncate(sentinel);
                true
            }
            None => false,
        }
    }

    /// Detach the annotation region (sentinel first, then the slots), leaving
    /// only the prime operands behind.
    pub fn split_off_annotation_region(&mut self) -> Option<OperandList> {
        let sentinel = self.annotation_sentinel()?;
        Some(self.operands.drain(sentinel..).collect())
    }

    /// Check the operand-list layout: no non-empty nested instruction, and
    /// nothing but immediates after the sentinel.
    pub fn verify_layout(&self) -> Result<()> {
        let mut in_region = false;
        for (position, operand) in self.operands.iter().enumerate() {
            match operand {
                Operand::Inst(Some(_)) => {
                    return Err(Error::NestedInstructionOperand { position });
                }
                Operand::Inst(None) if in_region => {
                    return Err(Error::MalformedAnnotationSlot { position });
                }
                Operand::Inst(None) => in_region = true,
                Operand::Imm(_) => {}
                _ if in_region => return Err(Error::MalformedAnnotationSlot { position }),
                _ => {}
            }
        }
        Ok(())
    }

    /// Format this instruction. Opcode and register names are resolved when
    /// the corresponding tables are provided. The annotation region is not
    /// printed.
    pub fn fmt<'a>(
        &'a self,
        info: Option<&'a InstrInfo>,
        regs: Option<&'a RegisterInfo>,
    ) -> impl fmt::Display + 'a {
        struct Fmt<'a> {
            inst: &'a Inst,
            info: Option<&'a InstrInfo>,
            regs: Option<&'a RegisterInfo>,
        }

        impl fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.info.and_then(|i| i.try_get(self.inst.opcode).ok()) {
                    Some(desc) => write!(f, "{}", desc.name)?,
                    None => write!(f, "opcode.{}", self.inst.opcode)?,
                }
                for (i, operand) in self.inst.prime_operands().iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}{}", sep, operand.fmt(self.regs))?;
                }
                Ok(())
            }
        }

        Fmt {
            inst: self,
            info,
            regs,
        }
    }
}
