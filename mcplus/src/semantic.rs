//! Typed accessors over the built-in annotations.
use std::sync::atomic::Ordering;

use mcinst::{Inst, PhysReg, Symbol};

use crate::{
    allocator::AllocatorId,
    annotation::BuiltinAnnotation,
    builder::McPlusBuilder,
    target::Target,
    utils::error::{McPlusError, fatal},
};

/// Name of the boxed annotation holding the index register of a jump table
/// dispatch.
pub const JUMP_TABLE_INDEX_REG: &str = "JTIndexReg";

/// Exception-handling info of an invoke.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LandingPad {
    pub symbol: Option<Symbol>,
    pub action: u64,
}

impl<T: Target> McPlusBuilder<T> {
    // Calls and branches

    /// Whether `inst` is a call, a tail call included.
    pub fn is_call(&self, inst: &Inst) -> bool {
        self.target().is_call(self, inst) || self.is_tail_call(inst)
    }

    /// Unconditional branches that are not tail calls.
    pub fn is_unconditional_branch(&self, inst: &Inst) -> bool {
        self.target().is_unconditional_branch(self, inst) && !self.is_tail_call(inst)
    }

    pub fn is_tail_call(&self, inst: &Inst) -> bool {
        if self.get_conditional_tail_call(inst).is_some() {
            return true;
        }
        self.get_annotation_op_value(inst, BuiltinAnnotation::TailCall)
            .is_some_and(|value| value != 0)
    }

    /// Mark `inst` as a tail call. Meant for targets converting jumps.
    pub fn set_tail_call(&self, inst: &mut Inst) {
        self.set_annotation_op_value(inst, BuiltinAnnotation::TailCall, 1);
    }

    /// Whether the conditional branch `inst` can have its condition inverted.
    ///
    /// # Panics
    /// If `inst` is not a conditional branch.
    #[track_caller]
    pub fn is_reversible_branch(&self, inst: &Inst) -> bool {
        if !self.is_conditional_branch(inst) {
            fatal(McPlusError::NotConditionalBranch {
                opcode: inst.opcode(),
            });
        }
        !self.is_dynamic_branch(inst)
    }

    /// A call with exception-handling info.
    pub fn is_invoke(&self, inst: &Inst) -> bool {
        self.is_call(inst) && self.get_eh_info(inst).is_some()
    }

    // Exception handling

    pub fn get_eh_info(&self, inst: &Inst) -> Option<LandingPad> {
        let lp = self.get_annotation_op_value(inst, BuiltinAnnotation::EHLandingPad)?;
        let action = self.get_annotation_op_value(inst, BuiltinAnnotation::EHAction)?;
        Some(LandingPad {
            symbol: self.symbols.from_payload(lp),
            action: action as u64,
        })
    }

    pub fn add_eh_info(&self, inst: &mut Inst, lp: &LandingPad) {
        if self.is_call(inst) {
            self.set_eh_info(inst, lp);
        }
    }

    /// Replace existing EH info. Returns `false` if `inst` has none.
    pub fn update_eh_info(&self, inst: &mut Inst, lp: &LandingPad) -> bool {
        if !self.is_invoke(inst) {
            return false;
        }
        self.set_eh_info(inst, lp);
        true
    }

    fn set_eh_info(&self, inst: &mut Inst, lp: &LandingPad) {
        let symbol = self.symbols.to_payload(lp.symbol.as_ref());
        self.set_annotation_op_value(inst, BuiltinAnnotation::EHLandingPad, symbol);
        self.set_annotation_op_value(inst, BuiltinAnnotation::EHAction, lp.action as i64);
    }

    /// `GNU_args_size` at this invoke, `-1` when unknown.
    pub fn get_gnu_args_size(&self, inst: &Inst) -> i64 {
        self.get_annotation_op_value(inst, BuiltinAnnotation::GnuArgsSize)
            .unwrap_or(-1)
    }

    /// # Panics
    /// If `inst` is not an invoke or `size` is negative.
    #[track_caller]
    pub fn add_gnu_args_size(&self, inst: &mut Inst, size: i64) {
        if size < 0 || !self.is_invoke(inst) {
            fatal(McPlusError::InvalidGnuArgsSize { size });
        }
        self.set_annotation_op_value(inst, BuiltinAnnotation::GnuArgsSize, size);
    }

    // Jump tables

    /// Address of the jump table used by `inst`, 0 when none.
    pub fn get_jump_table(&self, inst: &Inst) -> u64 {
        self.get_annotation_op_value(inst, BuiltinAnnotation::JumpTable)
            .map_or(0, |value| value as u64)
    }

    pub fn get_jump_table_index_reg(&self, inst: &Inst) -> PhysReg {
        self.annotation_as::<PhysReg>(inst, JUMP_TABLE_INDEX_REG)
    }

    /// Record that `inst` dispatches through the jump table at `address`,
    /// indexed by `index_reg`. Only indirect branches qualify.
    pub fn set_jump_table(
        &self,
        inst: &mut Inst,
        address: u64,
        index_reg: PhysReg,
        allocator: AllocatorId,
    ) -> bool {
        if !self.is_indirect_branch(inst) {
            return false;
        }
        self.set_annotation_op_value(inst, BuiltinAnnotation::JumpTable, address as i64);
        self.get_or_create_annotation_as::<PhysReg, _>(
            inst,
            JUMP_TABLE_INDEX_REG,
            allocator,
            |reg| *reg = index_reg,
        );
        true
    }

    pub fn unset_jump_table(&self, inst: &mut Inst) -> bool {
        if self.get_jump_table(inst) == 0 {
            return false;
        }
        self.remove_annotation(inst, BuiltinAnnotation::JumpTable);
        self.remove_annotation(inst, JUMP_TABLE_INDEX_REG);
        true
    }

    // Conditional tail calls

    pub fn get_conditional_tail_call(&self, inst: &Inst) -> Option<u64> {
        self.get_annotation_op_value(inst, BuiltinAnnotation::ConditionalTailCall)
            .map(|dest| dest as u64)
    }

    /// Mark the conditional branch `inst` as a tail call to `dest`.
    pub fn set_conditional_tail_call(&self, inst: &mut Inst, dest: u64) -> bool {
        if !self.is_conditional_branch(inst) {
            return false;
        }
        self.set_annotation_op_value(inst, BuiltinAnnotation::ConditionalTailCall, dest as i64);
        true
    }

    pub fn unset_conditional_tail_call(&self, inst: &mut Inst) -> bool {
        self.remove_annotation(inst, BuiltinAnnotation::ConditionalTailCall)
    }

    // Offsets

    pub fn get_offset(&self, inst: &Inst) -> Option<u32> {
        self.get_annotation_op_value(inst, BuiltinAnnotation::Offset)
            .map(|offset| offset as u32)
    }

    pub fn get_offset_with_default(&self, inst: &Inst, default: u32) -> u32 {
        self.get_offset(inst).unwrap_or(default)
    }

    pub fn set_offset(&self, inst: &mut Inst, offset: u32) -> bool {
        self.set_annotation_op_value(inst, BuiltinAnnotation::Offset, offset as i64);
        true
    }

    pub fn clear_offset(&self, inst: &mut Inst) -> bool {
        self.remove_annotation(inst, BuiltinAnnotation::Offset)
    }

    // Labels

    pub fn get_inst_label(&self, inst: &Inst) -> Option<Symbol> {
        let payload = self.get_annotation_op_value(inst, BuiltinAnnotation::Label)?;
        self.symbols.from_payload(payload)
    }

    pub fn set_inst_label(&self, inst: &mut Inst, label: &Symbol) {
        let payload = self.symbols.to_payload(Some(label));
        self.set_annotation_op_value(inst, BuiltinAnnotation::Label, payload);
    }

    /// Label of `inst`, creating a fresh temporary one named after `name` if
    /// it has none.
    pub fn get_or_create_inst_label(&self, inst: &mut Inst, name: &str) -> Symbol {
        if let Some(label) = self.get_inst_label(inst) {
            return label;
        }
        let id = self.label_counter.fetch_add(1, Ordering::Relaxed);
        let label = Symbol::new(format!("{}{}{}", self.options().label_prefix, name, id));
        self.set_inst_label(inst, &label);
        label
    }

    // Sizes

    pub fn get_size(&self, inst: &Inst) -> Option<u32> {
        self.get_annotation_op_value(inst, BuiltinAnnotation::Size)
            .map(|size| size as u32)
    }

    pub fn set_size(&self, inst: &mut Inst, size: u32) {
        self.set_annotation_op_value(inst, BuiltinAnnotation::Size, size as i64);
    }

    /// Size recorded on `inst`, else the size computed by the target.
    pub fn get_instruction_size(&self, inst: &Inst) -> Option<u32> {
        self.get_size(inst)
            .or_else(|| self.target().get_instruction_size(self, inst))
    }

    // Dynamic branches

    pub fn is_dynamic_branch(&self, inst: &Inst) -> bool {
        self.has_annotation(inst, BuiltinAnnotation::DynamicBranch)
    }

    pub fn get_dynamic_branch_id(&self, inst: &Inst) -> Option<u32> {
        self.get_annotation_op_value(inst, BuiltinAnnotation::DynamicBranch)
            .map(|id| id as u32)
    }

    pub fn set_dynamic_branch(&self, inst: &mut Inst, id: u32) {
        self.set_annotation_op_value(inst, BuiltinAnnotation::DynamicBranch, id as i64);
    }
}
