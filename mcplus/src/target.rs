//! Target-specific hooks.
//!
//! A [`Target`] supplies everything the generic layer cannot know: how to
//! build concrete instructions, how symbols are encoded in operands, the
//! calling convention, and the interior matchers used to recognise idioms.
//! Classification queries have defaults backed by the instruction
//! descriptors; the rest abort with [`McPlusError::NotImplemented`] unless the
//! target overrides them.
//!
//! [`McPlusError::NotImplemented`]: crate::McPlusError::NotImplemented
use bit_set::BitSet;
use mcinst::{Inst, PhysReg, Symbol};
use strum::{Display, EnumIs};

use crate::{
    builder::McPlusBuilder,
    matcher::BoxedMatcher,
    utils::error::not_implemented,
};

/// Classification of an indirect branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIs)]
pub enum IndirectBranchType {
    Unknown,
    /// Possibly a tail call.
    PossibleTailCall,
    PossibleJumpTable,
    /// Possibly a jump table for position-independent code.
    PossiblePicJumpTable,
    /// Possibly a computed goto.
    PossibleGoto,
    /// Possibly an indirect branch to a fixed location.
    PossibleFixedBranch,
    /// Possibly an indirect jump to a fixed entry in a PIC jump table.
    PossiblePicFixedBranch,
}

/// Memory operand of an indirect branch, as recovered by
/// [`Target::analyze_indirect_branch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndirectBranchInfo {
    pub base_reg: Option<PhysReg>,
    pub scale: i64,
    pub index_reg: Option<PhysReg>,
    pub displacement: i64,
    pub displacement_symbol: Option<Symbol>,
    /// Position, in the analysed window, of the instruction computing the
    /// branch target.
    pub mem_location: Option<usize>,
}

pub trait Target: Send + Sync + Sized + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str;

    // Descriptor-backed classification.

    fn is_branch(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_branch()
    }

    fn is_conditional_branch(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_conditional_branch()
    }

    fn is_unconditional_branch(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_unconditional_branch()
    }

    fn is_indirect_branch(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_indirect_branch()
    }

    fn is_call(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_call()
    }

    fn is_return(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_return()
    }

    fn is_pseudo(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_pseudo()
    }

    fn is_terminator(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_terminator()
    }

    fn may_load(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).may_load()
    }

    fn may_store(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).may_store()
    }

    fn is_prefix(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        false
    }

    fn is_cfi(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        false
    }

    /// Encoded size, when the target can compute it without an encoder.
    fn get_instruction_size(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> Option<u32> {
        None
    }

    // Target-only queries.

    fn is_indirect_call(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        not_implemented(self.name(), "is_indirect_call")
    }

    fn is_conditional_move(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        not_implemented(self.name(), "is_conditional_move")
    }

    fn is_noop(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        not_implemented(self.name(), "is_noop")
    }

    /// Symbol referenced by operand `op_num`, if any.
    fn get_target_symbol(
        &self,
        _mcb: &McPlusBuilder<Self>,
        _inst: &Inst,
        _op_num: usize,
    ) -> Option<Symbol> {
        not_implemented(self.name(), "get_target_symbol")
    }

    /// Offset from the symbol referenced by operand `op_num`, 0 if none.
    fn get_target_addend(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst, _op_num: usize) -> i64 {
        not_implemented(self.name(), "get_target_addend")
    }

    /// Registers carrying call arguments.
    fn regs_used_as_params(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        not_implemented(self.name(), "regs_used_as_params")
    }

    /// Registers live out of a function at a return.
    fn default_live_out(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        not_implemented(self.name(), "default_live_out")
    }

    fn callee_saved_regs(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        not_implemented(self.name(), "callee_saved_regs")
    }

    /// The alias of `reg` that is `size` bytes wide.
    fn get_alias_sized(&self, _mcb: &McPlusBuilder<Self>, _reg: PhysReg, _size: u8) -> PhysReg {
        not_implemented(self.name(), "get_alias_sized")
    }

    // Creators.

    fn create_noop(&self, _mcb: &McPlusBuilder<Self>) -> Inst {
        not_implemented(self.name(), "create_noop")
    }

    fn create_uncond_branch(&self, _mcb: &McPlusBuilder<Self>, _target: &Symbol) -> Inst {
        not_implemented(self.name(), "create_uncond_branch")
    }

    fn create_direct_call(&self, _mcb: &McPlusBuilder<Self>, _target: &Symbol) -> Inst {
        not_implemented(self.name(), "create_direct_call")
    }

    /// Rewrite an unconditional jump into a tail call. Returns `false` when
    /// `inst` cannot be converted.
    fn convert_jmp_to_tail_call(&self, _mcb: &McPlusBuilder<Self>, _inst: &mut Inst) -> bool {
        not_implemented(self.name(), "convert_jmp_to_tail_call")
    }

    fn convert_tail_call_to_jmp(&self, _mcb: &McPlusBuilder<Self>, _inst: &mut Inst) -> bool {
        not_implemented(self.name(), "convert_tail_call_to_jmp")
    }

    /// Classify the indirect branch ending `window`.
    fn analyze_indirect_branch(
        &self,
        _mcb: &McPlusBuilder<Self>,
        _window: &[Inst],
        _ptr_size: u8,
    ) -> (IndirectBranchType, IndirectBranchInfo) {
        not_implemented(self.name(), "analyze_indirect_branch")
    }

    // Interior matchers.

    /// Indirect jump through the register matched by `target`.
    fn match_ind_jmp(&self, _mcb: &McPlusBuilder<Self>, _target: BoxedMatcher<Self>) -> BoxedMatcher<Self> {
        not_implemented(self.name(), "match_ind_jmp")
    }

    /// Indirect jump through memory at `base + scale * index + offset`.
    fn match_ind_jmp_mem(
        &self,
        _mcb: &McPlusBuilder<Self>,
        _base: BoxedMatcher<Self>,
        _scale: BoxedMatcher<Self>,
        _index: BoxedMatcher<Self>,
        _offset: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        not_implemented(self.name(), "match_ind_jmp_mem")
    }

    /// Addition of the operands matched by `a` and `b`, in either order.
    fn match_add(
        &self,
        _mcb: &McPlusBuilder<Self>,
        _a: BoxedMatcher<Self>,
        _b: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        not_implemented(self.name(), "match_add")
    }

    fn match_load_addr(&self, _mcb: &McPlusBuilder<Self>, _target: BoxedMatcher<Self>) -> BoxedMatcher<Self> {
        not_implemented(self.name(), "match_load_addr")
    }

    fn match_load(
        &self,
        _mcb: &McPlusBuilder<Self>,
        _base: BoxedMatcher<Self>,
        _scale: BoxedMatcher<Self>,
        _index: BoxedMatcher<Self>,
        _offset: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        not_implemented(self.name(), "match_load")
    }
}
