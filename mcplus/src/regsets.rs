//! Register-set queries over single instructions.
//!
//! All `get_*_regs` functions add to the set they are given, so results for
//! several instructions can be accumulated. Prefix and CFI instructions touch
//! no register.
use bit_set::BitSet;
use mcinst::{Inst, NO_REGISTER, PhysReg};

use crate::{builder::McPlusBuilder, target::Target};

impl<T: Target> McPlusBuilder<T> {
    fn is_transparent(&self, inst: &Inst) -> bool {
        self.is_prefix(inst) || self.is_cfi(inst)
    }

    fn def_regs<'a>(&'a self, inst: &'a Inst) -> impl Iterator<Item = PhysReg> + 'a {
        let desc = self.desc(inst);
        let explicit = desc
            .def_operands(inst)
            .filter_map(|i| inst.operands()[i].reg());
        desc.implicit_defs
            .iter()
            .copied()
            .chain(explicit)
            .filter(|&reg| reg != NO_REGISTER)
    }

    fn use_regs<'a>(&'a self, inst: &'a Inst) -> impl Iterator<Item = PhysReg> + 'a {
        let desc = self.desc(inst);
        let explicit = desc
            .use_operands(inst)
            .filter_map(|i| inst.operands()[i].reg());
        desc.implicit_uses
            .iter()
            .copied()
            .chain(explicit)
            .filter(|&reg| reg != NO_REGISTER)
    }

    fn add_aliases(&self, regs: &mut BitSet, reg: PhysReg, only_smaller: bool) {
        regs.union_with(self.get_aliases(reg, only_smaller));
        if only_smaller {
            regs.insert(reg as usize);
        }
    }

    /// Every register whose value may change: the defs and all of their
    /// aliases.
    pub fn get_clobbered_regs(&self, inst: &Inst, regs: &mut BitSet) {
        if self.is_transparent(inst) {
            return;
        }
        for reg in self.def_regs(inst) {
            self.add_aliases(regs, reg, false);
        }
    }

    /// Every register read or written, with all of their aliases.
    pub fn get_touched_regs(&self, inst: &Inst, regs: &mut BitSet) {
        if self.is_transparent(inst) {
            return;
        }
        let desc = self.desc(inst);
        let implicit = desc.implicit_defs.iter().chain(&desc.implicit_uses).copied();
        let explicit = inst.prime_operands().iter().filter_map(|op| op.reg());
        for reg in implicit.chain(explicit).filter(|&reg| reg != NO_REGISTER) {
            self.add_aliases(regs, reg, false);
        }
    }

    /// The registers written, and their narrower aliases.
    pub fn get_written_regs(&self, inst: &Inst, regs: &mut BitSet) {
        if self.is_transparent(inst) {
            return;
        }
        for reg in self.def_regs(inst) {
            self.add_aliases(regs, reg, true);
        }
    }

    /// The registers read, and their narrower aliases.
    pub fn get_used_regs(&self, inst: &Inst, regs: &mut BitSet) {
        if self.is_transparent(inst) {
            return;
        }
        for reg in self.use_regs(inst) {
            self.add_aliases(regs, reg, true);
        }
    }

    /// Registers whose value flows into `inst`. Calls read the argument
    /// registers and returns read the live-out registers of the target ABI.
    pub fn get_src_regs(&self, inst: &Inst, regs: &mut BitSet) {
        if self.is_transparent(inst) {
            return;
        }
        if self.is_call(inst) {
            regs.union_with(&self.target().regs_used_as_params(self));
            return;
        }
        if self.is_return(inst) {
            regs.union_with(&self.target().default_live_out(self));
            return;
        }
        self.get_used_regs(inst, regs);
    }

    /// Whether `inst` writes `reg` or any register sharing storage with it.
    pub fn has_def_of_phys_reg(&self, inst: &Inst, reg: PhysReg) -> bool {
        self.def_regs(inst)
            .any(|def| self.alias_table().overlaps(def, reg))
    }

    /// Whether `inst` reads `reg` or any register sharing storage with it.
    pub fn has_use_of_phys_reg(&self, inst: &Inst, reg: PhysReg) -> bool {
        self.use_regs(inst)
            .any(|used| self.alias_table().overlaps(used, reg))
    }
}
