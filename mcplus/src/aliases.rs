//! Register alias and size tables.
//!
//! Two registers alias when they share storage. The tables are derived once
//! from the sub/super register lists of a [`RegisterInfo`]:
//!
//! 1. every declared relation becomes a "contains" edge (a super-register
//!    contains its sub-registers),
//! 2. the containment relation is closed transitively,
//! 3. each register is mapped to the set of leaf registers it contains (a
//!    register without sub-registers is its own leaf),
//! 4. two registers alias iff their leaf sets intersect.
//!
//! Going through leaves keeps disjoint halves apart: `al` and `ah` are both
//! contained in `ax` but do not alias each other.
use bit_set::BitSet;
use mcinst::{PhysReg, RegisterInfo};

use crate::utils::error::fatal;

#[derive(Debug, Clone)]
pub struct RegisterAliasTable {
    aliases: Vec<BitSet>,
    smaller_aliases: Vec<BitSet>,
    sizes: Vec<u8>,
}

impl RegisterAliasTable {
    pub fn new(regs: &RegisterInfo) -> Self {
        let n = regs.num_regs();

        let mut contains: Vec<BitSet> = (0..n).map(|_| BitSet::with_capacity(n)).collect();
        for (reg, desc) in regs.iter() {
            for &sub in &desc.sub_regs {
                contains[reg as usize].insert(sub as usize);
            }
            for &sup in &desc.super_regs {
                contains[sup as usize].insert(reg as usize);
            }
        }

        // Warshall: after step k, paths through registers <= k are closed.
        for k in 0..n {
            let via = contains[k].clone();
            for set in contains.iter_mut() {
                if set.contains(k) {
                    set.union_with(&via);
                }
            }
        }

        let leaves: Vec<BitSet> = (0..n)
            .map(|reg| {
                let mut leaves: BitSet = contains[reg]
                    .iter()
                    .filter(|&sub| contains[sub].is_empty())
                    .collect();
                if contains[reg].is_empty() {
                    leaves.insert(reg);
                }
                leaves
            })
            .collect();

        let sizes: Vec<u8> = (0..n).map(|reg| regs.size(reg as PhysReg)).collect();

        let aliases: Vec<BitSet> = (0..n)
            .map(|reg| {
                (0..n)
                    .filter(|&other| !leaves[reg].is_disjoint(&leaves[other]))
                    .collect()
            })
            .collect();

        let smaller_aliases = aliases
            .iter()
            .enumerate()
            .map(|(reg, set)| set.iter().filter(|&other| sizes[other] < sizes[reg]).collect())
            .collect();

        Self {
            aliases,
            smaller_aliases,
            sizes,
        }
    }

    pub fn num_regs(&self) -> usize {
        self.sizes.len()
    }

    /// Registers sharing storage with `reg`, `reg` included. With
    /// `only_smaller`, only the strictly narrower ones (`reg` excluded).
    ///
    /// # Panics
    /// If `reg` is not in the register table.
    #[track_caller]
    pub fn aliases(&self, reg: PhysReg, only_smaller: bool) -> &BitSet {
        let table = if only_smaller {
            &self.smaller_aliases
        } else {
            &self.aliases
        };
        match table.get(reg as usize) {
            Some(set) => set,
            None => fatal(mcinst::Error::UnknownRegister(reg).into()),
        }
    }

    /// Size of `reg` in bytes.
    pub fn reg_size(&self, reg: PhysReg) -> u8 {
        self.sizes.get(reg as usize).copied().unwrap_or(0)
    }

    pub fn overlaps(&self, a: PhysReg, b: PhysReg) -> bool {
        self.aliases
            .get(a as usize)
            .is_some_and(|set| set.contains(b as usize))
    }

    /// Empty register set sized for this table.
    pub fn new_reg_set(&self) -> BitSet {
        BitSet::with_capacity(self.num_regs())
    }
}
