//! Physical register table.
//!
//! Each register has a name, a byte size and its direct sub/super register
//! relations. Relations are kept bidirectional: declaring `al` a
//! sub-register of `ax` also records `ax` as a super-register of `al`.
//! Slot 0 is the reserved [`NO_REGISTER`].
use log::trace;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    operand::{NO_REGISTER, PhysReg},
    utils::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegisterDesc {
    pub name: String,
    /// Size in bytes.
    pub size: u8,
    pub sub_regs: SmallVec<[PhysReg; 4]>,
    pub super_regs: SmallVec<[PhysReg; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegisterInfo {
    regs: Vec<RegisterDesc>,
}

impl Default for RegisterInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterInfo {
    pub fn new() -> Self {
        Self {
            regs: vec![RegisterDesc {
                name: "NoRegister".to_owned(),
                ..Default::default()
            }],
        }
    }

    pub fn add_register(&mut self, name: impl Into<String>, size: u8) -> PhysReg {
        let reg = self.regs.len() as PhysReg;
        self.regs.push(RegisterDesc {
            name: name.into(),
            size,
            ..Default::default()
        });
        reg
    }

    /// Declare `sub` a direct sub-register of `sup`. Re-declaring an existing
    /// relation is a no-op.
    pub fn add_sub_register(&mut self, sup: PhysReg, sub: PhysReg) -> Result<()> {
        self.check(sup)?;
        self.check(sub)?;
        if sup == sub || sup == NO_REGISTER || sub == NO_REGISTER {
            return Err(Error::InvalidRegisterRelation { sup, sub });
        }

        let sup_desc = &mut self.regs[sup as usize];
        if !sup_desc.sub_regs.contains(&sub) {
            sup_desc.sub_regs.push(sub);
        }
        let sub_desc = &mut self.regs[sub as usize];
        if !sub_desc.super_regs.contains(&sup) {
            sub_desc.super_regs.push(sup);
        }
        trace!(
            "Register `{}` declared sub-register of `{}`",
            self.regs[sub as usize].name, self.regs[sup as usize].name
        );
        Ok(())
    }

    fn check(&self, reg: PhysReg) -> Result<()> {
        if (reg as usize) < self.regs.len() {
            Ok(())
        } else {
            Err(Error::UnknownRegister(reg))
        }
    }

    /// Number of registers, [`NO_REGISTER`] included.
    pub fn num_regs(&self) -> usize {
        self.regs.len()
    }

    pub fn get(&self, reg: PhysReg) -> Option<&RegisterDesc> {
        self.regs.get(reg as usize)
    }

    pub fn name(&self, reg: PhysReg) -> Option<&str> {
        self.get(reg).map(|desc| desc.name.as_str())
    }

    /// Size in bytes, 0 for unknown registers.
    pub fn size(&self, reg: PhysReg) -> u8 {
        self.get(reg).map_or(0, |desc| desc.size)
    }

    pub fn sub_regs(&self, reg: PhysReg) -> &[PhysReg] {
        self.get(reg).map_or(&[], |desc| desc.sub_regs.as_slice())
    }

    pub fn super_regs(&self, reg: PhysReg) -> &[PhysReg] {
        self.get(reg).map_or(&[], |desc| desc.super_regs.as_slice())
    }

    pub fn find(&self, name: &str) -> Option<PhysReg> {
        self.regs
            .iter()
            .position(|desc| desc.name == name)
            .map(|i| i as PhysReg)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PhysReg, &RegisterDesc)> {
        self.regs
            .iter()
            .enumerate()
            .map(|(i, desc)| (i as PhysReg, desc))
    }
}
