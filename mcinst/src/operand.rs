//! Shared operand types for machine instructions.
//!
//! An operand is either a physical register (`Reg`), an immediate (`Imm`), a
//! symbolic expression (`Expr`) or a nested instruction (`Inst`). The empty
//! nested instruction `Inst(None)` is never a real operand: it is the
//! placeholder separating the prime operands from the annotation region.
use std::{fmt, sync::Arc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;

use crate::{inst::Inst, register::RegisterInfo};

/// Physical register identifier. Index into [`RegisterInfo`].
pub type PhysReg = u16;

/// Opcode identifier. Index into [`crate::desc::InstrInfo`].
pub type Opcode = u32;

/// Reserved register id meaning "no register".
pub const NO_REGISTER: PhysReg = 0;

/// A symbol referenced by an expression operand (a label, a function, a
/// jump table...). Cloning is cheap: the name is shared.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

/// Binary operators that may appear inside symbolic expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinaryOp {
    Add,
    Sub,
}

/// Symbolic expression carried by an [`Operand::Expr`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Expr {
    Constant(i64),
    SymbolRef(Symbol),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn symbol_ref(symbol: impl Into<Symbol>) -> Self {
        Expr::SymbolRef(symbol.into())
    }

    /// `symbol + addend`, or the bare symbol reference when `addend` is zero.
    pub fn symbol_plus(symbol: impl Into<Symbol>, addend: i64) -> Self {
        let sym = Expr::SymbolRef(symbol.into());
        if addend == 0 {
            return sym;
        }
        Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(sym),
            rhs: Box::new(Expr::Constant(addend)),
        }
    }

    /// The symbol this expression is anchored on. For binary expressions the
    /// left-hand side is inspected.
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            Expr::SymbolRef(sym) => Some(sym),
            Expr::Binary { lhs, .. } => lhs.symbol(),
            Expr::Constant(_) => None,
        }
    }

    /// Split `symbol (+|-) constant` into its symbol and signed addend.
    pub fn symbol_and_addend(&self) -> Option<(&Symbol, i64)> {
        match self {
            Expr::SymbolRef(sym) => Some((sym, 0)),
            Expr::Binary { op, lhs, rhs } => match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::SymbolRef(sym), Expr::Constant(c)) => match op {
                    BinaryOp::Add => Some((sym, *c)),
                    BinaryOp::Sub => Some((sym, c.wrapping_neg())),
                },
                _ => None,
            },
            Expr::Constant(_) => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(c) => write!(f, "{}", c),
            Expr::SymbolRef(sym) => write!(f, "{}", sym),
            Expr::Binary { op, lhs, rhs } => {
                let op = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                };
                write!(f, "{} {} {}", lhs, op, rhs)
            }
        }
    }
}

/// Instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// Physical register.
    Reg(PhysReg),
    /// 64-bit immediate. Annotation slots are immediates too.
    Imm(i64),
    /// Symbolic expression (relocatable reference).
    Expr(Expr),
    /// Nested instruction. Only the empty form is used, as the
    /// annotation-region sentinel.
    Inst(Option<Box<Inst>>),
}

impl Operand {
    /// The placeholder separating prime operands from annotation slots.
    pub const fn sentinel() -> Self {
        Operand::Inst(None)
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Operand::Inst(None))
    }

    pub fn reg(&self) -> Option<PhysReg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(imm) => Some(*imm),
            _ => None,
        }
    }

    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Operand::Expr(expr) => Some(expr),
            _ => None,
        }
    }

    /// Format this operand, resolving register names when a register table
    /// is provided.
    pub fn fmt<'a>(&'a self, regs: Option<&'a RegisterInfo>) -> impl fmt::Display + 'a {
        struct Fmt<'a> {
            operand: &'a Operand,
            regs: Option<&'a RegisterInfo>,
        }

        impl fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.operand {
                    Operand::Reg(reg) => match self.regs.and_then(|r| r.name(*reg)) {
                        Some(name) => write!(f, "%{}", name),
                        None => write!(f, "%r{}", reg),
                    },
                    Operand::Imm(imm) => write!(f, "${}", imm),
                    Operand::Expr(expr) => write!(f, "{}", expr),
                    Operand::Inst(None) => write!(f, "<annotations>"),
                    Operand::Inst(Some(inst)) => write!(f, "<inst opcode {}>", inst.opcode()),
                }
            }
        }

        Fmt {
            operand: self,
            regs,
        }
    }
}

impl From<Expr> for Operand {
    fn from(value: Expr) -> Self {
        Operand::Expr(value)
    }
}
