//! Backward instruction pattern matching.
//!
//! Matchers are small trees describing how a value was computed. Matching
//! starts at the last instruction of a window and walks backwards: asking a
//! matcher to match operand `n` of the current instruction means "match the
//! instruction that produced the register in operand `n`", found by looking
//! for the nearest earlier definition of that register.
//!
//! ```ignore
//! let scale = Capture::new();
//! let mut m = mcb.match_ind_jmp_mem(
//!     match_any_operand(),
//!     match_imm_into(scale.clone()),
//!     match_reg(),
//!     match_any_operand(),
//! );
//! if m.matches(&mcb, &window, None) {
//!     m.annotate(&mcb, &mut window, "DeleteMe");
//! }
//! ```
//!
//! Windows passed down to sub-matchers are always prefixes of the window the
//! match started on, so positions recorded while matching stay valid when the
//! same window is later handed to [`InstMatcher::annotate`].
use std::{cell::RefCell, fmt, rc::Rc};

use log::trace;
use mcinst::{Inst, Opcode, Operand, PhysReg, Symbol};
use smallvec::SmallVec;

use crate::{allocator::DEFAULT_ALLOCATOR, builder::McPlusBuilder, target::Target};

pub trait InstMatcher<T: Target> {
    /// Whether the pattern matches `window`. With `op_num == None` the
    /// pattern is matched against the last instruction, otherwise against
    /// operand `op_num` of it.
    fn matches(&mut self, mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool;

    /// After a successful match, tag every matched instruction of `window`
    /// with the annotation `name`.
    fn annotate(&self, _mcb: &McPlusBuilder<T>, _window: &mut [Inst], _name: &str) {}
}

pub type BoxedMatcher<T> = Box<dyn InstMatcher<T>>;

/// Find the instruction a matcher should look at.
///
/// Returns the position of the last instruction of `window`, or, when
/// `op_num` names a register operand of it, the position of the nearest
/// earlier instruction defining that register. The window seen by the caller
/// ends at the returned position.
pub fn locate<T: Target>(
    mcb: &McPlusBuilder<T>,
    window: &[Inst],
    op_num: Option<usize>,
) -> Option<usize> {
    let last = window.len().checked_sub(1)?;
    let Some(op_num) = op_num else {
        return Some(last);
    };

    let inst = &window[last];
    if op_num >= inst.num_prime_operands() {
        return None;
    }
    let Operand::Reg(reg) = inst.operands()[op_num] else {
        return Some(last);
    };

    for position in (0..last).rev() {
        if mcb.has_def_of_phys_reg(&window[position], reg) {
            trace!("Operand #{} (reg {}) defined at window position {}", op_num, reg, position);
            return Some(position);
        }
    }
    trace!("No definition of reg {} in a window of {} instructions", reg, window.len());
    None
}

/// Output cell of a leaf matcher. Clones share the cell.
pub struct Capture<V>(Rc<RefCell<Option<V>>>);

impl<V> Capture<V> {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    pub fn set(&self, value: V) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn take(&self) -> Option<V> {
        self.0.borrow_mut().take()
    }

    pub fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl<V: Clone> Capture<V> {
    pub fn get(&self) -> Option<V> {
        self.0.borrow().clone()
    }
}

impl<V> Clone for Capture<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V> Default for Capture<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for Capture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Capture").field(&self.0.borrow()).finish()
    }
}

/// Operand of the last instruction in the window, without following defs.
fn last_prime_operand(window: &[Inst], op_num: Option<usize>) -> Option<&Operand> {
    let inst = window.last()?;
    let op_num = op_num?;
    if op_num >= inst.num_prime_operands() {
        return None;
    }
    inst.operand(op_num)
}

struct AnyOperandMatcher {
    capture: Capture<Operand>,
}

impl<T: Target> InstMatcher<T> for AnyOperandMatcher {
    fn matches(&mut self, _mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool {
        match last_prime_operand(window, op_num) {
            Some(op) => {
                self.capture.set(op.clone());
                true
            }
            None => false,
        }
    }
}

struct RegMatcher {
    capture: Capture<PhysReg>,
}

impl<T: Target> InstMatcher<T> for RegMatcher {
    fn matches(&mut self, _mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool {
        match last_prime_operand(window, op_num).and_then(Operand::reg) {
            Some(reg) => {
                self.capture.set(reg);
                true
            }
            None => false,
        }
    }
}

struct ImmMatcher {
    capture: Capture<i64>,
}

impl<T: Target> InstMatcher<T> for ImmMatcher {
    fn matches(&mut self, mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool {
        let Some(position) = locate(mcb, window, op_num) else {
            return false;
        };
        let Some(op_num) = op_num else {
            return false;
        };
        match window[position].operand(op_num).and_then(Operand::imm) {
            Some(imm) => {
                self.capture.set(imm);
                true
            }
            None => false,
        }
    }
}

struct SymbolMatcher {
    capture: Capture<Symbol>,
}

impl<T: Target> InstMatcher<T> for SymbolMatcher {
    fn matches(&mut self, mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool {
        let Some(position) = locate(mcb, window, op_num) else {
            return false;
        };
        let Some(op_num) = op_num else {
            return false;
        };
        let inst = &window[position];
        if op_num >= inst.num_prime_operands() {
            return false;
        }
        match mcb.target().get_target_symbol(mcb, inst, op_num) {
            Some(symbol) => {
                self.capture.set(symbol);
                true
            }
            None => false,
        }
    }
}

/// Matches any prime operand.
pub fn match_any_operand<T: Target>() -> BoxedMatcher<T> {
    match_any_operand_into(Capture::new())
}

pub fn match_any_operand_into<T: Target>(capture: Capture<Operand>) -> BoxedMatcher<T> {
    Box::new(AnyOperandMatcher { capture })
}

/// Matches a register operand.
pub fn match_reg<T: Target>() -> BoxedMatcher<T> {
    match_reg_into(Capture::new())
}

pub fn match_reg_into<T: Target>(capture: Capture<PhysReg>) -> BoxedMatcher<T> {
    Box::new(RegMatcher { capture })
}

/// Matches an immediate operand, following the register def chain first.
pub fn match_imm<T: Target>() -> BoxedMatcher<T> {
    match_imm_into(Capture::new())
}

pub fn match_imm_into<T: Target>(capture: Capture<i64>) -> BoxedMatcher<T> {
    Box::new(ImmMatcher { capture })
}

/// Matches an operand referencing a symbol, following the register def chain
/// first.
pub fn match_symbol<T: Target>() -> BoxedMatcher<T> {
    match_symbol_into(Capture::new())
}

pub fn match_symbol_into<T: Target>(capture: Capture<Symbol>) -> BoxedMatcher<T> {
    Box::new(SymbolMatcher { capture })
}

type Predicate<T> = Box<dyn Fn(&McPlusBuilder<T>, &Inst) -> bool>;

/// Interior matcher: an instruction satisfying a predicate whose operands
/// match sub-patterns.
///
/// Targets build their `match_add`, `match_load`, ... out of this.
pub struct InstPatternMatcher<T: Target> {
    predicate: Predicate<T>,
    operands: SmallVec<[(usize, BoxedMatcher<T>); 4]>,
    commutative: Option<(usize, usize)>,
    matched: Option<usize>,
}

impl<T: Target> InstPatternMatcher<T> {
    pub fn new(predicate: impl Fn(&McPlusBuilder<T>, &Inst) -> bool + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            operands: SmallVec::new(),
            commutative: None,
            matched: None,
        }
    }

    /// Instructions with one of `opcodes`.
    pub fn opcode(opcodes: impl Into<Vec<Opcode>>) -> Self {
        let opcodes = opcodes.into();
        Self::new(move |_, inst| opcodes.contains(&inst.opcode()))
    }

    /// Require operand `op_num` to match `matcher`.
    pub fn operand(mut self, op_num: usize, matcher: BoxedMatcher<T>) -> Self {
        self.operands.push((op_num, matcher));
        self
    }

    /// Also accept the operands at `a` and `b` swapped.
    pub fn commutative(mut self, a: usize, b: usize) -> Self {
        self.commutative = Some((a, b));
        self
    }

    pub fn boxed(self) -> BoxedMatcher<T> {
        Box::new(self)
    }

    /// Position of the matched instruction in the window of the last
    /// successful match.
    pub fn matched(&self) -> Option<usize> {
        self.matched
    }

    fn match_operands(&mut self, mcb: &McPlusBuilder<T>, window: &[Inst], swapped: bool) -> bool {
        let swap = if swapped { self.commutative } else { None };
        self.operands.iter_mut().all(|(op_num, matcher)| {
            let op_num = match swap {
                Some((a, b)) if *op_num == a => b,
                Some((a, b)) if *op_num == b => a,
                _ => *op_num,
            };
            matcher.matches(mcb, window, Some(op_num))
        })
    }
}

impl<T: Target> InstMatcher<T> for InstPatternMatcher<T> {
    fn matches(&mut self, mcb: &McPlusBuilder<T>, window: &[Inst], op_num: Option<usize>) -> bool {
        self.matched = None;
        let Some(position) = locate(mcb, window, op_num) else {
            return false;
        };
        if !(self.predicate)(mcb, &window[position]) {
            return false;
        }

        let window = &window[..=position];
        let found = self.match_operands(mcb, window, false)
            || (self.commutative.is_some() && self.match_operands(mcb, window, true));
        if found {
            self.matched = Some(position);
        }
        found
    }

    fn annotate(&self, mcb: &McPlusBuilder<T>, window: &mut [Inst], name: &str) {
        if let Some(position) = self.matched {
            mcb.get_or_create_annotation_as::<bool, _>(
                &mut window[position],
                name,
                DEFAULT_ALLOCATOR,
                |tagged| *tagged = true,
            );
        }
        for (_, matcher) in &self.operands {
            matcher.annotate(mcb, window, name);
        }
    }
}
