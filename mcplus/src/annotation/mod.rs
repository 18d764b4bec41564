//! Out-of-band instruction annotations.
//!
//! # Slot layout
//!
//! Annotations live after the prime operands of an instruction, behind a
//! single sentinel operand (`Operand::Inst(None)`). Each annotation is one
//! immediate operand packing an index and a payload:
//!
//! ```text
//!   63        56 55                                        0
//!  +------------+-------------------------------------------+
//!  |   index    |        signed 56-bit payload               |
//!  +------------+-------------------------------------------+
//! ```
//!
//! The payload is either stored verbatim ([`SlotValue::Inline`]) or is a
//! [`RecordHandle`] naming a typed value kept in an allocator arena
//! ([`SlotValue::Boxed`]). The payload bits alone cannot tell the two apart,
//! so each index has one [`SlotKind`], fixed by the registry the first time
//! the index is written. Built-in indices are always inline.
//!
//! # Indices
//!
//! Indices below [`FIRST_GENERIC_INDEX`] are the [`BuiltinAnnotation`]s.
//! Everything above is handed out by the [`registry::AnnotationRegistry`] to
//! named generic annotations.
use std::borrow::Cow;

use mcinst::{Inst, Operand, utils::Error as InstError};
use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::{
    allocator::RecordHandle,
    utils::error::{McPlusError, McResult, fatal},
};

mod access;
pub mod registry;
pub mod symbols;

pub use registry::AnnotationRegistry;
pub use symbols::SymbolTable;

pub type AnnotationIndex = u8;

/// Number of payload bits in a slot.
pub const VALUE_BITS: u32 = 56;
const VALUE_MASK: i64 = (1 << VALUE_BITS) - 1;

/// Total number of annotation indices.
pub const MAX_ANNOTATIONS: usize = 1 << (64 - VALUE_BITS);

/// Reserved annotation kinds. The discriminant is the annotation index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr,
)]
#[repr(u8)]
pub enum BuiltinAnnotation {
    /// Landing pad symbol of an invoke.
    EHLandingPad = 0,
    /// Exception action of an invoke.
    EHAction,
    /// `DW_CFA_GNU_args_size` value at an invoke.
    GnuArgsSize,
    /// Jump table address used by an indirect branch.
    JumpTable,
    TailCall,
    /// Destination of a conditional tail call.
    ConditionalTailCall,
    /// Offset of the instruction in its input function.
    Offset,
    Label,
    /// Size of the instruction in the input binary.
    Size,
    /// Id of a dynamic (runtime patched) branch.
    DynamicBranch,
}

impl BuiltinAnnotation {
    pub const fn index(self) -> AnnotationIndex {
        self as AnnotationIndex
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// First index handed out to generic, named annotations.
pub const FIRST_GENERIC_INDEX: AnnotationIndex = BuiltinAnnotation::COUNT as AnnotationIndex;

/// Types that can be boxed into an allocator and attached to instructions.
pub trait AnnotationValue: std::fmt::Debug + Send + Sync + 'static {}

impl<V: std::fmt::Debug + Send + Sync + 'static> AnnotationValue for V {}

/// How the payloads of an annotation index are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum SlotKind {
    #[strum(serialize = "inline value")]
    Inline,
    #[strum(serialize = "boxed value")]
    Boxed,
}

impl SlotKind {
    pub fn describe(self) -> &'static str {
        self.into()
    }
}

/// Interpretation of the payload of an annotation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotValue {
    Inline(i64),
    Boxed(RecordHandle),
}

impl SlotValue {
    pub fn kind(self) -> SlotKind {
        match self {
            SlotValue::Inline(_) => SlotKind::Inline,
            SlotValue::Boxed(_) => SlotKind::Boxed,
        }
    }

    /// The 56-bit payload to store in the slot.
    pub fn to_payload(self) -> i64 {
        match self {
            SlotValue::Inline(value) => value,
            SlotValue::Boxed(handle) => handle.to_payload(),
        }
    }

    /// Reinterpret a payload as a boxed record. Fails for payloads that no
    /// handle ever encodes to.
    pub fn boxed(payload: i64) -> Option<Self> {
        RecordHandle::from_payload(payload).map(SlotValue::Boxed)
    }
}

/// Something that names an annotation: its index or its registered name.
pub trait AnnotationKey {
    /// The index, if the key is already known. Never registers anything.
    fn lookup(&self, registry: &AnnotationRegistry) -> Option<AnnotationIndex>;

    /// The index, registering the name if needed.
    fn resolve(&self, registry: &AnnotationRegistry) -> McResult<AnnotationIndex>;

    /// Human-readable form of the key, for diagnostics.
    fn describe(&self) -> Cow<'_, str>;
}

impl AnnotationKey for AnnotationIndex {
    fn lookup(&self, _registry: &AnnotationRegistry) -> Option<AnnotationIndex> {
        Some(*self)
    }

    fn resolve(&self, _registry: &AnnotationRegistry) -> McResult<AnnotationIndex> {
        Ok(*self)
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Owned(format!("#{}", self))
    }
}

impl AnnotationKey for BuiltinAnnotation {
    fn lookup(&self, _registry: &AnnotationRegistry) -> Option<AnnotationIndex> {
        Some(self.index())
    }

    fn resolve(&self, _registry: &AnnotationRegistry) -> McResult<AnnotationIndex> {
        Ok(self.index())
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.name())
    }
}

impl AnnotationKey for str {
    fn lookup(&self, registry: &AnnotationRegistry) -> Option<AnnotationIndex> {
        registry.index_of(self)
    }

    fn resolve(&self, registry: &AnnotationRegistry) -> McResult<AnnotationIndex> {
        registry.index_or_create(self)
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl AnnotationKey for String {
    fn lookup(&self, registry: &AnnotationRegistry) -> Option<AnnotationIndex> {
        self.as_str().lookup(registry)
    }

    fn resolve(&self, registry: &AnnotationRegistry) -> McResult<AnnotationIndex> {
        self.as_str().resolve(registry)
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl<K: AnnotationKey + ?Sized> AnnotationKey for &K {
    fn lookup(&self, registry: &AnnotationRegistry) -> Option<AnnotationIndex> {
        (**self).lookup(registry)
    }

    fn resolve(&self, registry: &AnnotationRegistry) -> McResult<AnnotationIndex> {
        (**self).resolve(registry)
    }

    fn describe(&self) -> Cow<'_, str> {
        (**self).describe()
    }
}

#[inline]
fn sign_extend(raw: i64) -> i64 {
    (raw << (64 - VALUE_BITS)) >> (64 - VALUE_BITS)
}

/// Pack `index` and `value` into a slot immediate. `value` must survive a
/// round trip through the signed 56-bit payload.
#[inline]
pub fn encode_annotation_imm(index: AnnotationIndex, value: i64) -> McResult<i64> {
    let payload = value & VALUE_MASK;
    if sign_extend(payload) != value {
        return Err(McPlusError::AnnotationValueOutOfRange { index, value });
    }
    Ok(((index as i64) << VALUE_BITS) | payload)
}

#[inline]
pub fn extract_annotation_index(raw: i64) -> AnnotationIndex {
    ((raw as u64) >> VALUE_BITS) as AnnotationIndex
}

#[inline]
pub fn extract_annotation_value(raw: i64) -> i64 {
    sign_extend(raw & VALUE_MASK)
}

/// Position of the sentinel. A non-empty nested instruction sitting where the
/// sentinel would be means the operand list was corrupted.
fn region_start(inst: &Inst) -> Option<usize> {
    let sentinel = inst.annotation_sentinel();
    if sentinel.is_none() {
        if let Some(position) = inst
            .operands()
            .iter()
            .rposition(|op| matches!(op, Operand::Inst(Some(_))))
        {
            fatal(InstError::NestedInstructionOperand { position }.into());
        }
    }
    sentinel
}

/// Iterate over the `(index, payload)` pairs of `inst`, in slot order.
pub fn annotation_slots(inst: &Inst) -> impl Iterator<Item = (AnnotationIndex, i64)> + '_ {
    let slots = match region_start(inst) {
        Some(_) => inst.annotation_slots(),
        None => &[],
    };
    slots.iter().filter_map(|op| {
        op.imm()
            .map(|raw| (extract_annotation_index(raw), extract_annotation_value(raw)))
    })
}

pub(crate) fn set_slot(inst: &mut Inst, index: AnnotationIndex, value: i64) -> McResult<()> {
    let raw = encode_annotation_imm(index, value)?;
    if region_start(inst).is_none() {
        inst.add_operand(Operand::sentinel());
        inst.add_operand(Operand::Imm(raw));
        return Ok(());
    }

    for slot in inst.annotation_slots_mut() {
        if let Operand::Imm(existing) = slot {
            if extract_annotation_index(*existing) == index {
                *existing = raw;
                return Ok(());
            }
        }
    }
    inst.add_operand(Operand::Imm(raw));
    Ok(())
}

pub(crate) fn get_slot(inst: &Inst, index: AnnotationIndex) -> Option<i64> {
    annotation_slots(inst)
        .find(|(slot, _)| *slot == index)
        .map(|(_, value)| value)
}

/// Erase the slot carrying `index`, leaving the sentinel and the other slots
/// in place.
pub(crate) fn remove_slot(inst: &mut Inst, index: AnnotationIndex) -> bool {
    let Some(sentinel) = region_start(inst) else {
        return false;
    };
    let found = inst.operands()[sentinel + 1..]
        .iter()
        .position(|op| op.imm().map(extract_annotation_index) == Some(index));
    match found {
        Some(offset) => {
            inst.remove_operand(sentinel + 1 + offset);
            true
        }
        None => false,
    }
}
