use std::{any::type_name, fmt};

use mcinst::{Inst, Operand};

use crate::{
    allocator::{AllocatorId, RecordHandle},
    annotation::{
        AnnotationIndex, AnnotationKey, AnnotationValue, BuiltinAnnotation, FIRST_GENERIC_INDEX,
        SlotKind, SlotValue, annotation_slots, extract_annotation_index, extract_annotation_value,
        get_slot, remove_slot, set_slot,
    },
    builder::McPlusBuilder,
    target::Target,
    utils::error::{McPlusError, OrFatal, fatal},
};

impl<T: Target> McPlusBuilder<T> {
    fn resolve_key(&self, key: &impl AnnotationKey) -> AnnotationIndex {
        key.resolve(&self.registry).or_fatal()
    }

    /// Handle stored in a slot of `index`. Reading an inline slot as a boxed
    /// record is fatal.
    #[track_caller]
    fn boxed_handle<V>(&self, index: AnnotationIndex, payload: i64) -> RecordHandle {
        let boxed = match self.registry.slot_kind(index) {
            Some(SlotKind::Boxed) => SlotValue::boxed(payload),
            _ => None,
        };
        match boxed {
            Some(SlotValue::Boxed(handle)) => handle,
            _ => fatal(McPlusError::PayloadTypeMismatch {
                stored: SlotKind::Inline.describe(),
                requested: type_name::<V>(),
            }),
        }
    }

    /// Store `value` inline under `key`, overwriting a previous value.
    ///
    /// # Panics
    /// If `value` does not fit in 56 signed bits, or if `key` holds boxed
    /// values.
    #[track_caller]
    pub fn set_annotation_op_value(&self, inst: &mut Inst, key: impl AnnotationKey, value: i64) {
        let index = self.resolve_key(&key);
        self.registry.claim_kind(index, SlotKind::Inline).or_fatal();
        set_slot(inst, index, value).or_fatal();
    }

    pub fn get_annotation_op_value(&self, inst: &Inst, key: impl AnnotationKey) -> Option<i64> {
        get_slot(inst, key.lookup(&self.registry)?)
    }

    pub fn has_annotation(&self, inst: &Inst, key: impl AnnotationKey) -> bool {
        self.get_annotation_op_value(inst, key).is_some()
    }

    /// Remove the annotation `key`. The other annotations, and the sentinel,
    /// stay in place.
    pub fn remove_annotation(&self, inst: &mut Inst, key: impl AnnotationKey) -> bool {
        match key.lookup(&self.registry) {
            Some(index) => remove_slot(inst, index),
            None => false,
        }
    }

    /// Remove every annotation. With `keep_tail_call`, a tail call stays
    /// marked as such.
    pub fn strip_annotations(&self, inst: &mut Inst, keep_tail_call: bool) {
        let keep_tail_call = keep_tail_call && self.is_tail_call(inst);
        inst.truncate_annotation_region();
        if keep_tail_call {
            self.set_tail_call(inst);
        }
    }

    /// Move the annotations of `src` onto `dst`. Annotations already on `dst`
    /// are overwritten by those of `src` with the same index.
    pub fn move_annotations(&self, src: &mut Inst, dst: &mut Inst) {
        let Some(region) = src.split_off_annotation_region() else {
            return;
        };
        if !dst.has_annotation_region() {
            for op in region {
                dst.add_operand(op);
            }
            return;
        }
        for op in region.into_iter().skip(1) {
            if let Operand::Imm(raw) = op {
                set_slot(dst, extract_annotation_index(raw), extract_annotation_value(raw)).or_fatal();
            }
        }
    }

    // Boxed values

    /// Attach `value` as a new generic annotation, allocated in `allocator`.
    ///
    /// # Panics
    /// If `key` names a built-in annotation, holds inline values, or if
    /// `inst` already carries it.
    #[track_caller]
    pub fn add_annotation<V: AnnotationValue>(
        &self,
        inst: &mut Inst,
        key: impl AnnotationKey,
        value: V,
        allocator: AllocatorId,
    ) -> RecordHandle {
        let index = self.resolve_key(&key);
        if index < FIRST_GENERIC_INDEX {
            fatal(McPlusError::BuiltinAnnotationIndex { index });
        }
        if get_slot(inst, index).is_some() {
            fatal(McPlusError::DuplicateAnnotation { index });
        }

        self.registry.claim_kind(index, SlotKind::Boxed).or_fatal();
        let handle = self.allocators.alloc(allocator, value).or_fatal();
        set_slot(inst, index, SlotValue::Boxed(handle).to_payload()).or_fatal();
        handle
    }

    /// Run `f` on the boxed value of `key`, if `inst` has one.
    ///
    /// `f` may read other boxed annotations, including ones stored in the
    /// same allocator.
    #[track_caller]
    pub fn with_annotation<V: AnnotationValue, R>(
        &self,
        inst: &Inst,
        key: impl AnnotationKey,
        f: impl FnOnce(&V) -> R,
    ) -> Option<R> {
        let index = key.lookup(&self.registry)?;
        let payload = get_slot(inst, index)?;
        let handle = self.boxed_handle::<V>(index, payload);
        Some(self.allocators.with(handle, f).or_fatal())
    }

    /// Run `f` on the boxed value of `key` with mutable access. The value
    /// lives in its allocator, so `inst` itself is not modified.
    ///
    /// # Panics
    /// If `f` touches another boxed annotation of the same allocator.
    #[track_caller]
    pub fn with_annotation_mut<V: AnnotationValue, R>(
        &self,
        inst: &Inst,
        key: impl AnnotationKey,
        f: impl FnOnce(&mut V) -> R,
    ) -> Option<R> {
        let index = key.lookup(&self.registry)?;
        let payload = get_slot(inst, index)?;
        let handle = self.boxed_handle::<V>(index, payload);
        Some(self.allocators.with_mut(handle, f).or_fatal())
    }

    pub fn get_annotation_as<V: AnnotationValue + Clone>(
        &self,
        inst: &Inst,
        key: impl AnnotationKey,
    ) -> Option<V> {
        self.with_annotation(inst, key, V::clone)
    }

    /// Boxed value of `key`, which the caller knows to be present.
    ///
    /// # Panics
    /// If `inst` does not carry the annotation.
    #[track_caller]
    pub fn annotation_as<V: AnnotationValue + Clone>(&self, inst: &Inst, key: impl AnnotationKey) -> V {
        let Some(index) = key.lookup(&self.registry) else {
            fatal(McPlusError::UnknownAnnotation(key.describe().into_owned()));
        };
        match self.get_annotation_as::<V>(inst, index) {
            Some(value) => value,
            None => fatal(McPlusError::MissingAnnotation { index }),
        }
    }

    /// Run `f` on the boxed value of `key`, creating it with `V::default()`
    /// in `allocator` first if `inst` has none. `f` runs under the same
    /// restriction as in [`Self::with_annotation_mut`].
    #[track_caller]
    pub fn get_or_create_annotation_as<V: AnnotationValue + Default, R>(
        &self,
        inst: &mut Inst,
        key: impl AnnotationKey,
        allocator: AllocatorId,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let index = self.resolve_key(&key);
        if !self.has_annotation(inst, index) {
            self.add_annotation(inst, index, V::default(), allocator);
        }
        match self.with_annotation_mut(inst, index, f) {
            Some(result) => result,
            None => fatal(McPlusError::MissingAnnotation { index }),
        }
    }

    pub fn get_annotation_with_default<V: AnnotationValue + Clone>(
        &self,
        inst: &Inst,
        key: impl AnnotationKey,
        default: V,
    ) -> V {
        self.get_annotation_as(inst, key).unwrap_or(default)
    }

    /// Print every annotation of `inst` as `# Name: value`.
    ///
    /// Boxed values are rendered through their `Debug` impl, everything else
    /// as the raw inline payload.
    pub fn fmt_annotations<'a>(&'a self, inst: &'a Inst) -> impl fmt::Display + 'a {
        struct Fmt<'a, T: Target> {
            mcb: &'a McPlusBuilder<T>,
            inst: &'a Inst,
        }

        impl<T: Target> fmt::Display for Fmt<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for (i, (index, value)) in annotation_slots(self.inst).enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    match self.mcb.registry.name_of(index) {
                        Some(name) => write!(f, "# {}: ", &*name)?,
                        None => write!(f, "# #{}: ", index)?,
                    }

                    let boxed = match SlotValue::boxed(value) {
                        Some(SlotValue::Boxed(handle)) if self.mcb.registry.is_boxed(index) => {
                            Some(handle)
                        }
                        _ => None,
                    };
                    match boxed {
                        Some(handle) => self.mcb.allocators.fmt_record(handle, f)?,
                        None if index == BuiltinAnnotation::Label.index()
                            || index == BuiltinAnnotation::EHLandingPad.index() =>
                        {
                            match self.mcb.symbols.from_payload(value) {
                                Some(symbol) => write!(f, "{}", symbol)?,
                                None => write!(f, "{}", value)?,
                            }
                        }
                        None => write!(f, "{}", value)?,
                    }
                }
                Ok(())
            }
        }

        Fmt { mcb: self, inst }
    }
}
