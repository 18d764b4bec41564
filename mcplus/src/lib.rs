//! Target-independent layer over machine instructions for a binary
//! rewriter.
//!
//! [`McPlusBuilder`] answers questions about [`mcinst::Inst`] records that
//! the bare instruction-set tables cannot: which registers an instruction
//! really touches, whether a jump is a tail call, which jump table an
//! indirect branch dispatches through. Facts learnt by the analyses are
//! stored on the instructions themselves as annotations (see
//! [`annotation`]), either inline or boxed in a per-thread
//! [`allocator::AnnotationAllocator`].
//!
//! Everything that depends on the instruction set is behind the [`Target`]
//! trait.
pub mod aliases;
pub mod allocator;
pub mod annotation;
pub mod builder;
pub mod iterator;
pub mod matcher;
mod regsets;
pub mod semantic;
pub mod target;
pub mod utils;

pub use aliases::RegisterAliasTable;
pub use allocator::{AllocatorId, AllocatorStats, DEFAULT_ALLOCATOR, RecordHandle};
pub use annotation::{
    AnnotationIndex, AnnotationKey, AnnotationRegistry, BuiltinAnnotation, FIRST_GENERIC_INDEX,
    MAX_ANNOTATIONS, SlotValue, SymbolTable,
};
pub use builder::McPlusBuilder;
pub use iterator::{
    InstructionIterator, InstructionIteratorMut, InstructionRange, InstructionSource,
    InstructionSourceMut,
};
pub use matcher::{BoxedMatcher, Capture, InstMatcher, InstPatternMatcher};
pub use semantic::{JUMP_TABLE_INDEX_REG, LandingPad};
pub use target::{IndirectBranchInfo, IndirectBranchType, Target};
pub use utils::{BuilderOptions, McPlusError, McResult};
