use log::error;
use thiserror::Error;

use crate::annotation::AnnotationIndex;
use crate::allocator::AllocatorId;

#[derive(Debug, Error)]
pub enum McPlusError {
    #[error("Value {value:#x} does not fit in the signed 56-bit payload of annotation #{index}")]
    AnnotationValueOutOfRange { index: AnnotationIndex, value: i64 },

    #[error("Cannot register annotation '{name}': all {max} annotation indices are in use")]
    AnnotationIndexExhausted { name: String, max: usize },

    #[error("Annotation '{0}' is not registered")]
    UnknownAnnotation(String),

    #[error("Instruction has no annotation #{index}")]
    MissingAnnotation { index: AnnotationIndex },

    #[error("Instruction already carries annotation #{index}")]
    DuplicateAnnotation { index: AnnotationIndex },

    #[error("Annotation #{index} is reserved and cannot be used through the generic annotation API")]
    BuiltinAnnotationIndex { index: AnnotationIndex },

    #[error("Annotation payload is a `{stored}`, but a `{requested}` was requested")]
    PayloadTypeMismatch {
        stored: &'static str,
        requested: &'static str,
    },

    #[error("Annotation payload refers to allocator {allocator} values that were already freed")]
    StalePayload { allocator: AllocatorId },

    #[error("Allocator {0} does not exist")]
    UnknownAllocator(AllocatorId),

    #[error("No allocator id left")]
    AllocatorIdsExhausted,

    #[error("Allocator {0} has handed out every record serial")]
    AllocatorExhausted(AllocatorId),

    #[error("Allocator {0} is already borrowed by an enclosing annotation closure")]
    AllocatorInUse(AllocatorId),

    #[error("GNU_args_size {size} on an instruction that is not an invoke, or negative")]
    InvalidGnuArgsSize { size: i64 },

    #[error("Expected a conditional branch, found opcode {opcode}")]
    NotConditionalBranch { opcode: mcinst::Opcode },

    #[error("Operation '{operation}' is not implemented by target '{target}'")]
    NotImplemented {
        target: &'static str,
        operation: &'static str,
    },

    #[error("Iterator moved before the first instruction")]
    IteratorUnderflow,

    #[error("Malformed instruction: {0}")]
    Instruction(#[from] mcinst::Error),

    #[error("Failed to parse builder options: {0}")]
    InvalidOptions(#[from] toml::de::Error),

    #[error("Failed to serialize builder options: {0}")]
    OptionsSerialization(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type McResult<T> = Result<T, McPlusError>;

/// Abort on a broken invariant. Continuing would silently corrupt the
/// rewritten binary.
#[cold]
#[track_caller]
pub fn fatal(err: McPlusError) -> ! {
    error!("{}", err);
    panic!("{}", err)
}

#[cold]
#[track_caller]
pub fn not_implemented(target: &'static str, operation: &'static str) -> ! {
    fatal(McPlusError::NotImplemented { target, operation })
}

/// Unwrap a [`McResult`], escalating the error through [`fatal`].
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for McResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}
