//! Arena allocators backing boxed annotation payloads.
//!
//! Role
//! - Keep typed annotation values (`Vec`s, sets, small structs...) outside of
//!   the instruction, so that a slot only has to carry a 55-bit
//!   [`RecordHandle`].
//! - Group values by lifetime: a pass allocates everything it attaches in its
//!   own allocator and drops all of it at once with
//!   [`AllocatorPool::free`].
//!
//! Semantics
//! - Values are bump-allocated in a [`bumpalo::Bump`]. The arena itself never
//!   runs destructors, so every record whose type needs dropping is kept in a
//!   live set and dropped explicitly before the arena is reset.
//! - Every record gets a serial number that its allocator never hands out
//!   again. Freeing starts a new epoch at the next serial; handles with a
//!   serial below it are rejected instead of reading reclaimed memory.
//! - Each record remembers the [`TypeId`] it was created with. Reading it back
//!   as another type is an error.
//!
//! Concurrency
//! - The pool maps ids to `Arc<ReentrantMutex<RefCell<AnnotationAllocator>>>`.
//!   An allocator is meant to be used by one thread at a time, so its mutex is
//!   uncontended; operations on one id never touch the memory of another.
//! - The mutex is reentrant so that a closure run on one value can read
//!   another value of the same allocator. The `RefCell` turns any conflicting
//!   nested access into [`McPlusError::AllocatorInUse`].
use std::{
    any::{TypeId, type_name},
    cell::RefCell,
    collections::HashMap,
    fmt,
    mem::needs_drop,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bumpalo::Bump;
use log::debug;
use parking_lot::{ReentrantMutex, RwLock};

use crate::{
    annotation::AnnotationValue,
    utils::error::{McPlusError, McResult},
};

pub type AllocatorId = u16;

/// Id of the allocator that always exists.
pub const DEFAULT_ALLOCATOR: AllocatorId = 0;

const SERIAL_BITS: u32 = 39;
const SERIAL_MASK: u64 = (1 << SERIAL_BITS) - 1;
const ALLOCATOR_SHIFT: u32 = SERIAL_BITS;
const HANDLE_BITS: u32 = ALLOCATOR_SHIFT + AllocatorId::BITS;

/// Address of a boxed annotation value.
///
/// Packed as `allocator:16 | serial:39` (most significant first), which is
/// always non-negative and fits in a slot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    allocator: AllocatorId,
    serial: u64,
}

impl RecordHandle {
    pub fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    /// Position of the record among every record ever made by its
    /// allocator.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn to_payload(self) -> i64 {
        ((self.allocator as i64) << ALLOCATOR_SHIFT) | self.serial as i64
    }

    pub fn from_payload(payload: i64) -> Option<Self> {
        if payload < 0 || payload >> HANDLE_BITS != 0 {
            return None;
        }
        Some(Self {
            allocator: (payload >> ALLOCATOR_SHIFT) as AllocatorId,
            serial: payload as u64 & SERIAL_MASK,
        })
    }
}

struct Record {
    ptr: NonNull<u8>,
    type_id: TypeId,
    type_name: &'static str,
    drop_fn: Option<unsafe fn(NonNull<u8>)>,
    debug_fn: unsafe fn(NonNull<u8>, &mut fmt::Formatter<'_>) -> fmt::Result,
}

unsafe fn drop_record<V>(ptr: NonNull<u8>) {
    unsafe { ptr::drop_in_place(ptr.cast::<V>().as_ptr()) }
}

unsafe fn debug_record<V: fmt::Debug>(ptr: NonNull<u8>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    unsafe { ptr.cast::<V>().as_ref() }.fmt(f)
}

/// Snapshot of an allocator, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    pub records: usize,
    /// Records that will run a destructor on free.
    pub live: usize,
    pub bytes_reserved: usize,
}

/// One arena of boxed annotation values.
pub struct AnnotationAllocator {
    id: AllocatorId,
    /// Number of frees so far.
    epoch: u64,
    /// Serial of the first record of the current epoch.
    first_serial: u64,
    arena: Bump,
    records: Vec<Record>,
    live: Vec<u32>,
}

// Records point into `arena`, which moves with the allocator. Stored values
// are `Send + Sync` (see `AnnotationValue`).
unsafe impl Send for AnnotationAllocator {}

impl fmt::Debug for AnnotationAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotationAllocator")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("first_serial", &self.first_serial)
            .field("records", &self.records.len())
            .field("live", &self.live.len())
            .finish()
    }
}

impl AnnotationAllocator {
    pub fn new(id: AllocatorId, chunk_size: usize) -> Self {
        let arena = if chunk_size == 0 {
            Bump::new()
        } else {
            Bump::with_capacity(chunk_size)
        };
        Self {
            id,
            epoch: 0,
            first_serial: 0,
            arena,
            records: Vec::new(),
            live: Vec::new(),
        }
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn alloc<V: AnnotationValue>(&mut self, value: V) -> McResult<RecordHandle> {
        let serial = self.first_serial + self.records.len() as u64;
        if serial > SERIAL_MASK {
            return Err(McPlusError::AllocatorExhausted(self.id));
        }
        let index = self.records.len() as u32;
        let ptr = NonNull::from(self.arena.alloc(value)).cast::<u8>();
        let drop_fn = if needs_drop::<V>() {
            self.live.push(index);
            Some(drop_record::<V> as unsafe fn(NonNull<u8>))
        } else {
            None
        };
        self.records.push(Record {
            ptr,
            type_id: TypeId::of::<V>(),
            type_name: type_name::<V>(),
            drop_fn,
            debug_fn: debug_record::<V>,
        });

        Ok(RecordHandle {
            allocator: self.id,
            serial,
        })
    }

    fn record<V: AnnotationValue>(&self, handle: RecordHandle) -> McResult<&Record> {
        let record = self.untyped_record(handle)?;
        if record.type_id != TypeId::of::<V>() {
            return Err(McPlusError::PayloadTypeMismatch {
                stored: record.type_name,
                requested: type_name::<V>(),
            });
        }
        Ok(record)
    }

    fn untyped_record(&self, handle: RecordHandle) -> McResult<&Record> {
        let stale = McPlusError::StalePayload {
            allocator: handle.allocator,
        };
        if handle.allocator != self.id || handle.serial < self.first_serial {
            return Err(stale);
        }
        usize::try_from(handle.serial - self.first_serial)
            .ok()
            .and_then(|index| self.records.get(index))
            .ok_or(stale)
    }

    pub fn get<V: AnnotationValue>(&self, handle: RecordHandle) -> McResult<&V> {
        let record = self.record::<V>(handle)?;
        // SAFETY: the record was created from a `V` in the current epoch, so the
        // arena slot is still initialized.
        Ok(unsafe { record.ptr.cast::<V>().as_ref() })
    }

    pub fn get_mut<V: AnnotationValue>(&mut self, handle: RecordHandle) -> McResult<&mut V> {
        let mut ptr = self.record::<V>(handle)?.ptr.cast::<V>();
        // SAFETY: see `get`; `&mut self` guarantees exclusive access.
        Ok(unsafe { ptr.as_mut() })
    }

    /// Format the record through the `Debug` impl of its type.
    pub fn fmt_record(&self, handle: RecordHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.untyped_record(handle) {
            // SAFETY: `debug_fn` was instantiated for the type stored at `ptr`.
            Ok(record) => unsafe { (record.debug_fn)(record.ptr, f) },
            Err(_) => write!(f, "<stale>"),
        }
    }

    /// Drop every value and reclaim the arena. Outstanding handles become
    /// stale.
    pub fn free(&mut self) {
        for index in self.live.drain(..) {
            let record = &self.records[index as usize];
            if let Some(drop_fn) = record.drop_fn {
                // SAFETY: each live record is dropped exactly once, before the
                // arena is reset.
                unsafe { drop_fn(record.ptr) };
            }
        }
        self.first_serial += self.records.len() as u64;
        self.records.clear();
        self.arena.reset();
        self.epoch += 1;
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            records: self.records.len(),
            live: self.live.len(),
            bytes_reserved: self.arena.allocated_bytes(),
        }
    }
}

impl Drop for AnnotationAllocator {
    fn drop(&mut self) {
        self.free();
    }
}

type SharedAllocator = Arc<ReentrantMutex<RefCell<AnnotationAllocator>>>;

fn shared(id: AllocatorId, chunk_size: usize) -> SharedAllocator {
    Arc::new(ReentrantMutex::new(RefCell::new(AnnotationAllocator::new(
        id, chunk_size,
    ))))
}

/// The set of allocators owned by a builder.
#[derive(Debug)]
pub struct AllocatorPool {
    allocators: RwLock<HashMap<AllocatorId, SharedAllocator>>,
    next_id: AtomicU32,
    chunk_size: usize,
}

impl AllocatorPool {
    /// A pool holding only [`DEFAULT_ALLOCATOR`].
    pub fn new(chunk_size: usize) -> Self {
        let pool = Self {
            allocators: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            chunk_size,
        };
        pool.allocators
            .write()
            .insert(DEFAULT_ALLOCATOR, shared(DEFAULT_ALLOCATOR, chunk_size));
        pool.next_id.store(DEFAULT_ALLOCATOR as u32 + 1, Ordering::Relaxed);
        pool
    }

    /// Create a fresh allocator. Ids are never reused.
    pub fn create(&self) -> McResult<AllocatorId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = AllocatorId::try_from(id).map_err(|_| McPlusError::AllocatorIdsExhausted)?;
        self.allocators.write().insert(id, shared(id, self.chunk_size));
        debug!("Created annotation allocator {}", id);
        Ok(id)
    }

    pub fn exists(&self, id: AllocatorId) -> bool {
        self.allocators.read().contains_key(&id)
    }

    fn get(&self, id: AllocatorId) -> McResult<SharedAllocator> {
        self.allocators
            .read()
            .get(&id)
            .cloned()
            .ok_or(McPlusError::UnknownAllocator(id))
    }

    pub fn alloc<V: AnnotationValue>(&self, id: AllocatorId, value: V) -> McResult<RecordHandle> {
        let shared = self.get(id)?;
        let guard = shared.lock();
        let mut allocator = guard
            .try_borrow_mut()
            .map_err(|_| McPlusError::AllocatorInUse(id))?;
        allocator.alloc(value)
    }

    /// Run `f` on the value behind `handle`. `f` may read other values of the
    /// same allocator.
    pub fn with<V: AnnotationValue, R>(
        &self,
        handle: RecordHandle,
        f: impl FnOnce(&V) -> R,
    ) -> McResult<R> {
        let shared = self.get(handle.allocator)?;
        let guard = shared.lock();
        let allocator = guard
            .try_borrow()
            .map_err(|_| McPlusError::AllocatorInUse(handle.allocator))?;
        Ok(f(allocator.get::<V>(handle)?))
    }

    /// Run `f` on the value behind `handle` with exclusive access to its
    /// allocator. Any access to the same allocator from `f` fails.
    pub fn with_mut<V: AnnotationValue, R>(
        &self,
        handle: RecordHandle,
        f: impl FnOnce(&mut V) -> R,
    ) -> McResult<R> {
        let shared = self.get(handle.allocator)?;
        let guard = shared.lock();
        let mut allocator = guard
            .try_borrow_mut()
            .map_err(|_| McPlusError::AllocatorInUse(handle.allocator))?;
        Ok(f(allocator.get_mut::<V>(handle)?))
    }

    pub fn fmt_record(&self, handle: RecordHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(shared) = self.get(handle.allocator) else {
            return write!(f, "<unknown allocator {}>", handle.allocator);
        };
        let guard = shared.lock();
        match guard.try_borrow() {
            Ok(allocator) => allocator.fmt_record(handle, f),
            Err(_) => write!(f, "<in use>"),
        }
    }

    pub fn free(&self, id: AllocatorId) -> McResult<()> {
        let shared = self.get(id)?;
        let guard = shared.lock();
        let mut allocator = guard
            .try_borrow_mut()
            .map_err(|_| McPlusError::AllocatorInUse(id))?;
        let stats = allocator.stats();
        allocator.free();
        debug!(
            "Freed annotation allocator {} ({} records, {} with destructors, {} bytes)",
            id, stats.records, stats.live, stats.bytes_reserved
        );
        Ok(())
    }

    pub fn free_all(&self) -> McResult<()> {
        let ids: Vec<_> = self.allocators.read().keys().copied().collect();
        for id in ids {
            self.free(id)?;
        }
        Ok(())
    }

    /// Stats of allocator `id`, `None` if it does not exist or is being
    /// mutated by an enclosing closure.
    pub fn stats(&self, id: AllocatorId) -> Option<AllocatorStats> {
        let shared = self.get(id).ok()?;
        let guard = shared.lock();
        let stats = guard.try_borrow().ok()?.stats();
        Some(stats)
    }

    pub fn len(&self) -> usize {
        self.allocators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug)]
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handles_fit_a_slot_payload() {
        let handle = RecordHandle {
            allocator: u16::MAX,
            serial: SERIAL_MASK,
        };
        let payload = handle.to_payload();
        assert!(payload >= 0);
        assert!(payload < 1 << 55);
        assert_eq!(RecordHandle::from_payload(payload), Some(handle));
        assert_eq!(RecordHandle::from_payload(-1), None);
        assert_eq!(RecordHandle::from_payload(1 << 55), None);
    }

    #[test]
    fn free_runs_destructors_and_invalidates_handles() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut allocator = AnnotationAllocator::new(3, 0);
        let a = allocator.alloc(Counted(drops.clone())).unwrap();
        let b = allocator.alloc(vec![1u32, 2, 3]).unwrap();
        let c = allocator.alloc(7u64).unwrap();
        assert_eq!(allocator.stats().records, 3);
        assert_eq!(allocator.stats().live, 2);

        assert_eq!(allocator.get::<Vec<u32>>(b).unwrap(), &vec![1, 2, 3]);
        *allocator.get_mut::<u64>(c).unwrap() += 1;
        assert_eq!(*allocator.get::<u64>(c).unwrap(), 8);

        allocator.free();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            allocator.get::<Counted>(a),
            Err(McPlusError::StalePayload { allocator: 3 })
        ));

        let d = allocator.alloc(1u8).unwrap();
        assert_eq!(d.serial(), 3);
        assert_eq!(allocator.epoch(), 1);
        assert!(allocator.get::<u8>(a).is_err());
    }

    #[test]
    fn serials_are_never_reused() {
        let mut allocator = AnnotationAllocator::new(1, 0);
        let first = allocator.alloc(1u64).unwrap();
        for _ in 0..1000 {
            allocator.free();
        }
        let later = allocator.alloc(42u64).unwrap();
        assert_ne!(first.to_payload(), later.to_payload());
        assert!(matches!(
            allocator.get::<u64>(first),
            Err(McPlusError::StalePayload { allocator: 1 })
        ));
        assert_eq!(allocator.get::<u64>(later).unwrap(), &42);
    }

    #[test]
    fn running_out_of_serials_is_an_error() {
        let mut allocator = AnnotationAllocator::new(2, 0);
        allocator.first_serial = SERIAL_MASK;
        let last = allocator.alloc(0u8).unwrap();
        assert_eq!(last.serial(), SERIAL_MASK);
        assert!(matches!(
            allocator.alloc(1u8),
            Err(McPlusError::AllocatorExhausted(2))
        ));
    }

    #[test]
    fn type_confusion_is_rejected() {
        let mut allocator = AnnotationAllocator::new(0, 0);
        let handle = allocator.alloc(5u32).unwrap();
        assert!(matches!(
            allocator.get::<i64>(handle),
            Err(McPlusError::PayloadTypeMismatch { .. })
        ));
    }

    #[test]
    fn dropping_the_pool_drops_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pool = AllocatorPool::new(0);
            let id = pool.create().unwrap();
            pool.alloc(id, Counted(drops.clone())).unwrap();
            pool.alloc(DEFAULT_ALLOCATOR, Counted(drops.clone())).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
